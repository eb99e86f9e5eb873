use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid range [offset:len={offset}:{len}] for {path}")]
    InvalidRange { path: String, offset: u64, len: u64 },

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
