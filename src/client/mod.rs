//! Object-store abstraction the core consumes. Implementations translate
//! the contract onto a concrete backend; the drive performs all tree and
//! metadata mutation itself, so clients hold no references upward.

pub mod memory;
pub mod retry;
pub mod store;

use crate::common::error::Error as CoreError;
use crate::common::util::sha256_hex;
use crate::meta::MetaRecord;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryClient;
pub use retry::RetryPolicy;
pub use store::{StoreClient, StoreConfig};

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid range [offset:len={offset}:{len}] for {path}")]
    InvalidRange { path: String, offset: u64, len: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("not supported by backend: {0}")]
    Unsupported(String),

    #[error("remote returned {code}: {message}")]
    Http { code: u16, message: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ClientError {
    /// Whether a request failing with this error may be reissued.
    /// Auth failures, bad ranges and 4xx responses (other than 408/429)
    /// will not get better on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Storage(_) => true,
            ClientError::Http { code, .. } => {
                *code == 408 || *code == 429 || *code >= 500
            }
            ClientError::NotFound(_)
            | ClientError::Auth(_)
            | ClientError::InvalidRange { .. }
            | ClientError::Unsupported(_) => false,
        }
    }
}

impl From<ClientError> for CoreError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound(path) => CoreError::NotFound(path),
            ClientError::Auth(msg) => CoreError::PermissionDenied(msg),
            ClientError::InvalidRange { path, offset, len } => {
                CoreError::InvalidRange { path, offset, len }
            }
            ClientError::Timeout(msg) => CoreError::Timeout(msg),
            ClientError::Unsupported(msg) => CoreError::Remote {
                code: "unsupported".to_string(),
                message: msg,
            },
            ClientError::Http { code, message } => CoreError::Remote {
                code: code.to_string(),
                message,
            },
            ClientError::Storage(msg) => CoreError::Remote {
                code: "storage".to_string(),
                message: msg,
            },
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Filesystem-level view of the bucket, for statfs
#[derive(Debug, Clone, Default)]
pub struct BucketStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub object_count: u64,
}

/// Outcome of a conditional stat
#[derive(Debug, Clone)]
pub enum StatOutcome {
    /// The object has not changed since the caller's timestamp
    NotModified,
    /// Fresh attributes, either unconditional or actually modified
    Found(MetaRecord),
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u16,
    pub etag: String,
}

/// Ownership and mode bits a backend stamps onto records it synthesizes
#[derive(Debug, Clone, Copy)]
pub struct ClientDefaults {
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

/// Etag as computed on our side of the wire; backends that do not return
/// one (and the in-memory backend) derive it the same way so the engine can
/// verify an upload end to end.
pub fn compute_etag(data: &[u8]) -> String {
    sha256_hex(data)
}

/// The downward contract of the core. All paths are absolute; directory
/// paths carry a trailing slash.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_bucket(&self) -> ClientResult<BucketStats>;

    /// Attributes of one path. With `if_modified_since`, returns
    /// `NotModified` when the remote mtime is not newer.
    async fn stat_object(
        &self,
        path: &str,
        if_modified_since: Option<i64>,
    ) -> ClientResult<StatOutcome>;

    /// Immediate children of a directory, files and subdirectories both
    async fn list_directory(&self, dir_path: &str, page_limit: usize)
        -> ClientResult<Vec<MetaRecord>>;

    async fn make_file(&self, path: &str) -> ClientResult<()>;

    async fn make_directory(&self, path: &str) -> ClientResult<()>;

    async fn delete_file(&self, path: &str) -> ClientResult<()>;

    /// Bulk delete; callers batch to the configured limit
    async fn delete_files(&self, paths: &[String]) -> ClientResult<()>;

    async fn move_file(&self, from: &str, to: &str) -> ClientResult<()>;

    /// Move every object under the `from` prefix (copy + delete per object)
    async fn move_directory(&self, from: &str, to: &str) -> ClientResult<()>;

    async fn download_range(&self, path: &str, offset: u64, len: u64) -> ClientResult<Bytes>;

    /// Single-part upload of a full body; returns the resulting etag
    async fn put_object(&self, path: &str, body: Bytes) -> ClientResult<String>;

    /// Full body of a small object (symlink targets)
    async fn read_object(&self, path: &str) -> ClientResult<Bytes>;

    async fn initiate_multipart(&self, path: &str) -> ClientResult<String>;

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> ClientResult<String>;

    async fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<String>;

    async fn abort_multipart(&self, path: &str, upload_id: &str) -> ClientResult<()>;

    /// Rewrite an object's metadata in place (copy with replaced metadata).
    /// Backends without such an operation return `Unsupported`.
    async fn update_metadata(&self, record: &MetaRecord) -> ClientResult<()>;
}
