pub mod config;
pub mod error;
pub mod path;
pub mod util;

pub use config::{MountConfig, Options};
pub use error::{Error, Result};
pub use path::*;
