pub mod cache;
pub mod client;
pub mod common;
pub mod drive;
pub mod fuse;
pub mod meta;
pub mod transfer;
pub mod tree;

pub use common::{Error, MountConfig, Options, Result};
pub use drive::Drive;
pub use fuse::BucketFuse;
