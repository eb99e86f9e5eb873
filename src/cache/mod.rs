pub mod cache;
pub mod file;
pub mod page;

pub use cache::Cache;
pub use file::CachedFile;
pub use page::{Page, PageBody};
