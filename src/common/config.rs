use crate::common::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::client::store::StoreConfig;

/// Options consumed by the core: cache budgets, transfer thresholds,
/// retry parameters and the scratch directory for spilled pages.
#[derive(Debug, Deserialize, Clone)]
pub struct Options {
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
    #[serde(default = "default_transfer_buf_size")]
    pub transfer_buf_size: u64,
    #[serde(default = "default_multipart_upload_threshold")]
    pub multipart_upload_threshold: u64,
    #[serde(default = "default_multipart_download_threshold")]
    pub multipart_download_threshold: u64,
    #[serde(default = "default_max_parallel_transfers")]
    pub max_parallel_transfers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_scale_factor_ms")]
    pub retry_scale_factor_ms: u64,
    #[serde(default = "default_meta_max_count")]
    pub meta_max_count: usize,
    #[serde(default = "default_list_objects_limit")]
    pub list_objects_limit: usize,
    #[serde(default = "default_delete_multiple_limit")]
    pub delete_multiple_limit: usize,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_file_mode")]
    pub default_file_mode: u32,
    #[serde(default = "default_dir_mode")]
    pub default_dir_mode: u32,
    #[serde(default = "default_root_mode")]
    pub root_mode: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_cache_bytes: default_max_cache_bytes(),
            transfer_buf_size: default_transfer_buf_size(),
            multipart_upload_threshold: default_multipart_upload_threshold(),
            multipart_download_threshold: default_multipart_download_threshold(),
            max_parallel_transfers: default_max_parallel_transfers(),
            max_retries: default_max_retries(),
            retry_scale_factor_ms: default_retry_scale_factor_ms(),
            meta_max_count: default_meta_max_count(),
            list_objects_limit: default_list_objects_limit(),
            delete_multiple_limit: default_delete_multiple_limit(),
            scratch_dir: default_scratch_dir(),
            default_file_mode: default_file_mode(),
            default_dir_mode: default_dir_mode(),
            root_mode: default_root_mode(),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.transfer_buf_size == 0 {
            return Err(Error::InvalidArgument(
                "transfer_buf_size must be > 0".to_string(),
            ));
        }
        if self.max_parallel_transfers == 0 {
            return Err(Error::InvalidArgument(
                "max_parallel_transfers must be > 0".to_string(),
            ));
        }
        if self.list_objects_limit == 0 || self.list_objects_limit > 1000 {
            return Err(Error::InvalidArgument(
                "list_objects_limit must be in 1..=1000".to_string(),
            ));
        }
        if self.delete_multiple_limit == 0 || self.delete_multiple_limit > 200 {
            return Err(Error::InvalidArgument(
                "delete_multiple_limit must be in 1..=200".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level mount configuration: which bucket to mount and the core options.
#[derive(Debug, Deserialize, Clone)]
pub struct MountConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub options: Options,
}

impl MountConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let cfg: MountConfig = toml::from_str(&content)
            .map_err(|e| Error::InvalidArgument(format!("bad config {}: {}", path, e)))?;
        cfg.options.validate()?;
        Ok(cfg)
    }
}

fn default_max_cache_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_transfer_buf_size() -> u64 {
    10 * 1024 * 1024
}

fn default_multipart_upload_threshold() -> u64 {
    20 * 1024 * 1024
}

fn default_multipart_download_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_max_parallel_transfers() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_scale_factor_ms() -> u64 {
    25
}

fn default_meta_max_count() -> usize {
    10_000
}

fn default_list_objects_limit() -> usize {
    1000
}

fn default_delete_multiple_limit() -> usize {
    200
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("bucketfs-cache")
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_dir_mode() -> u32 {
    0o755
}

fn default_root_mode() -> u32 {
    0o777
}
