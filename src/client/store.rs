//! Object client over the `object_store` crate (S3, GCS, local disk,
//! in-memory). Directories are implicit prefixes on these backends: creating
//! one is a remote no-op and stat falls back to prefix probing.

use crate::client::{
    compute_etag, BucketStats, ClientDefaults, ClientError, ClientResult, CompletedPart,
    ObjectClient, StatOutcome,
};
use crate::meta::{FileKind, MetaRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{MultipartUpload, ObjectMeta, ObjectStore, PutPayload};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Backend selection, straight from the mount configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Amazon S3 or an S3-compatible endpoint
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },

    /// Google Cloud Storage
    Gcs {
        bucket: String,
        #[serde(default)]
        service_account_path: Option<String>,
    },

    /// Local filesystem (for testing)
    Local { root_path: String },

    /// In-memory storage (for testing)
    Memory,
}

impl StoreConfig {
    pub fn build(&self) -> ClientResult<Arc<dyn ObjectStore>> {
        match self {
            StoreConfig::S3 {
                bucket,
                region,
                access_key_id,
                secret_access_key,
                endpoint,
            } => {
                use object_store::aws::AmazonS3Builder;

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region);

                if let Some(key_id) = access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                if let Some(ep) = endpoint {
                    builder = builder.with_endpoint(ep);
                    // MinIO and other custom endpoints
                    if ep.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                    builder = builder.with_virtual_hosted_style_request(false);
                }

                let store = builder
                    .build()
                    .map_err(|e| ClientError::Storage(format!("failed to create S3 store: {}", e)))?;
                Ok(Arc::new(store))
            }

            StoreConfig::Gcs {
                bucket,
                service_account_path,
            } => {
                use object_store::gcp::GoogleCloudStorageBuilder;

                let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
                if let Some(sa_path) = service_account_path {
                    builder = builder.with_service_account_path(sa_path);
                }
                let store = builder.build().map_err(|e| {
                    ClientError::Storage(format!("failed to create GCS store: {}", e))
                })?;
                Ok(Arc::new(store))
            }

            StoreConfig::Local { root_path } => {
                use object_store::local::LocalFileSystem;

                let store = LocalFileSystem::new_with_prefix(root_path).map_err(|e| {
                    ClientError::Storage(format!("failed to create local store: {}", e))
                })?;
                Ok(Arc::new(store))
            }

            StoreConfig::Memory => {
                use object_store::memory::InMemory;
                Ok(Arc::new(InMemory::new()))
            }
        }
    }
}

struct UploadSession {
    key: String,
    upload: Box<dyn MultipartUpload>,
    // parts must reach the store in part-number order; out-of-order
    // arrivals wait here for their predecessors
    next_part: u16,
    buffered: BTreeMap<u16, Bytes>,
}

pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    defaults: ClientDefaults,
    uploads: Mutex<HashMap<String, UploadSession>>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, defaults: ClientDefaults) -> Self {
        Self {
            store,
            defaults,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StoreConfig, defaults: ClientDefaults) -> ClientResult<Self> {
        Ok(Self::new(config.build()?, defaults))
    }

    fn object_path(path: &str) -> ObjectPath {
        ObjectPath::from(path.trim_matches('/'))
    }

    fn dir_key(path: &str) -> String {
        if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        }
    }

    fn file_record(&self, meta: &ObjectMeta) -> MetaRecord {
        let mut record = MetaRecord::new(
            &format!("/{}", meta.location),
            meta.size,
            meta.last_modified.timestamp(),
            self.defaults.uid,
            self.defaults.gid,
            self.defaults.file_mode,
            FileKind::File,
        );
        record.etag = meta.e_tag.clone().unwrap_or_default();
        record
    }

    fn dir_record(&self, key: &str, mtime: i64) -> MetaRecord {
        MetaRecord::new(
            key,
            0,
            mtime,
            self.defaults.uid,
            self.defaults.gid,
            self.defaults.dir_mode,
            FileKind::Directory,
        )
    }

    /// Does anything exist under the directory prefix?
    async fn probe_directory(&self, dir_key: &str) -> ClientResult<bool> {
        if dir_key == "/" {
            return Ok(true);
        }
        let prefix = Self::object_path(dir_key);
        let listing = self
            .store
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(map_store_error)?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }
}

fn map_store_error(e: object_store::Error) -> ClientError {
    match e {
        object_store::Error::NotFound { path, .. } => ClientError::NotFound(format!("/{}", path)),
        other => ClientError::Storage(other.to_string()),
    }
}

#[async_trait]
impl ObjectClient for StoreClient {
    async fn head_bucket(&self) -> ClientResult<BucketStats> {
        // one cheap listing proves the bucket is reachable and readable
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(map_store_error)?;
        Ok(BucketStats {
            total_bytes: 0,
            available_bytes: u64::MAX / 2,
            object_count: 0,
        })
    }

    async fn stat_object(
        &self,
        path: &str,
        if_modified_since: Option<i64>,
    ) -> ClientResult<StatOutcome> {
        if !path.ends_with('/') {
            match self.store.head(&Self::object_path(path)).await {
                Ok(meta) => {
                    if let Some(since) = if_modified_since {
                        if meta.last_modified.timestamp() <= since {
                            return Ok(StatOutcome::NotModified);
                        }
                    }
                    return Ok(StatOutcome::Found(self.file_record(&meta)));
                }
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_store_error(e)),
            }
        }

        let dir_key = Self::dir_key(path);
        if self.probe_directory(&dir_key).await? {
            if if_modified_since.is_some() {
                // prefixes carry no mtime of their own
                return Ok(StatOutcome::NotModified);
            }
            return Ok(StatOutcome::Found(self.dir_record(&dir_key, 0)));
        }
        Err(ClientError::NotFound(path.to_string()))
    }

    async fn list_directory(
        &self,
        dir_path: &str,
        _page_limit: usize,
    ) -> ClientResult<Vec<MetaRecord>> {
        let prefix = if dir_path == "/" {
            None
        } else {
            Some(Self::object_path(dir_path))
        };
        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .map_err(map_store_error)?;

        let mut records = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for meta in &listing.objects {
            records.push(self.file_record(meta));
        }
        for prefix in &listing.common_prefixes {
            records.push(self.dir_record(&format!("/{}/", prefix), 0));
        }
        Ok(records)
    }

    async fn make_file(&self, path: &str) -> ClientResult<()> {
        self.store
            .put(&Self::object_path(path), PutPayload::new())
            .await
            .map_err(map_store_error)?;
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> ClientResult<()> {
        // directories are implicit prefixes on object stores
        tracing::trace!(path = %path, "directory creation is local-only on this backend");
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> ClientResult<()> {
        self.store
            .delete(&Self::object_path(path))
            .await
            .map_err(map_store_error)
    }

    async fn delete_files(&self, paths: &[String]) -> ClientResult<()> {
        for path in paths {
            match self.store.delete(&Self::object_path(path)).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_store_error(e)),
            }
        }
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> ClientResult<()> {
        self.store
            .rename(&Self::object_path(from), &Self::object_path(to))
            .await
            .map_err(map_store_error)
    }

    async fn move_directory(&self, from: &str, to: &str) -> ClientResult<()> {
        let from_key = Self::dir_key(from);
        let to_key = Self::dir_key(to);
        let prefix = Self::object_path(&from_key);
        let objects: Vec<ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(map_store_error)?;
        for meta in objects {
            let source = format!("/{}", meta.location);
            let target = format!("{}{}", to_key, &source[from_key.len()..]);
            self.store
                .rename(&meta.location, &Self::object_path(&target))
                .await
                .map_err(map_store_error)?;
        }
        Ok(())
    }

    async fn download_range(&self, path: &str, offset: u64, len: u64) -> ClientResult<Bytes> {
        self.store
            .get_range(&Self::object_path(path), offset..offset + len)
            .await
            .map_err(map_store_error)
    }

    async fn put_object(&self, path: &str, body: Bytes) -> ClientResult<String> {
        let etag = compute_etag(&body);
        let result = self
            .store
            .put(&Self::object_path(path), PutPayload::from_bytes(body))
            .await
            .map_err(map_store_error)?;
        Ok(result.e_tag.unwrap_or(etag))
    }

    async fn read_object(&self, path: &str) -> ClientResult<Bytes> {
        let result = self
            .store
            .get(&Self::object_path(path))
            .await
            .map_err(map_store_error)?;
        result.bytes().await.map_err(map_store_error)
    }

    async fn initiate_multipart(&self, path: &str) -> ClientResult<String> {
        let upload = self
            .store
            .put_multipart(&Self::object_path(path))
            .await
            .map_err(map_store_error)?;
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.lock().await.insert(
            upload_id.clone(),
            UploadSession {
                key: path.to_string(),
                upload,
                next_part: 1,
                buffered: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _path: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> ClientResult<String> {
        let etag = compute_etag(&body);
        let mut uploads = self.uploads.lock().await;
        let Some(session) = uploads.get_mut(upload_id) else {
            return Err(ClientError::NotFound(format!("upload {}", upload_id)));
        };
        session.buffered.insert(part_number, body);
        while let Some(data) = session.buffered.remove(&session.next_part) {
            session
                .upload
                .put_part(PutPayload::from_bytes(data))
                .await
                .map_err(map_store_error)?;
            session.next_part += 1;
        }
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        _parts: &[CompletedPart],
    ) -> ClientResult<String> {
        let mut uploads = self.uploads.lock().await;
        let Some(mut session) = uploads.remove(upload_id) else {
            return Err(ClientError::NotFound(format!("upload {}", upload_id)));
        };
        drop(uploads);
        if session.key != path {
            return Err(ClientError::Storage(format!(
                "upload {} belongs to {}",
                upload_id, session.key
            )));
        }
        while let Some(data) = session.buffered.remove(&session.next_part) {
            session
                .upload
                .put_part(PutPayload::from_bytes(data))
                .await
                .map_err(map_store_error)?;
            session.next_part += 1;
        }
        let result = session.upload.complete().await.map_err(map_store_error)?;
        Ok(result.e_tag.unwrap_or_default())
    }

    async fn abort_multipart(&self, _path: &str, upload_id: &str) -> ClientResult<()> {
        let mut uploads = self.uploads.lock().await;
        if let Some(mut session) = uploads.remove(upload_id) {
            drop(uploads);
            session.upload.abort().await.map_err(map_store_error)?;
        }
        Ok(())
    }

    async fn update_metadata(&self, record: &MetaRecord) -> ClientResult<()> {
        Err(ClientError::Unsupported(format!(
            "metadata rewrite for {}",
            record.path
        )))
    }
}
