//! In-memory bucket for testing and development

use crate::client::{
    compute_etag, BucketStats, ClientDefaults, ClientError, ClientResult, CompletedPart,
    ObjectClient, StatOutcome,
};
use crate::common::util::unix_now;
use crate::meta::{FileKind, MetaRecord};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mtime: i64,
    etag: String,
    uid: u32,
    gid: u32,
    mode: u32,
    kind: FileKind,
}

struct Upload {
    key: String,
    parts: BTreeMap<u16, (String, Bytes)>,
}

/// Per-operation call counts, for asserting on network traffic in tests
#[derive(Debug, Clone, Default)]
pub struct OpCounters {
    pub stats: u64,
    pub lists: u64,
    pub downloads: u64,
    pub puts: u64,
    pub deletes: u64,
    pub moves: u64,
    pub initiates: u64,
    pub parts: u64,
    pub completes: u64,
    pub aborts: u64,
    pub metadata_updates: u64,
}

struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, Upload>,
    counters: OpCounters,
    download_failures: VecDeque<ClientError>,
}

/// Object client over a plain map. Directory markers are stored explicitly
/// under their trailing-slash key; implicit directories are synthesized
/// from deeper keys during listing and stat, like a real bucket.
pub struct MemoryClient {
    state: Mutex<State>,
    defaults: ClientDefaults,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::with_defaults(ClientDefaults::default())
    }

    pub fn with_defaults(defaults: ClientDefaults) -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                uploads: HashMap::new(),
                counters: OpCounters::default(),
                download_failures: VecDeque::new(),
            }),
            defaults,
        }
    }

    /// Seed an object, as if another writer had put it in the bucket
    pub fn insert_object(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let object = StoredObject {
            data: Bytes::copy_from_slice(data),
            mtime: unix_now(),
            etag: compute_etag(data),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.file_mode,
            kind: FileKind::File,
        };
        state.objects.insert(path.to_string(), object);
    }

    pub fn insert_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let key = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let object = StoredObject {
            data: Bytes::new(),
            mtime: unix_now(),
            etag: String::new(),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.dir_mode,
            kind: FileKind::Directory,
        };
        state.objects.insert(key, object);
    }

    /// Raw body and etag of an object, for asserting on upload results
    pub fn object(&self, path: &str) -> Option<(Bytes, String)> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(path)
            .map(|o| (o.data.clone(), o.etag.clone()))
    }

    pub fn has_object(&self, path: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(path)
    }

    pub fn pending_upload_count(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn counters(&self) -> OpCounters {
        self.state.lock().unwrap().counters.clone()
    }

    /// Queue an error returned by upcoming download calls, oldest first
    pub fn push_download_failure(&self, error: ClientError) {
        self.state
            .lock()
            .unwrap()
            .download_failures
            .push_back(error);
    }

    fn record_for(&self, key: &str, object: &StoredObject) -> MetaRecord {
        let mut record = MetaRecord::new(
            key,
            object.data.len() as u64,
            object.mtime,
            object.uid,
            object.gid,
            object.mode,
            object.kind,
        );
        record.etag = object.etag.clone();
        record
    }

    fn synthesized_dir(&self, key: &str) -> MetaRecord {
        MetaRecord::new(
            key,
            0,
            0,
            self.defaults.uid,
            self.defaults.gid,
            self.defaults.dir_mode,
            FileKind::Directory,
        )
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for MemoryClient {
    async fn head_bucket(&self) -> ClientResult<BucketStats> {
        let state = self.state.lock().unwrap();
        let used: u64 = state.objects.values().map(|o| o.data.len() as u64).sum();
        Ok(BucketStats {
            total_bytes: used,
            available_bytes: u64::MAX / 2,
            object_count: state.objects.len() as u64,
        })
    }

    async fn stat_object(
        &self,
        path: &str,
        if_modified_since: Option<i64>,
    ) -> ClientResult<StatOutcome> {
        let mut state = self.state.lock().unwrap();
        state.counters.stats += 1;

        let dir_key = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };

        let found = state
            .objects
            .get(path)
            .map(|o| (path.to_string(), o.clone()))
            .or_else(|| {
                state
                    .objects
                    .get(&dir_key)
                    .map(|o| (dir_key.clone(), o.clone()))
            });

        if let Some((key, object)) = found {
            if let Some(since) = if_modified_since {
                if object.mtime <= since {
                    return Ok(StatOutcome::NotModified);
                }
            }
            return Ok(StatOutcome::Found(self.record_for(&key, &object)));
        }

        // implicit directory: some deeper key exists under the prefix
        let implicit = state
            .objects
            .range(dir_key.clone()..)
            .next()
            .map(|(k, _)| k.starts_with(&dir_key))
            .unwrap_or(false);
        if implicit {
            if if_modified_since.is_some() {
                return Ok(StatOutcome::NotModified);
            }
            return Ok(StatOutcome::Found(self.synthesized_dir(&dir_key)));
        }

        Err(ClientError::NotFound(path.to_string()))
    }

    async fn list_directory(
        &self,
        dir_path: &str,
        _page_limit: usize,
    ) -> ClientResult<Vec<MetaRecord>> {
        let mut state = self.state.lock().unwrap();
        state.counters.lists += 1;

        let prefix = if dir_path == "/" {
            "/".to_string()
        } else if dir_path.ends_with('/') {
            dir_path.to_string()
        } else {
            format!("{}/", dir_path)
        };

        let mut records = Vec::new();
        let mut listed: BTreeSet<String> = BTreeSet::new();
        let mut implicit_dirs: BTreeSet<String> = BTreeSet::new();

        for (key, object) in state.objects.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            match rest.find('/') {
                None => {
                    listed.insert(key.clone());
                    records.push(self.record_for(key, object));
                }
                Some(idx) if idx == rest.len() - 1 => {
                    listed.insert(key.clone());
                    records.push(self.record_for(key, object));
                }
                Some(idx) => {
                    implicit_dirs.insert(format!("{}{}/", prefix, &rest[..idx]));
                }
            }
        }

        for dir in implicit_dirs {
            if !listed.contains(&dir) {
                records.push(self.synthesized_dir(&dir));
            }
        }
        Ok(records)
    }

    async fn make_file(&self, path: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.puts += 1;
        let object = StoredObject {
            data: Bytes::new(),
            mtime: unix_now(),
            etag: compute_etag(b""),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.file_mode,
            kind: FileKind::File,
        };
        state.objects.insert(path.to_string(), object);
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.puts += 1;
        let key = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let object = StoredObject {
            data: Bytes::new(),
            mtime: unix_now(),
            etag: String::new(),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.dir_mode,
            kind: FileKind::Directory,
        };
        state.objects.insert(key, object);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.deletes += 1;
        if state.objects.remove(path).is_none() {
            return Err(ClientError::NotFound(path.to_string()));
        }
        Ok(())
    }

    async fn delete_files(&self, paths: &[String]) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.deletes += 1;
        for path in paths {
            state.objects.remove(path);
        }
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.moves += 1;
        let Some(object) = state.objects.remove(from) else {
            return Err(ClientError::NotFound(from.to_string()));
        };
        state.objects.insert(to.to_string(), object);
        Ok(())
    }

    async fn move_directory(&self, from: &str, to: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.moves += 1;
        let from_prefix = if from.ends_with('/') {
            from.to_string()
        } else {
            format!("{}/", from)
        };
        let to_prefix = if to.ends_with('/') {
            to.to_string()
        } else {
            format!("{}/", to)
        };
        let moved: Vec<String> = state
            .objects
            .range(from_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&from_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in moved {
            let object = state.objects.remove(&key).unwrap();
            let new_key = format!("{}{}", to_prefix, &key[from_prefix.len()..]);
            state.objects.insert(new_key, object);
        }
        Ok(())
    }

    async fn download_range(&self, path: &str, offset: u64, len: u64) -> ClientResult<Bytes> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.download_failures.pop_front() {
            return Err(error);
        }
        state.counters.downloads += 1;
        let Some(object) = state.objects.get(path) else {
            return Err(ClientError::NotFound(path.to_string()));
        };
        let size = object.data.len() as u64;
        if offset > size {
            return Err(ClientError::InvalidRange {
                path: path.to_string(),
                offset,
                len,
            });
        }
        let end = (offset + len).min(size);
        Ok(object.data.slice(offset as usize..end as usize))
    }

    async fn put_object(&self, path: &str, body: Bytes) -> ClientResult<String> {
        let mut state = self.state.lock().unwrap();
        state.counters.puts += 1;
        let etag = compute_etag(&body);
        let object = StoredObject {
            data: body,
            mtime: unix_now(),
            etag: etag.clone(),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.file_mode,
            kind: FileKind::File,
        };
        state.objects.insert(path.to_string(), object);
        Ok(etag)
    }

    async fn read_object(&self, path: &str) -> ClientResult<Bytes> {
        let mut state = self.state.lock().unwrap();
        state.counters.downloads += 1;
        state
            .objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| ClientError::NotFound(path.to_string()))
    }

    async fn initiate_multipart(&self, path: &str) -> ClientResult<String> {
        let mut state = self.state.lock().unwrap();
        state.counters.initiates += 1;
        let upload_id = Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                key: path.to_string(),
                parts: BTreeMap::new(),
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
        let mut state = self.state.lock().unwrap();
        state.counters.parts += 1;
        let etag = compute_etag(&body);
        let Some(upload) = state.uploads.get_mut(upload_id) else {
            return Err(ClientError::NotFound(format!("upload {}", upload_id)));
        };
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<String> {
        let mut state = self.state.lock().unwrap();
        state.counters.completes += 1;
        let Some(upload) = state.uploads.remove(upload_id) else {
            return Err(ClientError::NotFound(format!("upload {}", upload_id)));
        };
        if upload.key != path {
            return Err(ClientError::Storage(format!(
                "upload {} belongs to {}",
                upload_id, upload.key
            )));
        }
        let mut body = BytesMut::new();
        for part in parts {
            let Some((etag, data)) = upload.parts.get(&part.part_number) else {
                return Err(ClientError::Storage(format!(
                    "part {} was never uploaded",
                    part.part_number
                )));
            };
            if etag != &part.etag {
                return Err(ClientError::Storage(format!(
                    "part {} etag mismatch",
                    part.part_number
                )));
            }
            body.extend_from_slice(data);
        }
        let body = body.freeze();
        let etag = compute_etag(&body);
        let object = StoredObject {
            data: body,
            mtime: unix_now(),
            etag: etag.clone(),
            uid: self.defaults.uid,
            gid: self.defaults.gid,
            mode: self.defaults.file_mode,
            kind: FileKind::File,
        };
        state.objects.insert(path.to_string(), object);
        Ok(etag)
    }

    async fn abort_multipart(&self, _path: &str, upload_id: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.aborts += 1;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn update_metadata(&self, record: &MetaRecord) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.counters.metadata_updates += 1;
        let Some(object) = state.objects.get_mut(&record.path) else {
            return Err(ClientError::NotFound(record.path.clone()));
        };
        object.uid = record.uid;
        object.gid = record.gid;
        object.mode = record.mode;
        object.mtime = record.mtime;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stat_conditional() {
        let client = MemoryClient::new();
        client.insert_object("/a.txt", b"hello");
        let now = unix_now();

        match client.stat_object("/a.txt", None).await.unwrap() {
            StatOutcome::Found(rec) => assert_eq!(rec.size, 5),
            StatOutcome::NotModified => panic!("expected attributes"),
        }
        assert!(matches!(
            client.stat_object("/a.txt", Some(now)).await.unwrap(),
            StatOutcome::NotModified
        ));
        assert!(matches!(
            client.stat_object("/missing", None).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_implicit_directory() {
        let client = MemoryClient::new();
        client.insert_object("/a/b/c.txt", b"x");
        match client.stat_object("/a", None).await.unwrap() {
            StatOutcome::Found(rec) => {
                assert_eq!(rec.path, "/a/");
                assert!(rec.is_directory());
            }
            StatOutcome::NotModified => panic!("expected a directory"),
        }

        let listing = client.list_directory("/a/", 1000).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, "/a/b/");
        assert!(listing[0].is_directory());
    }

    #[tokio::test]
    async fn test_download_past_eof_is_invalid_range() {
        let client = MemoryClient::new();
        client.insert_object("/short", b"ab");
        let err = client.download_range("/short", 5, 1).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, ClientError::InvalidRange { offset: 5, .. }));
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_order() {
        let client = MemoryClient::new();
        let id = client.initiate_multipart("/big").await.unwrap();
        let e2 = client
            .upload_part("/big", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = client
            .upload_part("/big", &id, 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: e1,
            },
            CompletedPart {
                part_number: 2,
                etag: e2,
            },
        ];
        client.complete_multipart("/big", &id, &parts).await.unwrap();
        let (data, etag) = client.object("/big").unwrap();
        assert_eq!(data, Bytes::from_static(b"helloworld"));
        assert_eq!(etag, compute_etag(b"helloworld"));
        assert_eq!(client.pending_upload_count(), 0);
    }
}
