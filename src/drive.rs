//! The filesystem facade: resolves paths against the local tree, decides
//! when to re-fetch metadata, dispatches reads and writes through the page
//! cache, and coordinates dirty-file upload. The drive is the only
//! component aware of the metadata store, the tree, the cache and the
//! transfer engine; none of them reference each other or the drive back.
//!
//! Locks are held for in-memory bookkeeping only. Every remote call happens
//! without a tree or metadata lock held; mutations are applied after the
//! call returns.

use crate::cache::Cache;
use crate::client::{BucketStats, ClientError, ObjectClient, StatOutcome};
use crate::common::config::Options;
use crate::common::error::{Error, Result};
use crate::common::path::{as_dir_path, normalize_path};
use crate::common::util::unix_now;
use crate::meta::{FileKind, MetaRecord, MetaStore};
use crate::transfer::TransferEngine;
use crate::tree::{DirectoryTree, Node};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct Drive {
    client: Arc<dyn ObjectClient>,
    meta: Arc<MetaStore>,
    tree: Arc<DirectoryTree>,
    cache: Arc<Cache>,
    engine: Arc<TransferEngine>,
    options: Options,
    uid: u32,
    gid: u32,
}

impl Drive {
    pub fn new(client: Arc<dyn ObjectClient>, options: Options, uid: u32, gid: u32) -> Self {
        let meta = Arc::new(MetaStore::new(options.meta_max_count));
        let tree = Arc::new(DirectoryTree::new(meta.clone(), uid, gid, options.root_mode));
        let cache = Arc::new(Cache::new(
            options.max_cache_bytes,
            options.scratch_dir.clone(),
        ));
        let engine = Arc::new(TransferEngine::new(client.clone(), cache.clone(), &options));
        Self {
            client,
            meta,
            tree,
            cache,
            engine,
            options,
            uid,
            gid,
        }
    }

    pub fn meta_store(&self) -> Arc<MetaStore> {
        self.meta.clone()
    }

    pub fn tree(&self) -> Arc<DirectoryTree> {
        self.tree.clone()
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.cache.clone()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Verify the bucket is reachable and warm the root level of the tree
    /// in the background. A drive that cannot connect refuses to mount.
    pub async fn connect(&self) -> Result<()> {
        self.client.head_bucket().await.map_err(Error::from)?;
        let drive = self.clone();
        tokio::spawn(async move {
            if let Err(e) = drive.refresh_directory("/").await {
                tracing::warn!(error = %e, "initial root listing failed");
            }
        });
        Ok(())
    }

    pub async fn statfs(&self) -> Result<BucketStats> {
        self.client.head_bucket().await.map_err(Error::from)
    }

    /// Tree lookup trying the file form first, then the directory form
    pub fn lookup_cached(&self, path: &str) -> Option<Arc<Node>> {
        self.tree.find(path).or_else(|| {
            if path.ends_with('/') {
                None
            } else {
                self.tree.find(&format!("{}/", path))
            }
        })
    }

    /// Resolve a path. A cached node is revalidated with a conditional stat
    /// (If-Modified-Since = node mtime); an absent one is stat'ed outright.
    /// A remote NotFound for a cached node prunes it locally, since the
    /// bucket may be mutated by other writers. When the caller asks, a
    /// changed or never-listed directory is refreshed, synchronously or in
    /// the background.
    ///
    /// Returns the node (if any) and whether the remote reported it modified.
    pub async fn get_node(
        &self,
        path: &str,
        update_if_dir: bool,
        update_dir_async: bool,
    ) -> Result<(Option<Arc<Node>>, bool)> {
        let path = normalize_path(path)?;
        let mut modified = false;

        let node = match self.lookup_cached(&path) {
            Some(node) => {
                let node_path = node.path();
                match self
                    .client
                    .stat_object(&node_path, Some(node.mtime()))
                    .await
                {
                    Ok(StatOutcome::NotModified) => {
                        self.meta.touch(&node_path);
                        Some(node)
                    }
                    Ok(StatOutcome::Found(record)) => {
                        modified = true;
                        Some(self.tree.grow(record))
                    }
                    Err(ClientError::NotFound(_)) => {
                        tracing::info!(path = %node_path, "object removed remotely, pruning local state");
                        self.tree.erase(&node_path, true);
                        self.cache.erase(&node_path);
                        None
                    }
                    Err(e) => {
                        tracing::warn!(path = %node_path, error = %e, "conditional stat failed, serving cached attributes");
                        Some(node)
                    }
                }
            }
            None => match self.client.stat_object(&path, None).await {
                Ok(StatOutcome::Found(record)) => Some(self.tree.grow(record)),
                Ok(StatOutcome::NotModified) => None,
                Err(ClientError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
        };

        if let Some(node) = &node {
            if update_if_dir && node.is_directory() && (modified || node.is_empty()) {
                let dir_path = node.path();
                if update_dir_async {
                    let drive = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = drive.refresh_directory(&dir_path).await {
                            tracing::warn!(path = %dir_path, error = %e, "background directory refresh failed");
                        }
                    });
                } else if let Err(e) = self.refresh_directory(&dir_path).await {
                    tracing::warn!(path = %dir_path, error = %e, "directory refresh failed");
                }
            }
        }

        Ok((node, modified))
    }

    /// Fetch a directory listing and reconcile the tree with it
    pub async fn refresh_directory(&self, dir_path: &str) -> Result<()> {
        let dir = as_dir_path(dir_path)?;
        let records = self
            .client
            .list_directory(&dir, self.options.list_objects_limit)
            .await
            .map_err(Error::from)?;
        self.tree.update_directory(&dir, records)?;
        Ok(())
    }

    /// Children of a directory, listing remotely first when the local view
    /// is stale or empty (or the caller forces it)
    pub async fn find_children(
        &self,
        dir_path: &str,
        force_refresh: bool,
    ) -> Result<Vec<Arc<Node>>> {
        let dir = as_dir_path(dir_path)?;
        let stale = match self.lookup_cached(&dir) {
            Some(node) => {
                if !node.is_directory() {
                    return Err(Error::NotADirectory(dir));
                }
                node.is_empty()
            }
            None => true,
        };
        if force_refresh || stale {
            self.refresh_directory(&dir).await?;
        }
        let node = self
            .lookup_cached(&dir)
            .ok_or_else(|| Error::NotFound(dir.clone()))?;
        if !node.is_directory() {
            return Err(Error::NotADirectory(dir));
        }
        Ok(self.tree.find_children(&dir))
    }

    /// Create a regular file remotely (then rehydrate its attributes in the
    /// background), or a special node locally only.
    pub async fn make_file(&self, path: &str, mode: u32, dev: u64) -> Result<()> {
        let path = normalize_path(path)?;
        if self.lookup_cached(&path).is_some() {
            return Err(Error::AlreadyExists(path));
        }

        let kind = kind_from_mode(mode);
        match kind {
            FileKind::Directory | FileKind::SymLink => {
                return Err(Error::InvalidArgument(
                    "directories and symlinks have their own operations".to_string(),
                ));
            }
            FileKind::File => {
                self.client.make_file(&path).await.map_err(Error::from)?;
                let mut record = MetaRecord::new(
                    &path,
                    0,
                    unix_now(),
                    self.uid,
                    self.gid,
                    permission_bits(mode, self.options.default_file_mode),
                    FileKind::File,
                );
                record.pending_create = true;
                self.tree.grow(record);
                tracing::debug!(path = %path, "created file");
                self.spawn_stat_refresh(&path);
            }
            special => {
                // block/char/FIFO/socket nodes exist only in the local tree
                let mut record = MetaRecord::new(
                    &path,
                    0,
                    unix_now(),
                    self.uid,
                    self.gid,
                    permission_bits(mode, self.options.default_file_mode),
                    special,
                );
                record.dev = dev;
                self.tree.grow(record);
                tracing::debug!(path = %path, kind = ?special, "created local-only special file");
            }
        }
        Ok(())
    }

    pub async fn make_dir(&self, path: &str, mode: u32) -> Result<()> {
        let dir = as_dir_path(path)?;
        if self.lookup_cached(&dir).is_some() {
            return Err(Error::AlreadyExists(dir));
        }
        self.client.make_directory(&dir).await.map_err(Error::from)?;
        let mut record = MetaRecord::directory(
            &dir,
            permission_bits(mode, self.options.default_dir_mode),
            unix_now(),
        );
        record.uid = self.uid;
        record.gid = self.gid;
        self.tree.grow(record);
        tracing::debug!(path = %dir, "created directory");
        self.spawn_stat_refresh(&dir);
        Ok(())
    }

    /// Mark a file open and start loading its content, in the background
    /// when `prefetch_async` is set
    pub async fn open_file(&self, path: &str, prefetch_async: bool) -> Result<()> {
        let (node, modified) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let file_path = node.path();
        let size = node.file_size();
        let mtime = node.mtime();

        if size == 0 {
            self.cache.write(&file_path, 0, &[], mtime)?;
        } else {
            if modified {
                self.cache.erase(&file_path);
            }
            let ranges = self.cache.unloaded_ranges(&file_path, 0, size);
            if !ranges.is_empty() {
                if prefetch_async {
                    let drive = self.clone();
                    let file_path = file_path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = drive.fetch_ranges(&file_path, ranges, mtime).await {
                            tracing::warn!(path = %file_path, error = %e, "background prefetch failed");
                        }
                    });
                } else {
                    self.fetch_ranges(&file_path, ranges, mtime).await?;
                }
            }
        }

        node.update_record(|r| r.file_open = true);
        self.cache.set_file_open(&file_path, true);
        Ok(())
    }

    /// Read up to `size` bytes at `offset` into `buf`. Missing ranges that
    /// intersect the request are downloaded synchronously; the rest of the
    /// file's unloaded tail is scheduled in the background.
    pub async fn read_file(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let (node, _) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let file_path = node.path();
        let file_size = node.file_size();
        if offset >= file_size {
            return Ok(0);
        }
        let len = size.min(file_size - offset).min(buf.len() as u64);
        if len == 0 {
            return Ok(0);
        }
        let mtime = node.mtime();

        let cache_time = self.cache.file_time(&file_path);
        if cache_time != 0 && mtime > cache_time {
            tracing::debug!(path = %file_path, "cached pages are stale, dropping them");
            self.cache.erase(&file_path);
        }

        let ranges = self.cache.unloaded_ranges(&file_path, offset, len);
        if !ranges.is_empty() {
            self.fetch_ranges(&file_path, ranges, mtime).await?;
        }

        // opportunistically pull the rest of the file in the background
        let tail = self.cache.unloaded_ranges(&file_path, 0, file_size);
        if !tail.is_empty() {
            let drive = self.clone();
            let tail_path = file_path.clone();
            tokio::spawn(async move {
                if let Err(e) = drive.fetch_ranges(&tail_path, tail, mtime).await {
                    tracing::debug!(path = %tail_path, error = %e, "tail prefetch failed");
                }
            });
        }

        let (copied, unloaded) = self
            .cache
            .read(&file_path, offset, &mut buf[..len as usize], mtime)?;
        if !unloaded.is_empty() {
            tracing::warn!(path = %file_path, ?unloaded, "ranges missing after synchronous fetch");
        }
        Ok(copied)
    }

    /// Write into the cache and mark the node dirty. The file must have
    /// been opened.
    pub async fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let path = normalize_path(path)?;
        let node = self
            .lookup_cached(&path)
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        if !node.meta().read().unwrap().file_open {
            return Err(Error::InvalidArgument(format!("{} is not open", path)));
        }

        let file_path = node.path();
        let now = unix_now();
        self.cache.write(&file_path, offset, data, now)?;
        self.cache.set_file_dirty(&file_path, true);
        node.update_record(|r| {
            r.dirty = true;
            r.mtime = now;
            let end = offset + data.len() as u64;
            if end > r.size {
                r.size = end;
            }
        });
        Ok(data.len())
    }

    /// Truncate or zero-extend; the change lives in the cache until flush
    pub async fn truncate_file(&self, path: &str, new_size: u64) -> Result<()> {
        let (node, _) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        if node.is_directory() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let file_path = node.path();
        if node.file_size() == new_size {
            return Ok(());
        }
        let now = unix_now();
        self.cache.resize(&file_path, new_size, now)?;
        self.cache.set_file_dirty(&file_path, true);
        node.update_record(|r| {
            r.size = new_size;
            r.dirty = true;
            r.mtime = now;
        });
        Ok(())
    }

    /// Store a symlink as a small object whose body is the target path
    pub async fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
        let link = normalize_path(link_path)?;
        if self.lookup_cached(&link).is_some() {
            return Err(Error::AlreadyExists(link));
        }
        self.client
            .put_object(&link, Bytes::copy_from_slice(target.as_bytes()))
            .await
            .map_err(Error::from)?;
        let record = MetaRecord::new(
            &link,
            target.len() as u64,
            unix_now(),
            self.uid,
            self.gid,
            0o777,
            FileKind::SymLink,
        );
        let node = self.tree.grow(record);
        node.set_symlink_target(target);
        tracing::debug!(link = %link, target = %target, "created symlink");
        Ok(())
    }

    /// Target of a symlink, fetching the backing object if not cached
    pub async fn read_symlink(&self, link_path: &str) -> Result<String> {
        let (node, _) = self.get_node(link_path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(link_path.to_string()))?;
        if let Some(target) = node.symlink_target() {
            return Ok(target);
        }
        let link = node.path();
        let data = self.client.read_object(&link).await.map_err(Error::from)?;
        let target = String::from_utf8(data.to_vec())
            .map_err(|_| Error::InvalidArgument(format!("{} target is not utf-8", link)))?;
        node.set_symlink_target(&target);
        Ok(target)
    }

    /// Local-only hard link; nothing is persisted remotely
    pub fn hard_link(&self, target_path: &str, link_path: &str) -> Result<()> {
        let target = normalize_path(target_path)?;
        let link = normalize_path(link_path)?;
        self.tree.hard_link(&target, &link)?;
        Ok(())
    }

    /// Move one file. Local state follows only after the remote move
    /// succeeded, so a local observer sees either the old or the new path,
    /// never both.
    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old = normalize_path(old_path)?;
        let new = normalize_path(new_path)?;
        if old == new {
            return Ok(());
        }

        self.client
            .move_file(&old, &new)
            .await
            .map_err(Error::from)?;
        self.cache.rename(&old, &new);
        if self.lookup_cached(&old).is_some() {
            self.tree.rename(&old, &new)?;
        }
        if let Err(e) = self.get_node(&new, false, false).await {
            tracing::warn!(path = %new, error = %e, "failed to refresh attributes after rename");
        }
        tracing::debug!(from = %old, to = %new, "renamed file");
        Ok(())
    }

    /// Move a directory: remote multi-object move, then drop the old local
    /// subtree and re-list the new one (in the background when asked).
    pub async fn rename_dir(
        &self,
        old_path: &str,
        new_path: &str,
        refresh_async: bool,
    ) -> Result<()> {
        let old_dir = as_dir_path(old_path)?;
        let new_dir = as_dir_path(new_path)?;
        if old_dir == new_dir {
            return Ok(());
        }

        self.client
            .move_directory(&old_dir, &new_dir)
            .await
            .map_err(Error::from)?;

        // carry cached pages over to the new keys
        if let Some(node) = self.lookup_cached(&old_dir) {
            for descendant in collect_subtree(&node) {
                let suffix = descendant[old_dir.len()..].to_string();
                if self.cache.has_file(&descendant) {
                    self.cache.rename(&descendant, &format!("{}{}", new_dir, suffix));
                }
            }
        }
        self.tree.erase(&old_dir, true);
        let (_, _) = self.get_node(&new_dir, true, refresh_async).await?;
        tracing::debug!(from = %old_dir, to = %new_dir, "renamed directory");
        Ok(())
    }

    /// Delete one file (remote delete in the background when asked)
    pub async fn remove_file(&self, path: &str, remote_async: bool) -> Result<()> {
        let path = normalize_path(path)?;
        if let Some(node) = self.lookup_cached(&path) {
            if node.is_directory() {
                return Err(Error::IsADirectory(path));
            }
        }

        if remote_async {
            let client = self.client.clone();
            let target = path.clone();
            tokio::spawn(async move {
                match client.delete_file(&target).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {
                        tracing::debug!(path = %target, "deleted file");
                    }
                    Err(e) => {
                        tracing::warn!(path = %target, error = %e, "background delete failed");
                    }
                }
            });
        } else {
            match self.client.delete_file(&path).await {
                Ok(()) | Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.tree.erase(&path, false);
        self.cache.erase(&path);
        Ok(())
    }

    /// Delete a directory. Non-recursive deletion of a non-empty directory
    /// is rejected; recursive deletion batches remote deletes.
    pub async fn remove_dir(&self, path: &str, recursive: bool, remote_async: bool) -> Result<()> {
        let dir = as_dir_path(path)?;
        let node = self
            .lookup_cached(&dir)
            .ok_or_else(|| Error::NotFound(dir.clone()))?;
        if !node.is_directory() {
            return Err(Error::NotADirectory(dir));
        }

        if !recursive && !node.is_empty() {
            return Err(Error::NotEmpty(dir));
        }

        let mut keys: Vec<String> = if recursive {
            collect_subtree(&node)
        } else {
            Vec::new()
        };
        keys.push(dir.clone());

        let limit = self.options.delete_multiple_limit;
        if remote_async {
            let client = self.client.clone();
            let batch_keys = keys.clone();
            tokio::spawn(async move {
                for chunk in batch_keys.chunks(limit.max(1)) {
                    if let Err(e) = client.delete_files(chunk).await {
                        tracing::warn!(error = %e, "background bulk delete failed");
                    }
                }
            });
        } else {
            for chunk in keys.chunks(limit.max(1)) {
                self.client.delete_files(chunk).await.map_err(Error::from)?;
            }
        }

        for key in &keys {
            self.cache.erase(key);
        }
        self.tree.erase(&dir, true);
        tracing::debug!(path = %dir, recursive, "removed directory");
        Ok(())
    }

    /// Flush a dirty file to the object store. Downloads any still-unloaded
    /// ranges first (a partial edit needs the rest of the object to build
    /// the full body), then uploads, clears the dirty and open flags, and
    /// evicts the file's pages so the next read fetches fresh bytes.
    pub async fn upload_file(&self, path: &str, flush_async: bool) -> Result<()> {
        let path = normalize_path(path)?;
        let node = self
            .lookup_cached(&path)
            .ok_or_else(|| Error::NotFound(path.clone()))?;
        if !node.is_dirty() {
            return Ok(());
        }

        node.update_record(|r| r.write_in_progress = true);
        if flush_async {
            let drive = self.clone();
            let node = node.clone();
            tokio::spawn(async move {
                let target = node.path();
                if let Err(e) = drive.flush_node(&node).await {
                    tracing::warn!(path = %target, error = %e, "background upload failed");
                }
            });
            Ok(())
        } else {
            self.flush_node(&node).await
        }
    }

    async fn flush_node(&self, node: &Arc<Node>) -> Result<()> {
        let file_path = node.path();
        let size = node.file_size();
        let mtime = node.mtime();

        let outcome = async {
            let ranges = self.cache.unloaded_ranges(&file_path, 0, size);
            if !ranges.is_empty() {
                self.fetch_ranges(&file_path, ranges, mtime).await?;
            }
            self.engine.upload(&file_path, size, mtime).await
        }
        .await;

        match outcome {
            Ok(handle) => {
                node.update_record(|r| {
                    r.dirty = false;
                    r.file_open = false;
                    r.write_in_progress = false;
                    if let Some(etag) = handle.etag() {
                        r.etag = etag;
                    }
                });
                self.cache.set_file_dirty(&file_path, false);
                self.cache.set_file_open(&file_path, false);
                self.cache.erase(&file_path);
                // pick up the authoritative mtime and etag
                match self.client.stat_object(&file_path, None).await {
                    Ok(StatOutcome::Found(record)) => {
                        self.tree.grow(record);
                    }
                    Ok(StatOutcome::NotModified) => {}
                    Err(e) => {
                        tracing::warn!(path = %file_path, error = %e, "stat after upload failed");
                    }
                }
                tracing::info!(path = %file_path, size, "uploaded file");
                Ok(())
            }
            Err(e) => {
                node.update_record(|r| r.write_in_progress = false);
                Err(e)
            }
        }
    }

    /// Change permission bits: applied locally, pushed to the backend when
    /// it supports metadata rewrite, kept dirty for a later rewrite if not.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let (node, _) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        node.update_record(|r| {
            r.mode = mode & 0o7777;
            r.ctime = unix_now();
        });
        self.push_metadata(&node).await;
        Ok(())
    }

    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let (node, _) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        node.update_record(|r| {
            if let Some(uid) = uid {
                r.uid = uid;
            }
            if let Some(gid) = gid {
                r.gid = gid;
            }
            r.ctime = unix_now();
        });
        self.push_metadata(&node).await;
        Ok(())
    }

    pub async fn utimens(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
        let (node, _) = self.get_node(path, false, false).await?;
        let node = node.ok_or_else(|| Error::NotFound(path.to_string()))?;
        node.update_record(|r| {
            if let Some(atime) = atime {
                r.atime = atime;
            }
            if let Some(mtime) = mtime {
                r.mtime = mtime;
            }
            r.ctime = unix_now();
        });
        self.push_metadata(&node).await;
        Ok(())
    }

    async fn push_metadata(&self, node: &Arc<Node>) {
        let record = node.record();
        match self.client.update_metadata(&record).await {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(path = %record.path, error = %e, "metadata rewrite not applied remotely, keeping local change");
                node.update_record(|r| r.dirty = true);
            }
        }
    }

    /// Abort unfinished multipart uploads and wipe the scratch directory
    pub async fn shutdown(&self) {
        tracing::info!("shutting down drive");
        self.engine.abort_all().await;
        self.cache.clear();
    }

    fn spawn_stat_refresh(&self, path: &str) {
        let drive = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            match drive.client.stat_object(&path, None).await {
                Ok(StatOutcome::Found(record)) => {
                    let node = drive.tree.grow(record);
                    node.update_record(|r| r.pending_create = false);
                }
                Ok(StatOutcome::NotModified) => {}
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "stat refresh after create failed");
                }
            }
        });
    }

    /// Download the given ranges into the cache, buffer-sized piece by
    /// piece. Used by the synchronous read path, open-time prefetch and the
    /// pre-upload fill.
    async fn fetch_ranges(&self, path: &str, ranges: Vec<(u64, u64)>, mtime: i64) -> Result<()> {
        let step = self.options.transfer_buf_size.max(1);
        for (offset, len) in ranges {
            let mut cursor = offset;
            let stop = offset + len;
            while cursor < stop {
                let piece = step.min(stop - cursor);
                if !self.cache.has(path, cursor, piece) {
                    let (_, data) = self.engine.download(path, cursor, piece).await?;
                    self.cache.write(path, cursor, &data, mtime)?;
                }
                cursor += piece;
            }
        }
        Ok(())
    }
}

/// All descendant paths of a directory node (children first ordering not
/// guaranteed; callers that care erase through the tree)
fn collect_subtree(node: &Arc<Node>) -> Vec<String> {
    let mut paths = Vec::new();
    let mut stack = node.children();
    while let Some(n) = stack.pop() {
        paths.push(n.path());
        stack.extend(n.children());
    }
    paths
}

fn kind_from_mode(mode: u32) -> FileKind {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileKind::Directory,
        libc::S_IFLNK => FileKind::SymLink,
        libc::S_IFBLK => FileKind::Block,
        libc::S_IFCHR => FileKind::Character,
        libc::S_IFIFO => FileKind::Fifo,
        libc::S_IFSOCK => FileKind::Socket,
        _ => FileKind::File,
    }
}

fn permission_bits(mode: u32, fallback: u32) -> u32 {
    let bits = mode & 0o7777;
    if bits == 0 {
        fallback
    } else {
        bits
    }
}
