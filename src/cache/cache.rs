use crate::cache::file::CachedFile;
use crate::common::error::{Error, Result};
use crate::common::util::sha256_hex;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// File -> pages with a global byte budget. When resident bytes would exceed
/// the budget, the coldest unpinned files are spilled whole to the scratch
/// directory; files that are open or dirty stay resident until flushed.
///
/// Scratch layout: `<scratch_root>/<sha256(path)>/<page offset>`.
pub struct Cache {
    inner: Mutex<Inner>,
    capacity: u64,
    scratch_root: PathBuf,
}

struct Inner {
    files: HashMap<String, CachedFile>,
    // front = most recently used
    recency: VecDeque<String>,
    mem_bytes: u64,
}

impl Cache {
    pub fn new(capacity: u64, scratch_root: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                recency: VecDeque::new(),
                mem_bytes: 0,
            }),
            capacity,
            scratch_root,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().unwrap().mem_bytes
    }

    pub fn file_count(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }

    pub fn has_free_space(&self, need: u64) -> bool {
        self.bytes_used() + need <= self.capacity
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    pub fn has(&self, path: &str, offset: u64, len: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.files.get(path) {
            Some(file) => file.has(offset, len),
            None => len == 0,
        }
    }

    pub fn file_time(&self, path: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner.files.get(path).map(|f| f.mtime()).unwrap_or(0)
    }

    /// Complement of cached ranges within [offset, offset+len)
    pub fn unloaded_ranges(&self, path: &str, offset: u64, len: u64) -> Vec<(u64, u64)> {
        if len == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock().unwrap();
        match inner.files.get(path) {
            Some(file) => file.unloaded_ranges(offset, len),
            None => vec![(offset, len)],
        }
    }

    /// Write bytes at an offset. Creates the file entry on first touch and
    /// promotes it; frees budget by spilling cold files first, and lands the
    /// incoming page on disk when memory cannot be freed.
    pub fn write(&self, path: &str, offset: u64, data: &[u8], mtime: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.ensure_file(&mut inner, path, mtime);
        promote(&mut inner, path);

        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;
        let mut to_disk = false;
        if inner.mem_bytes + len > self.capacity {
            self.free_locked(&mut inner, len, path);
            if inner.mem_bytes + len > self.capacity {
                tracing::debug!(path = %path, len, "no memory budget left, writing page to scratch");
                to_disk = true;
            }
        }

        let file = inner.files.get_mut(path).unwrap();
        let delta = match file.write(offset, Bytes::copy_from_slice(data), mtime, to_disk) {
            Ok(delta) => delta,
            Err(Error::Io(io)) if to_disk => {
                return Err(Error::OutOfSpace(format!(
                    "scratch write failed for {}: {}",
                    path, io
                )));
            }
            Err(e) => return Err(e),
        };
        inner.mem_bytes = (inner.mem_bytes as i64 + delta).max(0) as u64;
        Ok(())
    }

    /// Read into `buf`, zero-clearing it first. `mtime_since` guards against
    /// stale pages: a cache entry older than the caller's view of the file
    /// is reported entirely unloaded.
    pub fn read(
        &self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
        mtime_since: i64,
    ) -> Result<(usize, Vec<(u64, u64)>)> {
        let mut inner = self.inner.lock().unwrap();
        let len = buf.len() as u64;
        if !inner.files.contains_key(path) {
            self.ensure_file(&mut inner, path, mtime_since);
            return Ok((0, vec![(offset, len)]));
        }
        promote(&mut inner, path);
        let file = inner.files.get_mut(path).unwrap();

        if mtime_since > 0 {
            if file.mtime() == 0 {
                file.set_mtime(mtime_since);
            } else if mtime_since > file.mtime() {
                tracing::warn!(
                    path = %path,
                    file_time = %crate::common::util::format_timestamp(file.mtime()),
                    since = %crate::common::util::format_timestamp(mtime_since),
                    "cached pages are older than the file, reporting them unloaded"
                );
                return Ok((0, vec![(offset, len)]));
            }
        }

        file.read(offset, buf)
    }

    /// Truncate or zero-extend a file to `new_size`
    pub fn resize(&self, path: &str, new_size: u64, mtime: i64) -> Result<()> {
        let extent = {
            let mut inner = self.inner.lock().unwrap();
            self.ensure_file(&mut inner, path, mtime);
            let file = inner.files.get_mut(path).unwrap();
            let extent = file.extent();
            if new_size < extent {
                let delta = file.truncate(new_size)?;
                file.set_mtime(mtime);
                inner.mem_bytes = (inner.mem_bytes as i64 + delta).max(0) as u64;
                return Ok(());
            }
            extent
        };
        if new_size > extent {
            // fill the hole with zeros
            let hole = vec![0u8; (new_size - extent) as usize];
            self.write(path, extent, &hole, mtime)?;
        }
        Ok(())
    }

    /// Drop a file's pages and its scratch directory. Idempotent.
    pub fn erase(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut file) = inner.files.remove(path) {
            let freed = file.clear();
            inner.mem_bytes = inner.mem_bytes.saturating_sub(freed);
            inner.recency.retain(|p| p != path);
        }
    }

    /// Rekey a cached file; an entry already at `new` is dropped first
    pub fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut existing) = inner.files.remove(new) {
            let freed = existing.clear();
            inner.mem_bytes = inner.mem_bytes.saturating_sub(freed);
            inner.recency.retain(|p| p != new);
        }
        if let Some(mut file) = inner.files.remove(old) {
            file.relocate(new, self.scratch_dir_for(new));
            inner.files.insert(new.to_string(), file);
            for p in inner.recency.iter_mut() {
                if p == old {
                    *p = new.to_string();
                }
            }
            promote(&mut inner, new);
        }
    }

    pub fn set_file_open(&self, path: &str, open: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.files.get_mut(path) {
            file.set_open(open);
        }
    }

    pub fn set_file_dirty(&self, path: &str, dirty: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.files.get_mut(path) {
            file.set_dirty(dirty);
        }
    }

    pub fn set_file_time(&self, path: &str, mtime: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.files.get_mut(path) {
            file.set_mtime(mtime);
        }
    }

    /// Drop everything, including the scratch root
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, mut file) in inner.files.drain() {
            file.clear();
        }
        inner.recency.clear();
        inner.mem_bytes = 0;
        if self.scratch_root.exists() {
            let _ = fs::remove_dir_all(&self.scratch_root);
        }
    }

    fn scratch_dir_for(&self, path: &str) -> PathBuf {
        self.scratch_root.join(sha256_hex(path.as_bytes()))
    }

    fn ensure_file(&self, inner: &mut Inner, path: &str, mtime: i64) {
        if !inner.files.contains_key(path) {
            let file = CachedFile::new(path, self.scratch_dir_for(path), mtime);
            inner.files.insert(path.to_string(), file);
            inner.recency.push_front(path.to_string());
        }
    }

    /// Spill coldest unpinned files until `need` more bytes fit in memory.
    /// `unfreeable` (the file being written) is never spilled here.
    fn free_locked(&self, inner: &mut Inner, need: u64, unfreeable: &str) {
        if need > self.capacity {
            tracing::debug!(need, capacity = self.capacity, "write larger than the whole budget");
            return;
        }
        let order: Vec<String> = inner.recency.iter().rev().cloned().collect();
        let mut freed = 0u64;
        for path in order {
            if inner.mem_bytes + need <= self.capacity {
                break;
            }
            if path == unfreeable {
                continue;
            }
            let Some(file) = inner.files.get_mut(&path) else {
                continue;
            };
            if file.is_pinned() || file.mem_bytes() == 0 {
                continue;
            }
            match file.spill_all() {
                Ok(bytes) => {
                    freed += bytes;
                    inner.mem_bytes = inner.mem_bytes.saturating_sub(bytes);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to spill file to scratch");
                }
            }
        }
        if freed > 0 {
            tracing::debug!(freed, "spilled cold files to scratch");
        }
    }
}

fn promote(inner: &mut Inner, path: &str) {
    if let Some(pos) = inner.recency.iter().position(|p| p == path) {
        if pos != 0 {
            inner.recency.remove(pos);
            inner.recency.push_front(path.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: u64) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(capacity, dir.path().join("scratch"));
        (dir, cache)
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, cache) = cache(1024);
        cache.write("/f", 0, b"helloworld", 1).unwrap();
        let mut buf = [0u8; 5];
        let (n, unloaded) = cache.read("/f", 5, &mut buf, 1).unwrap();
        assert_eq!(n, 5);
        assert!(unloaded.is_empty());
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_unknown_file_reports_unloaded() {
        let (_dir, cache) = cache(1024);
        let mut buf = [0u8; 4];
        let (n, unloaded) = cache.read("/nope", 0, &mut buf, 0).unwrap();
        assert_eq!(n, 0);
        assert_eq!(unloaded, vec![(0, 4)]);
    }

    #[test]
    fn test_budget_spills_coldest_file() {
        let (_dir, cache) = cache(8);
        cache.write("/cold", 0, b"aaaa", 1).unwrap();
        cache.write("/hot", 0, b"bbbb", 1).unwrap();
        // over budget: the cold file is spilled, not dropped
        cache.write("/hot", 4, b"cccc", 2).unwrap();
        assert!(cache.bytes_used() <= 8);
        let mut buf = [0u8; 4];
        let (n, _) = cache.read("/cold", 0, &mut buf, 1).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"aaaa");
    }

    #[test]
    fn test_dirty_file_is_not_spilled() {
        let (_dir, cache) = cache(8);
        cache.write("/dirty", 0, b"aaaa", 1).unwrap();
        cache.set_file_dirty("/dirty", true);
        cache.write("/other", 0, b"bbbbbb", 1).unwrap();
        // the dirty file kept its resident pages
        assert!(cache.bytes_used() >= 4);
        let mut buf = [0u8; 4];
        let (n, _) = cache.read("/dirty", 0, &mut buf, 1).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_resize_zero_extends_and_truncates() {
        let (_dir, cache) = cache(1024);
        cache.write("/f", 0, b"ab", 1).unwrap();
        cache.resize("/f", 5, 2).unwrap();
        let mut buf = [0u8; 5];
        let (n, unloaded) = cache.read("/f", 0, &mut buf, 2).unwrap();
        assert_eq!(n, 5);
        assert!(unloaded.is_empty());
        assert_eq!(&buf, b"ab\0\0\0");

        cache.resize("/f", 1, 3).unwrap();
        assert!(cache.has("/f", 0, 1));
        assert!(!cache.has("/f", 0, 2));
    }

    #[test]
    fn test_rename_moves_pages() {
        let (_dir, cache) = cache(1024);
        cache.write("/old", 0, b"data", 1).unwrap();
        cache.rename("/old", "/new");
        assert!(!cache.has_file("/old"));
        let mut buf = [0u8; 4];
        let (n, _) = cache.read("/new", 0, &mut buf, 1).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_erase_is_idempotent() {
        let (_dir, cache) = cache(1024);
        cache.write("/f", 0, b"data", 1).unwrap();
        cache.erase("/f");
        cache.erase("/f");
        assert_eq!(cache.bytes_used(), 0);
        assert!(!cache.has_file("/f"));
    }

    #[test]
    fn test_stale_cache_reported_unloaded() {
        let (_dir, cache) = cache(1024);
        cache.write("/f", 0, b"old!", 5).unwrap();
        let mut buf = [0u8; 4];
        let (n, unloaded) = cache.read("/f", 0, &mut buf, 9).unwrap();
        assert_eq!(n, 0);
        assert_eq!(unloaded, vec![(0, 4)]);
    }
}
