use crate::common::path::{as_dir_path, is_root};
use crate::common::util::unix_now;
use std::sync::{Arc, RwLock};

/// File type of a record. Special kinds (block, character, FIFO, socket)
/// exist only in the local tree and are never persisted remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    SymLink,
    Block,
    Character,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            FileKind::Block | FileKind::Character | FileKind::Fifo | FileKind::Socket
        )
    }
}

/// Attribute record for one path. Directory paths always carry a
/// trailing slash; the root is "/".
#[derive(Debug, Clone)]
pub struct MetaRecord {
    pub path: String,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    /// Last metadata change (rename, chmod, chown)
    pub ctime: i64,
    pub cached_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub kind: FileKind,
    pub mime_type: String,
    pub etag: String,
    pub encrypted: bool,
    pub dev: u64,
    pub num_links: u32,

    pub dirty: bool,
    pub write_in_progress: bool,
    pub file_open: bool,
    pub pending_get: bool,
    pub pending_create: bool,
}

/// Shared handle to a record. The store and the tree node referencing the
/// same path hold clones of the same handle, so updates through either are
/// visible to both.
pub type MetaHandle = Arc<RwLock<MetaRecord>>;

impl MetaRecord {
    pub fn new(
        path: &str,
        size: u64,
        mtime: i64,
        uid: u32,
        gid: u32,
        mode: u32,
        kind: FileKind,
    ) -> Self {
        let path = if kind == FileKind::Directory && !is_root(path) {
            as_dir_path(path).unwrap_or_else(|_| path.to_string())
        } else {
            path.to_string()
        };
        let num_links = if kind == FileKind::Directory { 2 } else { 1 };
        Self {
            path,
            size,
            atime: mtime,
            mtime,
            ctime: mtime,
            cached_time: unix_now(),
            uid,
            gid,
            mode,
            kind,
            mime_type: String::new(),
            etag: String::new(),
            encrypted: false,
            dev: 0,
            num_links,
            dirty: false,
            write_in_progress: false,
            file_open: false,
            pending_get: false,
            pending_create: false,
        }
    }

    pub fn directory(path: &str, mode: u32, mtime: i64) -> Self {
        Self::new(path, 0, mtime, 0, 0, mode, FileKind::Directory)
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::SymLink
    }

    pub fn into_handle(self) -> MetaHandle {
        Arc::new(RwLock::new(self))
    }

    /// Overwrite the remote-derived fields from a freshly fetched record,
    /// keeping local state (link count, dirty/open flags) intact.
    pub fn absorb(&mut self, fresh: MetaRecord) {
        self.path = fresh.path;
        self.size = fresh.size;
        self.atime = fresh.atime;
        self.mtime = fresh.mtime;
        self.ctime = fresh.ctime;
        self.cached_time = fresh.cached_time;
        self.uid = fresh.uid;
        self.gid = fresh.gid;
        self.mode = fresh.mode;
        self.kind = fresh.kind;
        self.mime_type = fresh.mime_type;
        self.etag = fresh.etag;
        self.encrypted = fresh.encrypted;
        self.dev = fresh.dev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_path_canonicalized() {
        let rec = MetaRecord::directory("/a/b", 0o755, 10);
        assert_eq!(rec.path, "/a/b/");
        assert_eq!(rec.num_links, 2);
        assert!(rec.is_directory());
    }

    #[test]
    fn test_file_record() {
        let rec = MetaRecord::new("/a/b.txt", 5, 10, 1000, 1000, 0o644, FileKind::File);
        assert_eq!(rec.path, "/a/b.txt");
        assert_eq!(rec.num_links, 1);
        assert_eq!(rec.ctime, rec.mtime);
        assert!(!rec.dirty);
    }
}
