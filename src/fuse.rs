use crate::common::error::Error;
use crate::common::path::join_child;
use crate::drive::Drive;
use crate::meta::{FileKind, MetaRecord};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{c_int, EACCES, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOSPC, ENOTDIR, ENOTEMPTY, ETIMEDOUT};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    RwLock,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// FUSE binding over the drive: inode bookkeeping, argument translation and
/// errno mapping. All filesystem semantics live in the drive.
pub struct BucketFuse {
    drive: Drive,
    rt: Runtime,
    inode_map: RwLock<HashMap<String, u64>>,
    reverse_map: RwLock<HashMap<u64, String>>,
    next_ino: AtomicU64,
}

impl BucketFuse {
    pub fn new(drive: Drive) -> Self {
        let rt = Runtime::new().expect("tokio runtime");
        let mut inode_map = HashMap::new();
        let mut reverse_map = HashMap::new();
        inode_map.insert("/".to_string(), 1);
        reverse_map.insert(1, "/".to_string());
        Self {
            drive,
            rt,
            inode_map: RwLock::new(inode_map),
            reverse_map: RwLock::new(reverse_map),
            next_ino: AtomicU64::new(2),
        }
    }

    /// Head the bucket before mounting; an unreachable bucket refuses to
    /// mount rather than surfacing EIO on every operation
    pub fn connect(&self) -> crate::common::error::Result<()> {
        self.rt.block_on(async { self.drive.connect().await })
    }

    pub fn mount(self, mountpoint: &str) -> anyhow::Result<()> {
        let options = [
            MountOption::FSName("bucketfs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];
        fuser::mount2(self, mountpoint, &options)?;
        Ok(())
    }

    fn ensure_inode(&self, path: &str) -> u64 {
        if let Some(ino) = self.inode_map.read().unwrap().get(path) {
            return *ino;
        }
        let mut map = self.inode_map.write().unwrap();
        if let Some(ino) = map.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        map.insert(path.to_string(), ino);
        self.reverse_map
            .write()
            .unwrap()
            .insert(ino, path.to_string());
        ino
    }

    fn path_for_ino(&self, ino: u64) -> Option<String> {
        self.reverse_map.read().unwrap().get(&ino).cloned()
    }

    fn forget_path(&self, path: &str) {
        let mut map = self.inode_map.write().unwrap();
        if let Some(ino) = map.remove(path) {
            self.reverse_map.write().unwrap().remove(&ino);
        }
    }

    fn file_attr(&self, ino: u64, record: &MetaRecord) -> FileAttr {
        let kind = match record.kind {
            FileKind::File => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
            FileKind::SymLink => FileType::Symlink,
            FileKind::Block => FileType::BlockDevice,
            FileKind::Character => FileType::CharDevice,
            FileKind::Fifo => FileType::NamedPipe,
            FileKind::Socket => FileType::Socket,
        };
        FileAttr {
            ino,
            size: record.size,
            blocks: record.size / 512 + 1,
            atime: to_system_time(record.atime),
            mtime: to_system_time(record.mtime),
            ctime: to_system_time(record.ctime),
            crtime: to_system_time(record.ctime),
            kind,
            perm: (record.mode & 0o7777) as u16,
            nlink: record.num_links,
            uid: record.uid,
            gid: record.gid,
            rdev: record.dev as u32,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn stat_path(&self, path: &str) -> Result<MetaRecord, c_int> {
        let res = self
            .rt
            .block_on(async { self.drive.get_node(path, true, true).await });
        match res {
            Ok((Some(node), _)) => Ok(node.record()),
            Ok((None, _)) => Err(ENOENT),
            Err(e) => Err(errno_for(&e)),
        }
    }
}

impl Filesystem for BucketFuse {
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(record) => reply.attr(&TTL, &self.file_attr(ino, &record)),
            Err(errno) => reply.error(errno),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let Ok(child_path) = join_child(&parent_path, &name) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.get_node(&child_path, false, true).await });
        match res {
            Ok((Some(node), _)) => {
                let ino = self.ensure_inode(&node.path());
                reply.entry(&TTL, &self.file_attr(ino, &node.record()), 0);
            }
            Ok((None, _)) => reply.error(ENOENT),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.find_children(&path, false).await });
        let children = match res {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno_for(&e));
                return;
            }
        };

        let mut all = Vec::with_capacity(children.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        all.push((ino, FileType::Directory, "..".to_string()));
        for node in children {
            let record = node.record();
            let child_ino = self.ensure_inode(&record.path);
            let name = record
                .path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string();
            let kind = if record.is_directory() {
                FileType::Directory
            } else if record.is_symlink() {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            all.push((child_ino, kind, name));
        }

        let start = if offset < 0 { 0 } else { offset as usize };
        for (i, (child_ino, kind, name)) in all.into_iter().enumerate().skip(start) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let Ok(path) = join_child(&parent_path, &name) else {
            reply.error(EINVAL);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.make_dir(&path, mode).await });
        if let Err(e) = res {
            reply.error(errno_for(&e));
            return;
        }
        match self.stat_path(&path) {
            Ok(record) => {
                let ino = self.ensure_inode(&record.path.clone());
                reply.entry(&TTL, &self.file_attr(ino, &record), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let Ok(path) = join_child(&parent_path, &name) else {
            reply.error(EINVAL);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.make_file(&path, mode, rdev as u64).await });
        if let Err(e) = res {
            reply.error(errno_for(&e));
            return;
        }
        match self.drive.lookup_cached(&path) {
            Some(node) => {
                let ino = self.ensure_inode(&node.path());
                reply.entry(&TTL, &self.file_attr(ino, &node.record()), 0);
            }
            None => reply.error(EIO),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let Ok(path) = join_child(&parent_path, &name) else {
            reply.error(EINVAL);
            return;
        };
        let res = self.rt.block_on(async {
            self.drive.make_file(&path, mode, 0).await?;
            self.drive.open_file(&path, true).await
        });
        if let Err(e) = res {
            reply.error(errno_for(&e));
            return;
        }
        match self.drive.lookup_cached(&path) {
            Some(node) => {
                let ino = self.ensure_inode(&node.path());
                reply.created(&TTL, &self.file_attr(ino, &node.record()), 0, 0, 0);
            }
            None => reply.error(EIO),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.open_file(&path, true).await });
        match res {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let res = self.rt.block_on(async {
            self.drive
                .read_file(&path, offset as u64, size as u64, &mut buf)
                .await
        });
        match res {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.write_file(&path, offset as u64, data).await });
        match res {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };

        let res = self.rt.block_on(async {
            if let Some(new_size) = size {
                self.drive.truncate_file(&path, new_size).await?;
            }
            if let Some(mode) = mode {
                self.drive.chmod(&path, mode).await?;
            }
            if uid.is_some() || gid.is_some() {
                self.drive.chown(&path, uid, gid).await?;
            }
            if atime.is_some() || mtime.is_some() {
                self.drive
                    .utimens(&path, atime.map(time_or_now), mtime.map(time_or_now))
                    .await?;
            }
            Ok::<(), Error>(())
        });
        if let Err(e) = res {
            reply.error(errno_for(&e));
            return;
        }
        match self.drive.lookup_cached(&path) {
            Some(node) => reply.attr(&TTL, &self.file_attr(ino, &node.record())),
            None => reply.error(ENOENT),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) =
            (self.path_for_ino(parent), self.path_for_ino(newparent))
        else {
            reply.error(ENOENT);
            return;
        };
        let (Ok(old_path), Ok(new_path)) = (
            join_child(&parent_path, &name.to_string_lossy()),
            join_child(&newparent_path, &newname.to_string_lossy()),
        ) else {
            reply.error(EINVAL);
            return;
        };

        let is_dir = self
            .drive
            .lookup_cached(&old_path)
            .map(|n| n.is_directory())
            .unwrap_or(false);
        let res = self.rt.block_on(async {
            if is_dir {
                self.drive.rename_dir(&old_path, &new_path, false).await
            } else {
                self.drive.rename_file(&old_path, &new_path).await
            }
        });
        match res {
            Ok(()) => {
                self.forget_path(&old_path);
                reply.ok();
            }
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Ok(path) = join_child(&parent_path, &name.to_string_lossy()) else {
            reply.error(EINVAL);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.remove_file(&path, false).await });
        match res {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Ok(path) = join_child(&parent_path, &name.to_string_lossy()) else {
            reply.error(EINVAL);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.remove_dir(&path, false, false).await });
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Ok(link_path) = join_child(&parent_path, &link_name.to_string_lossy()) else {
            reply.error(EINVAL);
            return;
        };
        let target = target.to_string_lossy().to_string();
        let res = self
            .rt
            .block_on(async { self.drive.symlink(&target, &link_path).await });
        if let Err(e) = res {
            reply.error(errno_for(&e));
            return;
        }
        match self.drive.lookup_cached(&link_path) {
            Some(node) => {
                let ino = self.ensure_inode(&node.path());
                reply.entry(&TTL, &self.file_attr(ino, &node.record()), 0);
            }
            None => reply.error(EIO),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.read_symlink(&path).await });
        match res {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(target_path), Some(parent_path)) =
            (self.path_for_ino(ino), self.path_for_ino(newparent))
        else {
            reply.error(ENOENT);
            return;
        };
        let Ok(link_path) = join_child(&parent_path, &newname.to_string_lossy()) else {
            reply.error(EINVAL);
            return;
        };
        if let Err(e) = self.drive.hard_link(&target_path, &link_path) {
            reply.error(errno_for(&e));
            return;
        }
        match self.drive.lookup_cached(&link_path) {
            Some(node) => {
                let link_ino = self.ensure_inode(&link_path);
                reply.entry(&TTL, &self.file_attr(link_ino, &node.record()), 0);
            }
            None => reply.error(EIO),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let res = self
            .rt
            .block_on(async { self.drive.upload_file(&path, false).await });
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.ok();
            return;
        };
        let res = self.rt.block_on(async {
            self.drive.upload_file(&path, false).await?;
            if let Some(node) = self.drive.lookup_cached(&path) {
                node.update_record(|r| r.file_open = false);
                self.drive.cache().set_file_open(&node.path(), false);
            }
            Ok::<(), Error>(())
        });
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let res = self.rt.block_on(async { self.drive.statfs().await });
        match res {
            Ok(stats) => {
                let bsize = BLOCK_SIZE as u64;
                let blocks = (stats.total_bytes + stats.available_bytes) / bsize;
                let free = stats.available_bytes / bsize;
                reply.statfs(blocks, free, free, stats.object_count, u64::MAX, BLOCK_SIZE, 255, BLOCK_SIZE);
            }
            Err(e) => reply.error(errno_for(&e)),
        }
    }

    fn destroy(&mut self) {
        self.rt.block_on(async { self.drive.shutdown().await });
    }
}

fn errno_for(error: &Error) -> c_int {
    match error {
        Error::NotFound(_) => ENOENT,
        Error::PermissionDenied(_) => EACCES,
        Error::InvalidArgument(_) => EINVAL,
        Error::NotADirectory(_) => ENOTDIR,
        Error::IsADirectory(_) => EISDIR,
        Error::NotEmpty(_) => ENOTEMPTY,
        Error::AlreadyExists(_) => EEXIST,
        Error::InvalidRange { .. } => EINVAL,
        Error::OutOfSpace(_) => ENOSPC,
        Error::Timeout(_) => ETIMEDOUT,
        Error::Io(_)
        | Error::TransferFailed(_)
        | Error::Cancelled(_)
        | Error::Remote { .. } => EIO,
    }
}

fn to_system_time(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

fn time_or_now(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(st) => st
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => crate::common::util::unix_now(),
    }
}
