use crate::cache::page::Page;
use crate::common::error::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Ordered, disjoint pages of one file, keyed by start offset, possibly
/// non-contiguous. Write conflicts are resolved per overlapped page: the
/// side with the newer mtime wins byte-for-byte.
pub struct CachedFile {
    path: String,
    scratch_dir: PathBuf,
    pages: BTreeMap<u64, Page>,
    mtime: i64,
    open: bool,
    dirty: bool,
}

impl CachedFile {
    pub fn new(path: &str, scratch_dir: PathBuf, mtime: i64) -> Self {
        Self {
            path: path.to_string(),
            scratch_dir,
            pages: BTreeMap::new(),
            mtime,
            open: false,
            dirty: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn set_mtime(&mut self, mtime: i64) {
        self.mtime = mtime;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Whether eviction or spill may touch this file
    pub fn is_pinned(&self) -> bool {
        self.open || self.dirty
    }

    /// Bytes currently resident in memory
    pub fn mem_bytes(&self) -> u64 {
        self.pages
            .values()
            .filter(|p| p.is_resident())
            .map(|p| p.len() as u64)
            .sum()
    }

    /// One past the last cached byte
    pub fn extent(&self) -> u64 {
        self.pages
            .values()
            .next_back()
            .map(|p| p.next())
            .unwrap_or(0)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn overlapping_keys(&self, start: u64, stop: u64) -> Vec<u64> {
        self.pages
            .range(..stop)
            .filter(|(_, p)| p.next() > start)
            .map(|(k, _)| *k)
            .collect()
    }

    /// All bytes of [offset, offset+len) resident?
    pub fn has(&self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        self.unloaded_ranges(offset, len).is_empty()
    }

    /// Complement of cached ranges within [start, start+len)
    pub fn unloaded_ranges(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        if len == 0 {
            return ranges;
        }
        let stop = start + len;
        let mut cursor = start;
        for key in self.overlapping_keys(start, stop) {
            let page = &self.pages[&key];
            if page.offset() > cursor {
                ranges.push((cursor, page.offset() - cursor));
            }
            cursor = cursor.max(page.next());
            if cursor >= stop {
                break;
            }
        }
        if cursor < stop {
            ranges.push((cursor, stop - cursor));
        }
        ranges
    }

    /// Apply a write. Overlapped pages with a newer mtime keep their bytes;
    /// everything else is replaced. Remnants of partially overwritten pages
    /// are re-inserted as memory pages. Returns the net change of resident
    /// bytes.
    pub fn write(&mut self, offset: u64, data: Bytes, mtime: i64, to_disk: bool) -> Result<i64> {
        if data.is_empty() {
            if mtime > self.mtime {
                self.mtime = mtime;
            }
            return Ok(0);
        }

        let stop = offset + data.len() as u64;
        let mut delta: i64 = 0;

        // Intervals of the incoming write still to apply; carved down by
        // overlapped pages that are newer than the write.
        let mut pending: Vec<(u64, u64)> = vec![(offset, stop)];

        for key in self.overlapping_keys(offset, stop) {
            let old = self.pages.remove(&key).unwrap();
            if old.is_resident() {
                delta -= old.len() as i64;
            }

            if old.mtime() > mtime {
                // The existing page wins over the incoming bytes
                pending = subtract(&pending, old.offset(), old.next());
                if old.is_resident() {
                    delta += old.len() as i64;
                }
                self.pages.insert(old.offset(), old);
                continue;
            }

            // The incoming bytes win; keep the old page's non-overlapped ends
            if old.offset() < offset {
                let left = old.slice(old.offset(), offset)?;
                delta += left.len() as i64;
                self.pages
                    .insert(old.offset(), Page::in_memory(old.offset(), left, old.mtime()));
            }
            if old.next() > stop {
                let right = old.slice(stop, old.next())?;
                delta += right.len() as i64;
                self.pages
                    .insert(stop, Page::in_memory(stop, right, old.mtime()));
            }
            old.remove_backing();
        }

        for (begin, end) in pending {
            let chunk = data.slice((begin - offset) as usize..(end - offset) as usize);
            let page = if to_disk {
                Page::on_disk(begin, &chunk, mtime, &self.scratch_dir)?
            } else {
                delta += chunk.len() as i64;
                Page::in_memory(begin, chunk, mtime)
            };
            self.pages.insert(begin, page);
        }

        if mtime > self.mtime {
            self.mtime = mtime;
        }
        Ok(delta)
    }

    /// Copy cached bytes of [offset, offset+buf.len()) into `buf`, zero
    /// clearing it first. Returns the byte count copied and the ranges that
    /// were not resident.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(usize, Vec<(u64, u64)>)> {
        if buf.is_empty() {
            return Ok((0, Vec::new()));
        }
        buf.fill(0);
        let stop = offset + buf.len() as u64;
        let mut copied = 0usize;
        for key in self.overlapping_keys(offset, stop) {
            let page = &self.pages[&key];
            let chunk = page.slice(offset, stop)?;
            let begin = (key.max(offset) - offset) as usize;
            buf[begin..begin + chunk.len()].copy_from_slice(&chunk);
            copied += chunk.len();
        }
        Ok((copied, self.unloaded_ranges(offset, buf.len() as u64)))
    }

    /// Truncate to `new_size`, dropping or trimming pages past the boundary.
    /// Growing is handled by the cache through a zero hole write. Returns
    /// the resident bytes released.
    pub fn truncate(&mut self, new_size: u64) -> Result<i64> {
        let mut delta: i64 = 0;
        let beyond: Vec<u64> = self
            .pages
            .range(new_size..)
            .map(|(k, _)| *k)
            .collect();
        for key in beyond {
            let page = self.pages.remove(&key).unwrap();
            if page.is_resident() {
                delta -= page.len() as i64;
            }
            page.remove_backing();
        }
        if let Some(key) = self.overlapping_keys(new_size, new_size + 1).first().copied() {
            let page = self.pages.remove(&key).unwrap();
            if page.is_resident() {
                delta -= page.len() as i64;
            }
            let kept = page.slice(page.offset(), new_size)?;
            delta += kept.len() as i64;
            let trimmed = Page::in_memory(page.offset(), kept, page.mtime());
            page.remove_backing();
            self.pages.insert(trimmed.offset(), trimmed);
        }
        Ok(delta)
    }

    /// Spill every resident page to the scratch directory; returns freed bytes
    pub fn spill_all(&mut self) -> Result<u64> {
        let mut freed = 0u64;
        for page in self.pages.values_mut() {
            freed += page.spill(&self.scratch_dir)? as u64;
        }
        Ok(freed)
    }

    /// Rekey the file after a rename, relocating any spilled pages
    pub fn relocate(&mut self, new_path: &str, new_scratch_dir: PathBuf) {
        if self.scratch_dir != new_scratch_dir && self.scratch_dir.exists() {
            if fs::rename(&self.scratch_dir, &new_scratch_dir).is_err() {
                tracing::warn!(
                    from = %self.scratch_dir.display(),
                    to = %new_scratch_dir.display(),
                    "failed to move scratch directory on rename"
                );
            }
        }
        self.path = new_path.to_string();
        self.scratch_dir = new_scratch_dir;
        for page in self.pages.values_mut() {
            page.relocate(&self.scratch_dir);
        }
    }

    /// Drop all pages and the scratch directory
    pub fn clear(&mut self) -> u64 {
        let freed = self.mem_bytes();
        self.pages.clear();
        if self.scratch_dir.exists() {
            let _ = fs::remove_dir_all(&self.scratch_dir);
        }
        freed
    }
}

fn subtract(intervals: &[(u64, u64)], from: u64, to: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    for &(begin, end) in intervals {
        if end <= from || begin >= to {
            out.push((begin, end));
            continue;
        }
        if begin < from {
            out.push((begin, from));
        }
        if end > to {
            out.push((to, end));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> (tempfile::TempDir, CachedFile) {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("f");
        (dir, CachedFile::new("/f", scratch, 0))
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"hello"), 1, false).unwrap();
        let mut buf = [0u8; 5];
        let (n, unloaded) = f.read(0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert!(unloaded.is_empty());
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_unloaded_ranges_between_pages() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"aa"), 1, false).unwrap();
        f.write(6, Bytes::from_static(b"bb"), 1, false).unwrap();
        assert_eq!(f.unloaded_ranges(0, 10), vec![(2, 4), (8, 2)]);
        assert!(f.has(0, 2));
        assert!(!f.has(0, 3));
    }

    #[test]
    fn test_later_write_wins() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"aaaa"), 1, false).unwrap();
        f.write(1, Bytes::from_static(b"bb"), 2, false).unwrap();
        let mut buf = [0u8; 4];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abba");
    }

    #[test]
    fn test_stale_write_loses() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"newer"), 5, false).unwrap();
        // a download that raced in late must not clobber fresher bytes
        f.write(0, Bytes::from_static(b"stale"), 3, false).unwrap();
        let mut buf = [0u8; 5];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"newer");
    }

    #[test]
    fn test_overlap_keeps_remnants() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"aaaaaaaa"), 1, false).unwrap();
        f.write(2, Bytes::from_static(b"bbb"), 2, false).unwrap();
        let mut buf = [0u8; 8];
        let (n, unloaded) = f.read(0, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert!(unloaded.is_empty());
        assert_eq!(&buf, b"aabbbaaa");
    }

    #[test]
    fn test_truncate_drops_and_trims() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"aaaa"), 1, false).unwrap();
        f.write(4, Bytes::from_static(b"bbbb"), 1, false).unwrap();
        f.truncate(2).unwrap();
        assert_eq!(f.extent(), 2);
        let mut buf = [0u8; 2];
        let (n, _) = f.read(0, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"aa");
    }

    #[test]
    fn test_spill_and_read_back() {
        let (_dir, mut f) = file();
        f.write(0, Bytes::from_static(b"spillme"), 1, false).unwrap();
        let freed = f.spill_all().unwrap();
        assert_eq!(freed, 7);
        assert_eq!(f.mem_bytes(), 0);
        let mut buf = [0u8; 7];
        let (n, _) = f.read(0, &mut buf).unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf, b"spillme");
    }
}
