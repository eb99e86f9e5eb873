use crate::common::error::{Error, Result};
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};

/// Body of a cached page: resident bytes, or a scratch file once spilled.
/// Bodies are immutable after the page is built; a newer write replaces the
/// page object instead of mutating it.
#[derive(Debug)]
pub enum PageBody {
    Mem(Bytes),
    Disk(PathBuf),
}

/// One contiguous cached byte range of a file.
#[derive(Debug)]
pub struct Page {
    offset: u64,
    len: usize,
    mtime: i64,
    body: PageBody,
}

impl Page {
    pub fn in_memory(offset: u64, data: Bytes, mtime: i64) -> Self {
        Self {
            offset,
            len: data.len(),
            mtime,
            body: PageBody::Mem(data),
        }
    }

    /// Build a page directly on disk under `dir`, named by its offset.
    pub fn on_disk(offset: u64, data: &[u8], mtime: i64, dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(offset.to_string());
        fs::write(&file, data)?;
        Ok(Self {
            offset,
            len: data.len(),
            mtime,
            body: PageBody::Disk(file),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte this page covers
    pub fn next(&self) -> u64 {
        self.offset + self.len as u64
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, PageBody::Mem(_))
    }

    /// Full page body, reading the scratch file back when spilled.
    /// A scratch read failure surfaces as an error, never as zeros.
    pub fn bytes(&self) -> Result<Bytes> {
        match &self.body {
            PageBody::Mem(data) => Ok(data.clone()),
            PageBody::Disk(file) => {
                let data = fs::read(file)?;
                if data.len() != self.len {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "scratch page {} is {} bytes, expected {}",
                            file.display(),
                            data.len(),
                            self.len
                        ),
                    )));
                }
                Ok(Bytes::from(data))
            }
        }
    }

    /// Bytes of [from, to) in absolute file coordinates, clamped to the page
    pub fn slice(&self, from: u64, to: u64) -> Result<Bytes> {
        let from = from.max(self.offset);
        let to = to.min(self.next());
        if from >= to {
            return Ok(Bytes::new());
        }
        let data = self.bytes()?;
        let begin = (from - self.offset) as usize;
        let end = (to - self.offset) as usize;
        Ok(data.slice(begin..end))
    }

    /// Move a resident body to a scratch file under `dir`; returns the bytes
    /// released from memory. Spilled pages pass through unchanged.
    pub fn spill(&mut self, dir: &Path) -> Result<usize> {
        let data = match &self.body {
            PageBody::Mem(data) => data.clone(),
            PageBody::Disk(_) => return Ok(0),
        };
        fs::create_dir_all(dir)?;
        let file = dir.join(self.offset.to_string());
        fs::write(&file, &data)?;
        self.body = PageBody::Disk(file);
        Ok(data.len())
    }

    /// Point a spilled page at a relocated scratch directory (file rename)
    pub fn relocate(&mut self, dir: &Path) {
        if let PageBody::Disk(file) = &mut self.body {
            *file = dir.join(self.offset.to_string());
        }
    }

    /// Drop the scratch file of a spilled page
    pub fn remove_backing(&self) {
        if let PageBody::Disk(file) = &self.body {
            let _ = fs::remove_file(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_page_slice() {
        let page = Page::in_memory(10, Bytes::from_static(b"helloworld"), 1);
        assert_eq!(page.next(), 20);
        assert_eq!(page.slice(10, 15).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(page.slice(15, 99).unwrap(), Bytes::from_static(b"world"));
        assert_eq!(page.slice(0, 10).unwrap(), Bytes::new());
    }

    #[test]
    fn test_spill_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = Page::in_memory(4, Bytes::from_static(b"abcd"), 1);
        let freed = page.spill(dir.path()).unwrap();
        assert_eq!(freed, 4);
        assert!(!page.is_resident());
        assert_eq!(page.bytes().unwrap(), Bytes::from_static(b"abcd"));
        // spilling twice is a no-op
        assert_eq!(page.spill(dir.path()).unwrap(), 0);
    }
}
