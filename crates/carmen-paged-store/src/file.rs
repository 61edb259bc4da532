//! A page-addressed flat file: the bottom layer every page pool reads
//! through and writes back to.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::page::{Page, PageId, PAGE_SIZE};

/// The largest gap this crate will zero-fill in one write when extending a
/// file past its current length.
const MAX_FILL_CHUNK: usize = 256 * 1024;

/// A single flat file addressed in fixed-size pages.
///
/// Reads past the current end of file return a zeroed page rather than
/// erroring, matching the semantics of a sparse, ever-growing backing
/// store. Writes that extend the file zero-fill the gap first so that a
/// later read of an untouched page never observes stale bytes.
pub struct RawFile {
    path: PathBuf,
    file: File,
    len_pages: u64,
}

impl RawFile {
    /// Opens (creating if necessary) the file at `path` for paged access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let byte_len = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        Ok(Self {
            len_pages: byte_len.div_ceil(PAGE_SIZE as u64),
            path,
            file,
        })
    }

    /// Number of pages currently backed by the file.
    pub fn len_pages(&self) -> u64 {
        self.len_pages
    }

    /// Reads the page at `id`. A page at or beyond the current end of file
    /// reads back as all-zero without touching the file.
    pub fn read_page(&mut self, id: PageId) -> Result<Page, StoreError> {
        if id >= self.len_pages {
            return Ok(Page::zeroed());
        }
        let mut page = Page::zeroed();
        self.file
            .seek(SeekFrom::Start(id * PAGE_SIZE as u64))
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .read_exact(page.as_bytes_mut())
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(page)
    }

    /// Writes `page` at `id`, zero-filling any gap between the current end
    /// of file and `id` first.
    pub fn write_page(&mut self, id: PageId, page: &Page) -> Result<(), StoreError> {
        self.extend_to(id)?;
        self.file
            .seek(SeekFrom::Start(id * PAGE_SIZE as u64))
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .write_all(page.as_bytes())
            .map_err(|e| StoreError::io(&self.path, e))?;
        if id >= self.len_pages {
            self.len_pages = id + 1;
        }
        Ok(())
    }

    fn extend_to(&mut self, id: PageId) -> Result<(), StoreError> {
        if id < self.len_pages {
            return Ok(());
        }
        let gap_pages = id - self.len_pages;
        if gap_pages == 0 {
            return Ok(());
        }
        let zeros = vec![0u8; MAX_FILL_CHUNK.min(gap_pages as usize * PAGE_SIZE)];
        self.file
            .seek(SeekFrom::Start(self.len_pages * PAGE_SIZE as u64))
            .map_err(|e| StoreError::io(&self.path, e))?;
        let mut remaining = gap_pages as usize * PAGE_SIZE;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            self.file
                .write_all(&zeros[..chunk])
                .map_err(|e| StoreError::io(&self.path, e))?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Flushes any OS-buffered writes to disk.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.file.flush().map_err(|e| StoreError::io(&self.path, e))?;
        self.file.sync_all().map_err(|e| StoreError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_end_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = RawFile::open(dir.path().join("data")).unwrap();
        let page = f.read_page(7).unwrap();
        assert_eq!(page.as_bytes(), &[0u8; PAGE_SIZE]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = RawFile::open(dir.path().join("data")).unwrap();
        let mut page = Page::zeroed();
        page.as_bytes_mut()[0] = 0xab;
        f.write_page(3, &page).unwrap();
        let read_back = f.read_page(3).unwrap();
        assert_eq!(read_back.as_bytes()[0], 0xab);
    }

    #[test]
    fn write_extends_with_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = RawFile::open(dir.path().join("data")).unwrap();
        let page = Page::from_slice(&[1u8; 16]);
        f.write_page(5, &page).unwrap();
        assert_eq!(f.len_pages(), 6);
        for id in 0..5 {
            assert_eq!(f.read_page(id).unwrap().as_bytes(), &[0u8; PAGE_SIZE]);
        }
    }

    #[test]
    fn reopen_preserves_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let mut f = RawFile::open(&path).unwrap();
            f.write_page(2, &Page::zeroed()).unwrap();
            f.flush().unwrap();
        }
        let f = RawFile::open(&path).unwrap();
        assert_eq!(f.len_pages(), 3);
    }
}
