//! The page manager: allocation on top of a [`PagePool`].

use crate::error::StoreError;
use crate::file::RawFile;
use crate::page::{Page, PageId};
use crate::pool::{EvictionPolicy, LruEvictionPolicy, PagePool};
use std::path::Path;

/// Owns a page pool and an allocation cursor, handing out fresh page ids
/// on request and otherwise delegating straight through to the pool.
pub struct PageManager<E: EvictionPolicy = LruEvictionPolicy> {
    pool: PagePool<E>,
    next_id: PageId,
}

impl PageManager<LruEvictionPolicy> {
    /// Opens the file at `path`, sizing the pool to hold `capacity` pages
    /// resident at a time.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let file = RawFile::open(path)?;
        let next_id = file.len_pages();
        Ok(Self {
            pool: PagePool::new(file, capacity),
            next_id,
        })
    }
}

impl<E: EvictionPolicy> PageManager<E> {
    /// Opens with a caller-supplied eviction policy.
    pub fn with_policy(path: impl AsRef<Path>, capacity: usize, policy: E) -> Result<Self, StoreError> {
        let file = RawFile::open(path)?;
        let next_id = file.len_pages();
        Ok(Self {
            pool: PagePool::with_policy(file, capacity, policy),
            next_id,
        })
    }

    /// Allocates a fresh, zeroed page and returns its id. The page is
    /// resident and marked dirty; callers write into it via
    /// [`get_mut`](Self::get_mut).
    pub fn allocate(&mut self) -> Result<PageId, StoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.pool.get_mut(id)?;
        self.pool.mark_dirty(id);
        Ok(id)
    }

    /// The id that would be handed out by the next [`allocate`](Self::allocate) call.
    pub fn next_id(&self) -> PageId {
        self.next_id
    }

    /// Overrides the allocation cursor, e.g. when re-opening a structure
    /// whose own metadata records how many pages it has allocated.
    pub fn restore_next_id(&mut self, next_id: PageId) {
        self.next_id = next_id;
    }

    /// Reads the page at `id`.
    pub fn get(&mut self, id: PageId) -> Result<&Page, StoreError> {
        self.pool.get(id)
    }

    /// Mutably accesses the page at `id`. Does not implicitly mark it
    /// dirty; call [`mark_dirty`](Self::mark_dirty) after writing.
    pub fn get_mut(&mut self, id: PageId) -> Result<&mut Page, StoreError> {
        self.pool.get_mut(id)
    }

    /// Marks `id` as holding unwritten changes.
    pub fn mark_dirty(&mut self, id: PageId) {
        self.pool.mark_dirty(id);
    }

    /// Flushes every dirty resident page to disk.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.pool.flush()
    }

    /// Flushes and releases resident pages.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.pool.close()
    }

    /// Registers a hook invoked just after a page is loaded into the pool.
    pub fn on_after_load(&mut self, hook: impl FnMut(PageId, &Page) + Send + 'static) {
        self.pool.on_after_load(hook);
    }

    /// Registers a hook invoked just before a resident page is evicted.
    pub fn on_before_evict(&mut self, hook: impl FnMut(PageId, &Page) + Send + 'static) {
        self.pool.on_before_evict(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_yields_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = PageManager::open(dir.path().join("mgr"), 8).unwrap();
        let a = mgr.allocate().unwrap();
        let b = mgr.allocate().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn restore_next_id_resumes_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgr");
        {
            let mut mgr = PageManager::open(&path, 8).unwrap();
            mgr.allocate().unwrap();
            mgr.allocate().unwrap();
            mgr.flush().unwrap();
        }
        // a fresh manager only knows about pages actually flushed to disk
        let mut mgr = PageManager::open(&path, 8).unwrap();
        mgr.restore_next_id(2);
        assert_eq!(mgr.allocate().unwrap(), 2);
    }
}
