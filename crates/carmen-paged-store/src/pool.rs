//! The page pool: a bounded in-memory cache over a [`RawFile`], with a
//! pluggable eviction policy and load/evict listener hooks.

use std::collections::{HashMap, HashSet};

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::error::StoreError;
use crate::file::RawFile;
use crate::page::{Page, PageId};

/// A strategy for choosing which resident page to evict when the pool is
/// full and a page not currently resident is requested.
///
/// Implementations are notified of every access via [`touch`] and of every
/// removal via [`remove`], and must produce a candidate via [`evict`].
pub trait EvictionPolicy: Send {
    /// Records that `id` was just accessed (loaded or re-used).
    fn touch(&mut self, id: PageId);

    /// Records that `id` left the pool outside of normal eviction (e.g. on
    /// `close`).
    fn remove(&mut self, id: PageId);

    /// Picks a resident page to evict, if any are tracked.
    fn evict(&mut self) -> Option<PageId>;
}

/// Least-recently-used eviction: the default policy, matching the pool's
/// documented default.
pub struct LruEvictionPolicy {
    order: LruCache<PageId, ()>,
}

impl LruEvictionPolicy {
    /// Builds a tracker with room for `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            order: LruCache::new(cap),
        }
    }
}

impl EvictionPolicy for LruEvictionPolicy {
    fn touch(&mut self, id: PageId) {
        self.order.put(id, ());
    }

    fn remove(&mut self, id: PageId) {
        self.order.pop(&id);
    }

    fn evict(&mut self) -> Option<PageId> {
        self.order.pop_lru().map(|(id, _)| id)
    }
}

type Listener = Box<dyn FnMut(PageId, &Page) + Send>;

/// A bounded pool of resident pages backed by a single [`RawFile`].
///
/// Pages are loaded on first access and kept resident until evicted to
/// make room for another page or until the pool is explicitly closed.
/// Writers must call [`PagePool::mark_dirty`] after mutating a page
/// in-place through [`PagePool::get_mut`]; only dirty pages are written
/// back on flush or eviction.
pub struct PagePool<E: EvictionPolicy = LruEvictionPolicy> {
    file: RawFile,
    capacity: usize,
    frames: HashMap<PageId, Page>,
    dirty: HashSet<PageId>,
    policy: E,
    after_load: Vec<Listener>,
    before_evict: Vec<Listener>,
}

impl PagePool<LruEvictionPolicy> {
    /// Opens a pool over `file` with the default LRU eviction policy.
    pub fn new(file: RawFile, capacity: usize) -> Self {
        Self::with_policy(file, capacity, LruEvictionPolicy::new(capacity))
    }
}

impl<E: EvictionPolicy> PagePool<E> {
    /// Opens a pool over `file` using a caller-supplied eviction policy.
    pub fn with_policy(file: RawFile, capacity: usize, policy: E) -> Self {
        Self {
            file,
            capacity: capacity.max(1),
            frames: HashMap::new(),
            dirty: HashSet::new(),
            policy,
            after_load: Vec::new(),
            before_evict: Vec::new(),
        }
    }

    /// Registers a hook invoked, in registration order, just after a page
    /// is loaded into the pool.
    pub fn on_after_load(&mut self, hook: impl FnMut(PageId, &Page) + Send + 'static) {
        self.after_load.push(Box::new(hook));
    }

    /// Registers a hook invoked, in registration order, just before a
    /// resident page is evicted.
    pub fn on_before_evict(&mut self, hook: impl FnMut(PageId, &Page) + Send + 'static) {
        self.before_evict.push(Box::new(hook));
    }

    /// Returns a reference to the page at `id`, loading it from the
    /// backing file if it is not already resident.
    pub fn get(&mut self, id: PageId) -> Result<&Page, StoreError> {
        self.ensure_resident(id)?;
        self.policy.touch(id);
        Ok(self.frames.get(&id).expect("just made resident"))
    }

    /// Returns a mutable reference to the page at `id`, loading it if
    /// necessary. The caller must call [`mark_dirty`](Self::mark_dirty)
    /// after writing through this reference.
    pub fn get_mut(&mut self, id: PageId) -> Result<&mut Page, StoreError> {
        self.ensure_resident(id)?;
        self.policy.touch(id);
        Ok(self.frames.get_mut(&id).expect("just made resident"))
    }

    /// Marks `id` as holding unwritten changes.
    pub fn mark_dirty(&mut self, id: PageId) {
        self.dirty.insert(id);
    }

    fn ensure_resident(&mut self, id: PageId) -> Result<(), StoreError> {
        if self.frames.contains_key(&id) {
            return Ok(());
        }
        if self.frames.len() >= self.capacity {
            self.evict_one()?;
        }
        let page = self.file.read_page(id)?;
        for hook in &mut self.after_load {
            hook(id, &page);
        }
        self.frames.insert(id, page);
        Ok(())
    }

    fn evict_one(&mut self) -> Result<(), StoreError> {
        let Some(victim) = self.policy.evict() else {
            return Ok(());
        };
        #[cfg(feature = "tracing-log")]
        tracing::debug!("[carmen-paged-store] \u{1f4c4} evicting page {victim}");
        self.write_back(victim)?;
        if let Some(page) = self.frames.remove(&victim) {
            for hook in &mut self.before_evict {
                hook(victim, &page);
            }
        }
        Ok(())
    }

    fn write_back(&mut self, id: PageId) -> Result<(), StoreError> {
        if self.dirty.remove(&id) {
            if let Some(page) = self.frames.get(&id) {
                self.file.write_page(id, page)?;
            }
        }
        Ok(())
    }

    /// Writes every dirty resident page back to the file.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let dirty_ids: Vec<PageId> = self.dirty.iter().copied().collect();
        for id in dirty_ids {
            self.write_back(id)?;
        }
        self.file.flush()
    }

    /// Flushes, then drops every resident page (the underlying file stays
    /// open; a pool can be reused after closing).
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        for id in self.frames.keys().copied().collect::<Vec<_>>() {
            self.policy.remove(id);
        }
        self.frames.clear();
        Ok(())
    }

    /// Number of pages currently resident.
    pub fn resident_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(capacity: usize) -> (tempfile::TempDir, PagePool) {
        let dir = tempfile::tempdir().unwrap();
        let file = RawFile::open(dir.path().join("pool")).unwrap();
        (dir, PagePool::new(file, capacity))
    }

    #[test]
    fn dirty_page_is_written_back_on_flush() {
        let (_dir, mut pool) = pool_of(4);
        pool.get_mut(0).unwrap().as_bytes_mut()[0] = 42;
        pool.mark_dirty(0);
        pool.flush().unwrap();
        pool.close().unwrap();
        assert_eq!(pool.get(0).unwrap().as_bytes()[0], 42);
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (_dir, mut pool) = pool_of(2);
        pool.get_mut(0).unwrap().as_bytes_mut()[0] = 1;
        pool.mark_dirty(0);
        pool.get(1).unwrap();
        // a third distinct page forces eviction of the LRU entry (page 0)
        pool.get(2).unwrap();
        assert_eq!(pool.resident_count(), 2);
        assert_eq!(pool.get(0).unwrap().as_bytes()[0], 1);
    }

    #[test]
    fn listener_hooks_fire_on_load_and_evict() {
        let (_dir, mut pool) = pool_of(1);
        let loaded = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let l = loaded.clone();
        let e = evicted.clone();
        pool.on_after_load(move |id, _| l.lock().unwrap().push(id));
        pool.on_before_evict(move |id, _| e.lock().unwrap().push(id));
        pool.get(0).unwrap();
        pool.get(1).unwrap();
        assert_eq!(*loaded.lock().unwrap(), vec![0, 1]);
        assert_eq!(*evicted.lock().unwrap(), vec![0]);
    }
}
