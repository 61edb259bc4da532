//! A paged, disk-backed B-tree: an ordered map (or, with a unit value, an
//! ordered set) whose nodes live in pages managed by a [`PageManager`].

mod codec;
mod node;

pub use codec::FixedBytes;

use std::marker::PhantomData;
use std::path::Path;

use crate::config::PageStoreConfig;
use crate::error::StoreError;
use crate::manager::PageManager;
use crate::page::{Page, PageId};
use crate::pool::{EvictionPolicy, LruEvictionPolicy};

use node::{InnerNode, LeafNode, LeafInsert, NONE_PAGE};

const META_PAGE: PageId = 0;

struct MetaData {
    root: PageId,
    num_entries: u64,
    height: u32,
    next_alloc: PageId,
}

impl MetaData {
    fn from_page(page: &Page) -> Self {
        let data = page.as_bytes();
        Self {
            root: u64::from_be_bytes(data[0..8].try_into().unwrap()),
            num_entries: u64::from_be_bytes(data[8..16].try_into().unwrap()),
            height: u32::from_be_bytes(data[16..20].try_into().unwrap()),
            next_alloc: u64::from_be_bytes(data[20..28].try_into().unwrap()),
        }
    }

    fn to_page(&self, page: &mut Page) {
        let data = page.as_bytes_mut();
        data.fill(0);
        data[0..8].copy_from_slice(&self.root.to_be_bytes());
        data[8..16].copy_from_slice(&self.num_entries.to_be_bytes());
        data[16..20].copy_from_slice(&self.height.to_be_bytes());
        data[20..28].copy_from_slice(&self.next_alloc.to_be_bytes());
    }
}

/// A paged B-tree ordered on `K`, storing a `V` alongside each key.
///
/// Page 0 is reserved for metadata (root page id, entry count, tree
/// height, allocation cursor); the root and every other node live in
/// pages handed out by the underlying [`PageManager`].
pub struct BTree<K, V, E: EvictionPolicy = LruEvictionPolicy> {
    mgr: PageManager<E>,
    meta: MetaData,
    _marker: PhantomData<(K, V)>,
}

impl<K: FixedBytes + Ord, V: FixedBytes> BTree<K, V, LruEvictionPolicy> {
    /// Opens (creating if necessary) a B-tree backed by the file at `path`,
    /// keeping up to `capacity` pages resident.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let mut mgr = PageManager::open(path, capacity)?;
        Self::open_with_manager(&mut mgr).map(|meta| BTree {
            mgr,
            meta,
            _marker: PhantomData,
        })
    }

    /// Opens (creating if necessary) a B-tree backed by the file at
    /// `path`, sized per `config`.
    pub fn open_with_config(path: impl AsRef<Path>, config: &PageStoreConfig) -> Result<Self, StoreError> {
        Self::open(path, config.pool_capacity)
    }
}

impl<K: FixedBytes + Ord, V: FixedBytes, E: EvictionPolicy> BTree<K, V, E> {
    fn open_with_manager(mgr: &mut PageManager<E>) -> Result<MetaData, StoreError> {
        if mgr.next_id() == 0 {
            mgr.allocate()?; // page 0: metadata
            let root_id = mgr.allocate()?; // page 1: empty root leaf
            let leaf: LeafNode<K, V> = LeafNode::empty();
            leaf.to_bytes(mgr.get_mut(root_id)?);
            mgr.mark_dirty(root_id);
            let meta = MetaData {
                root: root_id,
                num_entries: 0,
                height: 1,
                next_alloc: mgr.next_id(),
            };
            meta.to_page(mgr.get_mut(META_PAGE)?);
            mgr.mark_dirty(META_PAGE);
            Ok(meta)
        } else {
            let meta = MetaData::from_page(mgr.get(META_PAGE)?);
            mgr.restore_next_id(meta.next_alloc);
            Ok(meta)
        }
    }

    fn persist_meta(&mut self) -> Result<(), StoreError> {
        self.meta.next_alloc = self.mgr.next_id();
        self.meta.to_page(self.mgr.get_mut(META_PAGE)?);
        self.mgr.mark_dirty(META_PAGE);
        Ok(())
    }

    /// Number of entries stored.
    pub fn len(&self) -> u64 {
        self.meta.num_entries
    }

    /// True if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.meta.num_entries == 0
    }

    fn descend_to_leaf(&mut self, key: &K) -> Result<(PageId, Vec<PageId>), StoreError> {
        let mut path = Vec::with_capacity(self.meta.height as usize);
        let mut node_id = self.meta.root;
        let mut depth = 1;
        while depth < self.meta.height {
            let inner: InnerNode<K> = InnerNode::from_bytes(self.mgr.get(node_id)?);
            path.push(node_id);
            node_id = inner.children[inner.find_child(key)];
            depth += 1;
        }
        Ok((node_id, path))
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&mut self, key: &K) -> Result<Option<V>, StoreError> {
        let (leaf_id, _) = self.descend_to_leaf(key)?;
        let leaf: LeafNode<K, V> = LeafNode::from_bytes(self.mgr.get(leaf_id)?);
        Ok(leaf.get(key))
    }

    /// True if `key` is present.
    pub fn contains(&mut self, key: &K) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts `key` with `value`, returning `true` if this added a new
    /// entry (as opposed to overwriting an existing one).
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, StoreError> {
        let (leaf_id, mut path) = self.descend_to_leaf(&key)?;
        let mut leaf: LeafNode<K, V> = LeafNode::from_bytes(self.mgr.get(leaf_id)?);
        match leaf.insert(key, value) {
            LeafInsert::Present => {
                leaf.to_bytes(self.mgr.get_mut(leaf_id)?);
                self.mgr.mark_dirty(leaf_id);
                return Ok(false);
            }
            LeafInsert::Added => {}
        }

        if leaf.entries.len() <= LeafNode::<K, V>::max_entries() {
            leaf.to_bytes(self.mgr.get_mut(leaf_id)?);
            self.mgr.mark_dirty(leaf_id);
            self.meta.num_entries += 1;
            self.persist_meta()?;
            return Ok(true);
        }

        let (mut sep_key, mut new_leaf) = leaf.split();
        let new_leaf_id = self.mgr.allocate()?;
        new_leaf.next = leaf.next;
        new_leaf.prev = leaf_id;
        leaf.next = new_leaf_id;
        if new_leaf.next != NONE_PAGE {
            let mut right_sibling: LeafNode<K, V> = LeafNode::from_bytes(self.mgr.get(new_leaf.next)?);
            right_sibling.prev = new_leaf_id;
            right_sibling.to_bytes(self.mgr.get_mut(new_leaf.next)?);
            self.mgr.mark_dirty(new_leaf.next);
        }
        leaf.to_bytes(self.mgr.get_mut(leaf_id)?);
        self.mgr.mark_dirty(leaf_id);
        new_leaf.to_bytes(self.mgr.get_mut(new_leaf_id)?);
        self.mgr.mark_dirty(new_leaf_id);

        let mut promoted_child = new_leaf_id;
        loop {
            match path.pop() {
                Some(parent_id) => {
                    let mut inner: InnerNode<K> = InnerNode::from_bytes(self.mgr.get(parent_id)?);
                    inner.insert_separator(sep_key, promoted_child);
                    if inner.keys.len() <= InnerNode::<K>::max_keys() {
                        inner.to_bytes(self.mgr.get_mut(parent_id)?);
                        self.mgr.mark_dirty(parent_id);
                        break;
                    }
                    let (up_key, new_inner) = inner.split();
                    let new_inner_id = self.mgr.allocate()?;
                    inner.to_bytes(self.mgr.get_mut(parent_id)?);
                    self.mgr.mark_dirty(parent_id);
                    new_inner.to_bytes(self.mgr.get_mut(new_inner_id)?);
                    self.mgr.mark_dirty(new_inner_id);
                    sep_key = up_key;
                    promoted_child = new_inner_id;
                }
                None => {
                    let new_root: InnerNode<K> = {
                        let mut n = InnerNode::with_single_child(self.meta.root);
                        n.insert_separator(sep_key, promoted_child);
                        n
                    };
                    let new_root_id = self.mgr.allocate()?;
                    new_root.to_bytes(self.mgr.get_mut(new_root_id)?);
                    self.mgr.mark_dirty(new_root_id);
                    self.meta.root = new_root_id;
                    self.meta.height += 1;
                    break;
                }
            }
        }

        self.meta.num_entries += 1;
        self.persist_meta()?;
        Ok(true)
    }

    /// Writes every dirty page back to disk.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.persist_meta()?;
        self.mgr.flush()
    }

    /// Flushes and releases resident pages.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        self.mgr.close()
    }

    fn leftmost_leaf(&mut self) -> Result<PageId, StoreError> {
        let mut node_id = self.meta.root;
        let mut depth = 1;
        while depth < self.meta.height {
            let inner: InnerNode<K> = InnerNode::from_bytes(self.mgr.get(node_id)?);
            node_id = inner.children[0];
            depth += 1;
        }
        Ok(node_id)
    }

    /// Returns every entry in ascending key order. Intended for tests and
    /// small trees; production callers should prefer [`iter`](Self::iter).
    pub fn entries(&mut self) -> Result<Vec<(K, V)>, StoreError> {
        let mut out = Vec::with_capacity(self.meta.num_entries as usize);
        let mut node_id = self.leftmost_leaf()?;
        loop {
            let leaf: LeafNode<K, V> = LeafNode::from_bytes(self.mgr.get(node_id)?);
            out.extend(leaf.entries.iter().copied());
            if leaf.next == NONE_PAGE {
                break;
            }
            node_id = leaf.next;
        }
        Ok(out)
    }

    /// Walks the tree structurally, checking that every leaf's entries are
    /// sorted, that the leaf chain is consistent, and that the overall
    /// sequence of keys across all leaves is strictly increasing.
    pub fn check(&mut self) -> Result<(), StoreError> {
        let mut node_id = self.leftmost_leaf()?;
        let mut prev_key: Option<K> = None;
        let mut prev_id = NONE_PAGE;
        let mut seen = 0u64;
        loop {
            let leaf: LeafNode<K, V> = LeafNode::from_bytes(self.mgr.get(node_id)?);
            if leaf.prev != prev_id {
                return Err(StoreError::Corruption(format!(
                    "leaf {} has prev link {} but was reached from {}",
                    node_id, leaf.prev, prev_id
                )));
            }
            for (key, _) in &leaf.entries {
                if let Some(p) = prev_key {
                    if p >= *key {
                        return Err(StoreError::Corruption(
                            "b-tree keys are not strictly increasing across leaves".into(),
                        ));
                    }
                }
                prev_key = Some(*key);
                seen += 1;
            }
            prev_id = node_id;
            if leaf.next == NONE_PAGE {
                break;
            }
            node_id = leaf.next;
        }
        if seen != self.meta.num_entries {
            return Err(StoreError::Corruption(format!(
                "b-tree metadata reports {} entries but leaf chain holds {}",
                self.meta.num_entries, seen
            )));
        }
        Ok(())
    }
}

/// A paged B-tree used as an ordered set: the value type is the unit
/// type, so only keys occupy leaf storage.
pub type BTreeSet<K, E = LruEvictionPolicy> = BTree<K, (), E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(capacity: usize) -> (tempfile::TempDir, BTree<u64, u64>) {
        let dir = tempfile::tempdir().unwrap();
        let t = BTree::open(dir.path().join("tree"), capacity).unwrap();
        (dir, t)
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (_dir, mut t) = tree(8);
        assert!(t.insert(5, 50).unwrap());
        assert!(!t.insert(5, 51).unwrap());
        assert_eq!(t.get(&5).unwrap(), Some(51));
        assert_eq!(t.get(&6).unwrap(), None);
    }

    #[test]
    fn survives_many_inserts_forcing_splits() {
        let (_dir, mut t) = tree(8);
        for i in 0..500u64 {
            t.insert(i, i * 2).unwrap();
        }
        t.check().unwrap();
        for i in 0..500u64 {
            assert_eq!(t.get(&i).unwrap(), Some(i * 2));
        }
        assert_eq!(t.len(), 500);
    }

    #[test]
    fn shuffled_insert_stress_as_a_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut t: BTreeSet<u32> = BTree::open(dir.path().join("set"), 8).unwrap();
        let mut values: Vec<u32> = (0..10000).collect();
        {
            use rand::seq::SliceRandom;
            values.shuffle(&mut rand::thread_rng());
        }
        for v in &values {
            t.insert(*v, ()).unwrap();
            t.check().unwrap();
        }
        for i in 0..10000u32 {
            assert!(t.contains(&i).unwrap());
        }
        assert!(!t.contains(&10000).unwrap());
        assert!(!t.contains(&u32::MAX).unwrap());
    }

    #[test]
    fn reopen_preserves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree");
        {
            let mut t: BTree<u64, u64> = BTree::open(&path, 8).unwrap();
            for i in 0..200u64 {
                t.insert(i, i).unwrap();
            }
            t.close().unwrap();
        }
        let mut t: BTree<u64, u64> = BTree::open(&path, 8).unwrap();
        t.check().unwrap();
        assert_eq!(t.len(), 200);
        assert_eq!(t.get(&150).unwrap(), Some(150));
    }
}
