//! A Merkle hash tree over a sequence of pages: the primitive that lets a
//! store derive one root hash summarizing every page it owns, while only
//! re-hashing pages that actually changed since the last query.

use std::collections::HashSet;

use carmen_types::{hash_bytes, Hash};

use crate::error::StoreError;
use crate::page::PageId;

/// Supplies the raw bytes of a page on demand, so the hash tree can hash a
/// dirty page lazily rather than needing to be pushed every change eagerly.
pub trait PageSource {
    /// Returns the current bytes backing `id`.
    fn page_bytes(&mut self, id: PageId) -> Result<Vec<u8>, StoreError>;
}

/// A level-by-level Merkle tree over per-page hashes.
///
/// Level 0 holds one hash per registered page. Each level above groups
/// `branching_factor` hashes from the level below into one combined hash,
/// padding the final group with a fixed zero hash so the tree shape is a
/// deterministic function of `num_pages` alone. Marking a page dirty only
/// invalidates its leaf hash; [`get_hash`](Self::get_hash) re-resolves the
/// dirty leaves and rebuilds the levels above them.
pub struct HashTree {
    branching_factor: usize,
    num_pages: u64,
    leaf_hashes: Vec<Hash>,
    dirty_pages: HashSet<PageId>,
}

impl HashTree {
    /// Builds an empty tree with the given branching factor (children
    /// combined per parent hash).
    pub fn new(branching_factor: usize) -> Self {
        assert!(branching_factor >= 2, "branching factor must be at least 2");
        Self {
            branching_factor,
            num_pages: 0,
            leaf_hashes: Vec::new(),
            dirty_pages: HashSet::new(),
        }
    }

    /// The configured branching factor.
    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    /// The number of pages currently registered.
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Ensures the tree has room for page `id`, growing the leaf level
    /// with zero hashes for any pages not yet registered and marking the
    /// new slot dirty.
    pub fn register_page(&mut self, id: PageId) {
        if id < self.num_pages {
            return;
        }
        self.num_pages = id + 1;
        self.leaf_hashes.resize(self.num_pages as usize, Hash::ZERO);
        self.dirty_pages.insert(id);
    }

    /// Directly sets the leaf hash for `id`, e.g. when the caller already
    /// knows the page's hash.
    pub fn update_hash(&mut self, id: PageId, hash: Hash) {
        self.register_page(id);
        self.leaf_hashes[id as usize] = hash;
        self.dirty_pages.remove(&id);
    }

    /// Hashes `bytes` and sets it as the leaf hash for `id`.
    pub fn update_hash_bytes(&mut self, id: PageId, bytes: &[u8]) {
        self.update_hash(id, hash_bytes(bytes));
    }

    /// Marks `id` as needing its hash recomputed from the live page
    /// contents the next time [`get_hash`](Self::get_hash) is called.
    pub fn mark_dirty(&mut self, id: PageId) {
        self.register_page(id);
        self.dirty_pages.insert(id);
    }

    /// Returns the root hash, resolving any pages marked dirty by reading
    /// their current bytes from `source` first.
    pub fn get_hash(&mut self, source: &mut dyn PageSource) -> Result<Hash, StoreError> {
        if self.num_pages == 0 {
            return Ok(Hash::ZERO);
        }
        let dirty: Vec<PageId> = self.dirty_pages.drain().collect();
        for id in dirty {
            let bytes = source.page_bytes(id)?;
            self.leaf_hashes[id as usize] = hash_bytes(&bytes);
        }
        Ok(self.compute_root())
    }

    fn compute_root(&self) -> Hash {
        let mut level = self.leaf_hashes.clone();
        while level.len() > 1 {
            let padded_len = Self::padded_len(level.len(), self.branching_factor);
            level.resize(padded_len, Hash::ZERO);
            let parent_len = padded_len / self.branching_factor;
            let mut parent = Vec::with_capacity(parent_len);
            for p in 0..parent_len {
                let start = p * self.branching_factor;
                let end = start + self.branching_factor;
                let combined = hash_bytes(
                    level[start..end]
                        .iter()
                        .flat_map(|h| h.as_bytes().to_vec())
                        .collect::<Vec<u8>>(),
                );
                parent.push(combined);
            }
            level = parent;
        }
        level.first().copied().unwrap_or(Hash::ZERO)
    }

    fn padded_len(len: usize, branching_factor: usize) -> usize {
        len.div_ceil(branching_factor) * branching_factor
    }

    /// Serializes the tree to the on-disk raw format: a little-endian
    /// `u32` branching factor, a little-endian `u32` page count, the root
    /// hash, then one 32-byte hash per page. The tree must not have
    /// pending dirty pages; call [`get_hash`](Self::get_hash) first.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        if !self.dirty_pages.is_empty() {
            return Err(StoreError::PreconditionFailure(
                "cannot serialize a hash tree with unresolved dirty pages".into(),
            ));
        }
        let root = self.compute_root();
        let mut out = Vec::with_capacity(40 + self.leaf_hashes.len() * 32);
        out.extend_from_slice(&(self.branching_factor as u32).to_le_bytes());
        out.extend_from_slice(&(self.num_pages as u32).to_le_bytes());
        out.extend_from_slice(root.as_bytes());
        for h in &self.leaf_hashes {
            out.extend_from_slice(h.as_bytes());
        }
        Ok(out)
    }

    /// Reconstructs a tree from [`to_bytes`](Self::to_bytes) output,
    /// recomputing the root from the stored per-page hashes and erroring
    /// if it does not match the stored root.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        if data.len() < 40 {
            return Err(StoreError::Corruption("hash tree file too short".into()));
        }
        let branching_factor = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let num_pages = u32::from_le_bytes(data[4..8].try_into().unwrap()) as u64;
        let stored_root = Hash::from_slice(&data[8..40]);
        let expected_len = 40 + num_pages as usize * 32;
        if data.len() != expected_len {
            return Err(StoreError::Corruption(format!(
                "hash tree file has {} bytes, expected {}",
                data.len(),
                expected_len
            )));
        }
        let mut tree = HashTree::new(branching_factor);
        for i in 0..num_pages {
            let start = 40 + i as usize * 32;
            let hash = Hash::from_slice(&data[start..start + 32]);
            tree.update_hash(i, hash);
        }
        let recomputed = tree.compute_root();
        if recomputed != stored_root {
            return Err(StoreError::Corruption(
                "unable to verify hash tree: stored root does not match recomputed root".into(),
            ));
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<Vec<u8>>);
    impl PageSource for FixedSource {
        fn page_bytes(&mut self, id: PageId) -> Result<Vec<u8>, StoreError> {
            Ok(self.0[id as usize].clone())
        }
    }

    #[test]
    fn empty_tree_hash_is_zero() {
        let mut tree = HashTree::new(4);
        let mut source = FixedSource(vec![]);
        assert_eq!(tree.get_hash(&mut source).unwrap(), Hash::ZERO);
    }

    #[test]
    fn single_page_hash_matches_direct_hash() {
        let mut tree = HashTree::new(4);
        let mut source = FixedSource(vec![b"hello".to_vec()]);
        tree.mark_dirty(0);
        let root = tree.get_hash(&mut source).unwrap();
        assert_eq!(root, hash_bytes(b"hello"));
    }

    #[test]
    fn dirty_page_changes_root() {
        let mut tree = HashTree::new(2);
        let mut source = FixedSource(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        tree.mark_dirty(0);
        tree.mark_dirty(1);
        tree.mark_dirty(2);
        let first_root = tree.get_hash(&mut source).unwrap();

        source.0[1] = b"bb".to_vec();
        tree.mark_dirty(1);
        let second_root = tree.get_hash(&mut source).unwrap();
        assert_ne!(first_root, second_root);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut tree = HashTree::new(4);
        let mut source = FixedSource(vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
        tree.mark_dirty(0);
        tree.mark_dirty(1);
        tree.mark_dirty(2);
        let root = tree.get_hash(&mut source).unwrap();
        let bytes = tree.to_bytes().unwrap();
        let restored = HashTree::from_bytes(&bytes).unwrap();
        assert_eq!(restored.num_pages(), 3);
        assert_eq!(restored.compute_root(), root);
    }

    #[test]
    fn corrupted_root_is_rejected() {
        let mut tree = HashTree::new(4);
        let mut source = FixedSource(vec![b"x".to_vec()]);
        tree.mark_dirty(0);
        tree.get_hash(&mut source).unwrap();
        let mut bytes = tree.to_bytes().unwrap();
        bytes[8] ^= 0xff;
        assert!(HashTree::from_bytes(&bytes).is_err());
    }
}
