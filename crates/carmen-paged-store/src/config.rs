//! Tunables for opening a page pool or B-tree: how many pages stay
//! resident and how the Merkle hash tree over them is shaped.

/// Configuration for a [`PageManager`](crate::PageManager) /
/// [`BTree`](crate::BTree) instance.
#[derive(Clone, Debug)]
pub struct PageStoreConfig {
    /// Maximum number of pages resident at once before the eviction
    /// policy reclaims one.
    pub pool_capacity: usize,
    /// Branching factor of the Merkle hash tree layered over the pages.
    pub hash_tree_branching_factor: usize,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 1024,
            hash_tree_branching_factor: 32,
        }
    }
}

impl PageStoreConfig {
    /// A config suited to tests: a small pool so eviction paths are
    /// exercised without needing thousands of pages.
    pub fn for_tests() -> Self {
        Self {
            pool_capacity: 8,
            hash_tree_branching_factor: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = PageStoreConfig::default();
        assert!(config.pool_capacity > 0);
        assert!(config.hash_tree_branching_factor > 1);
    }
}
