//! Error type for the paged storage substrate.

use std::io;
use std::path::PathBuf;

/// Failures that can occur while reading, writing or verifying paged
/// storage: the raw file, the page pool/manager, the hash tree, or the
/// on-disk B-tree.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// An underlying filesystem operation failed.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// The file the operation was attempted against.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A page, hash tree, or B-tree node failed an internal consistency
    /// check (a corrupted or truncated file, a hash mismatch, a metadata
    /// page with an out-of-range value).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// An operation was attempted in violation of a documented precondition
    /// (e.g. a page id beyond the allocated range, an operation on a
    /// closed store).
    #[error("precondition violated: {0}")]
    PreconditionFailure(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
