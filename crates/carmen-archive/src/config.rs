//! Archive backend selection and on-disk location.

use std::path::PathBuf;

/// Which storage engine backs an archive.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackendKind {
    /// An ordered key/value store (RocksDB).
    KeyValue,
    /// A relational store (SQLite).
    Sql,
}

/// Configuration for opening an archive: which backend to use and where
/// its files live.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Directory (key/value) or file (SQL) the archive persists to.
    pub path: PathBuf,
    /// Which backend to open `path` with.
    pub backend: BackendKind,
}

impl ArchiveConfig {
    /// A config pointing at `path` using the ordered key/value backend.
    pub fn key_value(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backend: BackendKind::KeyValue,
        }
    }

    /// A config pointing at `path` using the SQL backend.
    pub fn sql(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backend: BackendKind::Sql,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_expected_backend() {
        assert_eq!(ArchiveConfig::key_value("a").backend, BackendKind::KeyValue);
        assert_eq!(ArchiveConfig::sql("b").backend, BackendKind::Sql);
    }
}
