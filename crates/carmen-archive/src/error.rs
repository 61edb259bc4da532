//! Archive error kinds.
//!
//! `Display` text for [`Corruption`](ArchiveError::Corruption) and
//! [`PreconditionFailure`](ArchiveError::PreconditionFailure) is part of
//! the archive's contract: `Verify` callers match against stable
//! substrings, so wording here must not drift once chosen.

use std::fmt;

/// Failures surfaced by archive operations.
#[derive(Debug)]
pub enum ArchiveError {
    /// An operation was attempted in violation of a documented precondition:
    /// a closed archive, or a block not strictly newer than the latest one.
    PreconditionFailure(String),
    /// A value failed to decode (wrong length, out-of-range tag).
    InvalidArgument(String),
    /// `Verify` or a point read found the persisted state to be
    /// inconsistent with the archive's invariants.
    Corruption(String),
    /// The backing relational or key/value store reported a failure.
    Io(String),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::PreconditionFailure(msg) => write!(f, "{msg}"),
            ArchiveError::InvalidArgument(msg) => write!(f, "{msg}"),
            ArchiveError::Corruption(msg) => write!(f, "{msg}"),
            ArchiveError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<rocksdb::Error> for ArchiveError {
    fn from(e: rocksdb::Error) -> Self {
        ArchiveError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for ArchiveError {
    fn from(e: rusqlite::Error) -> Self {
        ArchiveError::Io(e.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Io(e.to_string())
    }
}

pub(crate) fn closed() -> ArchiveError {
    ArchiveError::PreconditionFailure("DB Closed".into())
}
