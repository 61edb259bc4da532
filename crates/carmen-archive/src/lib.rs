//! A verifiable, per-block history of account state.
//!
//! An archive records, for every block added, which accounts were
//! created or deleted and how their balance, nonce, code and storage
//! changed. Every block and every touched account carries a hash chain
//! over its history, so the whole archive (or a single account's history
//! within it) can be checked for tamper-free, in-order construction via
//! [`Archive::verify`] / [`Archive::verify_account`].
//!
//! Two interchangeable backings implement the same behaviour:
//! [`KvArchive`] over an ordered key/value store and [`SqlArchive`] over
//! a relational one. Pick whichever fits the surrounding storage stack;
//! their on-disk layouts differ but their observable semantics do not.

mod config;
mod error;
mod kv;
mod schema;
mod sql;
mod update;

pub use config::{ArchiveConfig, BackendKind};
pub use error::ArchiveError;
pub use kv::KvArchive;
pub use schema::KeyType;
pub use sql::SqlArchive;
pub use update::{AccountUpdate, Update};

use carmen_types::{Address, Balance, BlockId, Code, Hash, Key, Nonce, Value};

/// The operations common to every archive backing.
///
/// Point reads (`get_balance`, `get_code`, `get_nonce`, `get_storage`,
/// `exists`, `get_hash`, `get_account_hash`) resolve to the value as of
/// the largest recorded block that is not newer than the one queried,
/// defaulting to zero/false/empty when nothing has been recorded yet.
pub trait Archive {
    /// Appends the per-block update. `block` must be strictly greater
    /// than the archive's latest block; an empty update is a no-op and
    /// does not advance the archive.
    fn add(&mut self, block: BlockId, update: &Update) -> Result<(), ArchiveError>;

    /// True if `address` exists (was created and not subsequently
    /// deleted) as of `block`.
    fn exists(&self, block: BlockId, address: &Address) -> Result<bool, ArchiveError>;

    /// `address`'s balance at `block`, or zero if never set.
    fn get_balance(&self, block: BlockId, address: &Address) -> Result<Balance, ArchiveError>;

    /// `address`'s code at `block`, or empty if never set.
    fn get_code(&self, block: BlockId, address: &Address) -> Result<Code, ArchiveError>;

    /// `address`'s nonce at `block`, or zero if never set.
    fn get_nonce(&self, block: BlockId, address: &Address) -> Result<Nonce, ArchiveError>;

    /// The value of storage slot `key` for `address` at `block`, or zero
    /// if never written.
    fn get_storage(&self, block: BlockId, address: &Address, key: &Key) -> Result<Value, ArchiveError>;

    /// The highest block added, or `None` if the archive is empty.
    fn get_latest_block(&self) -> Result<Option<BlockId>, ArchiveError>;

    /// The root hash covering every block up to and including `block`.
    fn get_hash(&self, block: BlockId) -> Result<Hash, ArchiveError>;

    /// Every address with a hash chain entry at or before `block`,
    /// sorted.
    fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>, ArchiveError>;

    /// The per-account hash chain value for `address` at `block`.
    fn get_account_hash(&self, block: BlockId, address: &Address) -> Result<Hash, ArchiveError>;

    /// Checks that `block`'s root hash equals `expected_hash`, that the
    /// block hash chain and every touched account's hash chain are
    /// internally consistent, and that no row falls outside what the
    /// hash chain covers.
    fn verify(&self, block: BlockId, expected_hash: Hash) -> Result<(), ArchiveError>;

    /// Checks `address`'s reincarnation discipline and hash chain up to
    /// `block` in isolation.
    fn verify_account(&self, block: BlockId, address: &Address) -> Result<(), ArchiveError>;

    /// Flushes any buffered writes to durable storage.
    fn flush(&self) -> Result<(), ArchiveError>;

    /// Closes the archive. Further operations fail with a precondition
    /// error.
    fn close(&mut self) -> Result<(), ArchiveError>;
}

/// Opens the backend named by `config.backend` at `config.path`.
pub fn open_archive(config: &ArchiveConfig) -> Result<Box<dyn Archive>, ArchiveError> {
    match config.backend {
        BackendKind::KeyValue => Ok(Box::new(KvArchive::open(&config.path)?)),
        BackendKind::Sql => Ok(Box::new(SqlArchive::open(&config.path)?)),
    }
}

macro_rules! impl_archive {
    ($ty:ty) => {
        impl Archive for $ty {
            fn add(&mut self, block: BlockId, update: &Update) -> Result<(), ArchiveError> {
                Self::add(self, block, update)
            }
            fn exists(&self, block: BlockId, address: &Address) -> Result<bool, ArchiveError> {
                Self::exists(self, block, address)
            }
            fn get_balance(&self, block: BlockId, address: &Address) -> Result<Balance, ArchiveError> {
                Self::get_balance(self, block, address)
            }
            fn get_code(&self, block: BlockId, address: &Address) -> Result<Code, ArchiveError> {
                Self::get_code(self, block, address)
            }
            fn get_nonce(&self, block: BlockId, address: &Address) -> Result<Nonce, ArchiveError> {
                Self::get_nonce(self, block, address)
            }
            fn get_storage(&self, block: BlockId, address: &Address, key: &Key) -> Result<Value, ArchiveError> {
                Self::get_storage(self, block, address, key)
            }
            fn get_latest_block(&self) -> Result<Option<BlockId>, ArchiveError> {
                Self::get_latest_block(self)
            }
            fn get_hash(&self, block: BlockId) -> Result<Hash, ArchiveError> {
                Self::get_hash(self, block)
            }
            fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>, ArchiveError> {
                Self::get_account_list(self, block)
            }
            fn get_account_hash(&self, block: BlockId, address: &Address) -> Result<Hash, ArchiveError> {
                Self::get_account_hash(self, block, address)
            }
            fn verify(&self, block: BlockId, expected_hash: Hash) -> Result<(), ArchiveError> {
                Self::verify(self, block, expected_hash)
            }
            fn verify_account(&self, block: BlockId, address: &Address) -> Result<(), ArchiveError> {
                Self::verify_account(self, block, address)
            }
            fn flush(&self) -> Result<(), ArchiveError> {
                Self::flush(self)
            }
            fn close(&mut self) -> Result<(), ArchiveError> {
                Self::close(self)
            }
        }
    };
}

impl_archive!(KvArchive);
impl_archive!(SqlArchive);

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(archive: &mut dyn Archive) {
        let addr = Address::from_slice(&[7; 20]);
        let mut update = Update::new();
        update.create_account(addr);
        update.set_balance(addr, Balance::from_slice(&[1; 32]));
        archive.add(1, &update).unwrap();
        assert!(archive.exists(1, &addr).unwrap());
        assert_eq!(archive.get_balance(1, &addr).unwrap(), Balance::from_slice(&[1; 32]));
        let hash = archive.get_hash(1).unwrap();
        archive.verify(1, hash).unwrap();
    }

    #[test]
    fn kv_and_sql_backings_satisfy_the_same_trait() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = KvArchive::open(dir.path().join("kv")).unwrap();
        exercise(&mut kv);

        let mut sql = SqlArchive::open(dir.path().join("sql.db")).unwrap();
        exercise(&mut sql);
    }

    #[test]
    fn open_archive_dispatches_on_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut kv = open_archive(&ArchiveConfig::key_value(dir.path().join("kv"))).unwrap();
        exercise(kv.as_mut());

        let mut sql = open_archive(&ArchiveConfig::sql(dir.path().join("sql.db"))).unwrap();
        exercise(sql.as_mut());
    }
}
