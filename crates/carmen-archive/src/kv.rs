//! The ordered key/value backing: every row lives in a single RocksDB
//! instance, keyed per the layout in [`schema`](crate::schema).

use std::collections::BTreeMap;
use std::path::Path;

use carmen_types::{combine, Address, Balance, BlockId, Code, Hash, Key, Nonce, ReincarnationNumber, Value};
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};

use crate::error::{closed, ArchiveError};
use crate::schema::{
    address_from_key, block_from_property_key, block_key, property_key, property_prefix,
    reincarnation_from_storage_key, slot_from_storage_key, storage_account_prefix, storage_key,
    storage_slot_prefix, KeyType,
};
use crate::update::{AccountUpdate, Update};

/// The `(exists, reincarnation)` record stored under [`KeyType::AccountState`].
struct AccountState {
    exists: bool,
    reincarnation: ReincarnationNumber,
}

impl AccountState {
    fn decode(bytes: &[u8]) -> Result<Self, ArchiveError> {
        if bytes.len() != 5 {
            return Err(ArchiveError::InvalidArgument(format!(
                "account state value has {} bytes, expected 5",
                bytes.len()
            )));
        }
        Ok(Self {
            exists: bytes[0] != 0,
            reincarnation: ReincarnationNumber::from_be_bytes(bytes[1..5].try_into().unwrap()),
        })
    }

    fn encode(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = self.exists as u8;
        out[1..5].copy_from_slice(&self.reincarnation.to_be_bytes());
        out
    }
}

/// An archive backed by an ordered key/value store (RocksDB), addressed
/// with the key layout in [`schema`](crate::schema).
pub struct KvArchive {
    db: Option<DB>,
}

impl KvArchive {
    /// Opens (creating if necessary) the RocksDB database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(ArchiveError::from)?;
        Ok(Self { db: Some(db) })
    }

    fn db(&self) -> Result<&DB, ArchiveError> {
        self.db.as_ref().ok_or_else(closed)
    }

    fn seek_le(&self, prefix: &[u8], upper_key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, ArchiveError> {
        let db = self.db()?;
        let mut iter = db.iterator(IteratorMode::From(upper_key, Direction::Reverse));
        if let Some(item) = iter.next() {
            let (k, v) = item.map_err(ArchiveError::from)?;
            if k.starts_with(prefix) {
                return Ok(Some((k.to_vec(), v.to_vec())));
            }
        }
        Ok(None)
    }

    fn collect_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ArchiveError> {
        let db = self.db()?;
        let mut out = Vec::new();
        for item in db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (k, v) = item.map_err(ArchiveError::from)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn account_state_at(&self, address: &Address, block: BlockId) -> Result<Option<AccountState>, ArchiveError> {
        let prefix = property_prefix(KeyType::AccountState, address);
        let upper = property_key(KeyType::AccountState, address, block);
        match self.seek_le(&prefix, &upper)? {
            Some((_, v)) => Ok(Some(AccountState::decode(&v)?)),
            None => Ok(None),
        }
    }

    fn reincarnation_at(&self, address: &Address, block: BlockId) -> Result<ReincarnationNumber, ArchiveError> {
        Ok(self.account_state_at(address, block)?.map(|s| s.reincarnation).unwrap_or(0))
    }

    fn account_hash_at(&self, address: &Address, block: BlockId) -> Result<Hash, ArchiveError> {
        let prefix = property_prefix(KeyType::AccountHash, address);
        let upper = property_key(KeyType::AccountHash, address, block);
        match self.seek_le(&prefix, &upper)? {
            Some((_, v)) => Ok(Hash::from_slice(&v)),
            None => Ok(Hash::ZERO),
        }
    }

    /// Appends the per-block update. Empty updates are silently ignored.
    /// `block` must be strictly greater than the archive's latest block.
    pub fn add(&mut self, block: BlockId, update: &Update) -> Result<(), ArchiveError> {
        if update.is_empty() {
            return Ok(());
        }
        let latest = self.get_latest_block()?;
        if let Some(latest) = latest {
            if block <= latest {
                return Err(ArchiveError::PreconditionFailure(format!(
                    "Unable to insert block {block}, archive already contains block {latest}"
                )));
            }
        }

        let addresses = update.touched_addresses();
        #[cfg(feature = "tracing-log")]
        tracing::info!("[carmen-archive] adding block {block} ({} touched accounts)", addresses.len());
        let mut batch = WriteBatch::default();
        let mut account_hashes: Vec<(Address, Hash)> = Vec::with_capacity(addresses.len());

        for address in &addresses {
            let Some(account_update) = update.account_update(address) else {
                continue;
            };
            self.stage_account_update(&mut batch, address, block, &account_update)?;
            let dh = account_update.diff_hash();
            let prev = self.account_hash_at(address, block)?;
            let new_hash = combine([prev.as_bytes(), dh.as_bytes()]);
            batch.put(property_key(KeyType::AccountHash, address, block), new_hash.as_bytes());
            account_hashes.push((*address, new_hash));
        }

        let prev_block_hash = self.get_hash(block)?;
        let block_hash = combine(
            std::iter::once(prev_block_hash.as_bytes().to_vec())
                .chain(account_hashes.iter().map(|(_, h)| h.as_bytes().to_vec())),
        );
        batch.put(block_key(block), block_hash.as_bytes());

        self.db()?.write(batch).map_err(ArchiveError::from)
    }

    fn stage_account_update(
        &self,
        batch: &mut WriteBatch,
        address: &Address,
        block: BlockId,
        update: &AccountUpdate,
    ) -> Result<(), ArchiveError> {
        let prior_state = self.account_state_at(address, block)?;
        let r_effective = if update.created || update.deleted {
            let new_reincarnation = match &prior_state {
                None => 0,
                Some(s) => s.reincarnation.saturating_add(1),
            };
            let state = AccountState {
                exists: update.created && !update.deleted,
                reincarnation: new_reincarnation,
            };
            batch.put(property_key(KeyType::AccountState, address, block), state.encode());
            new_reincarnation
        } else {
            prior_state.map(|s| s.reincarnation).unwrap_or(0)
        };

        if let Some(balance) = update.balance {
            batch.put(property_key(KeyType::Balance, address, block), balance.as_bytes());
        }
        if let Some(nonce) = update.nonce {
            batch.put(property_key(KeyType::Nonce, address, block), nonce.as_bytes());
        }
        if let Some(code) = &update.code {
            batch.put(property_key(KeyType::Code, address, block), code.as_bytes());
        }
        for (slot, value) in &update.storage {
            batch.put(storage_key(address, r_effective, slot, block), value.as_bytes());
        }
        Ok(())
    }

    /// The highest block added, or `None` if the archive is empty.
    pub fn get_latest_block(&self) -> Result<Option<BlockId>, ArchiveError> {
        let upper = [KeyType::Block as u8, 0xff, 0xff, 0xff, 0xff];
        match self.seek_le(&[KeyType::Block as u8], &upper)? {
            Some((k, _)) => Ok(Some(block_from_property_key(&k))),
            None => Ok(None),
        }
    }

    /// True if `address` exists (was created and not subsequently deleted)
    /// as of `block`.
    pub fn exists(&self, block: BlockId, address: &Address) -> Result<bool, ArchiveError> {
        Ok(self.account_state_at(address, block)?.map(|s| s.exists).unwrap_or(false))
    }

    /// `address`'s balance at `block`, or zero if never set.
    pub fn get_balance(&self, block: BlockId, address: &Address) -> Result<Balance, ArchiveError> {
        let prefix = property_prefix(KeyType::Balance, address);
        let upper = property_key(KeyType::Balance, address, block);
        Ok(self
            .seek_le(&prefix, &upper)?
            .map(|(_, v)| Balance::from_slice(&v))
            .unwrap_or(Balance::ZERO))
    }

    /// `address`'s nonce at `block`, or zero if never set.
    pub fn get_nonce(&self, block: BlockId, address: &Address) -> Result<Nonce, ArchiveError> {
        let prefix = property_prefix(KeyType::Nonce, address);
        let upper = property_key(KeyType::Nonce, address, block);
        Ok(self
            .seek_le(&prefix, &upper)?
            .map(|(_, v)| Nonce::from_slice(&v))
            .unwrap_or(Nonce::ZERO))
    }

    /// `address`'s code at `block`, or empty if never set.
    pub fn get_code(&self, block: BlockId, address: &Address) -> Result<Code, ArchiveError> {
        let prefix = property_prefix(KeyType::Code, address);
        let upper = property_key(KeyType::Code, address, block);
        Ok(self
            .seek_le(&prefix, &upper)?
            .map(|(_, v)| Code::from(v))
            .unwrap_or_default())
    }

    /// The value of storage slot `key` for `address` at `block`, or zero
    /// if never written.
    pub fn get_storage(&self, block: BlockId, address: &Address, key: &Key) -> Result<Value, ArchiveError> {
        let reincarnation = self.reincarnation_at(address, block)?;
        let prefix = storage_slot_prefix(address, reincarnation, key);
        let upper = storage_key(address, reincarnation, key, block);
        Ok(self
            .seek_le(&prefix, &upper)?
            .map(|(_, v)| Value::from_slice(&v))
            .unwrap_or(Value::ZERO))
    }

    /// The root hash covering every block up to and including `block`, or
    /// zero if no block that low has been added.
    pub fn get_hash(&self, block: BlockId) -> Result<Hash, ArchiveError> {
        let upper = block_key(block);
        Ok(self
            .seek_le(&[KeyType::Block as u8], &upper)?
            .map(|(_, v)| Hash::from_slice(&v))
            .unwrap_or(Hash::ZERO))
    }

    /// Every address with a hash chain entry at or before `block`, sorted.
    pub fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>, ArchiveError> {
        let rows = self.collect_prefix(&[KeyType::AccountHash as u8])?;
        let mut addresses = std::collections::BTreeSet::new();
        for (k, _) in rows {
            if block_from_property_key(&k) <= block {
                addresses.insert(address_from_key(&k));
            }
        }
        Ok(addresses.into_iter().collect())
    }

    /// The hash chain value for `address` at `block`, or zero if the
    /// address has never been touched.
    pub fn get_account_hash(&self, block: BlockId, address: &Address) -> Result<Hash, ArchiveError> {
        self.account_hash_at(address, block)
    }

    /// Re-derives every block hash up to `block` from the stored
    /// per-account hash rows and checks it against the stored block hash.
    pub fn verify_hashes(&self, block: BlockId) -> Result<(), ArchiveError> {
        let block_rows = self.collect_prefix(&[KeyType::Block as u8])?;
        let diff_rows = self.collect_prefix(&[KeyType::AccountHash as u8])?;

        let mut diffs: BTreeMap<BlockId, Vec<Hash>> = BTreeMap::new();
        for (k, v) in &diff_rows {
            let b = block_from_property_key(k);
            if b <= block {
                diffs.entry(b).or_default().push(Hash::from_slice(v));
            }
        }

        let mut hash = Hash::ZERO;
        let mut covered = std::collections::BTreeSet::new();
        for (k, v) in &block_rows {
            let b = block_from_property_key(k);
            if b > block {
                continue;
            }
            let mut parts = vec![hash.as_bytes().to_vec()];
            if let Some(hashes) = diffs.get(&b) {
                parts.extend(hashes.iter().map(|h| h.as_bytes().to_vec()));
            }
            hash = combine(parts);
            covered.insert(b);
            if hash != Hash::from_slice(v) {
                return Err(ArchiveError::Corruption(format!("Validation of hash of block {b} failed.")));
            }
        }

        for b in diffs.keys() {
            if !covered.contains(b) {
                return Err(ArchiveError::Corruption(format!(
                    "Found account update for block {b} but no hash for this block."
                )));
            }
        }
        Ok(())
    }

    /// Full verification: checks the root hash at `block`, re-derives the
    /// block hash chain, validates every touched account, and rejects any
    /// row outside what the hash chain covers.
    pub fn verify(&self, block: BlockId, expected_hash: Hash) -> Result<(), ArchiveError> {
        #[cfg(feature = "tracing-log")]
        tracing::info!("[carmen-archive] verifying archive up to block {block}");
        if self.get_hash(block)? != expected_hash {
            return Err(ArchiveError::Corruption("Archive hash does not match expected hash.".into()));
        }
        self.verify_hashes(block)?;
        for address in self.get_account_list(block)? {
            self.verify_account(block, &address)?;
        }

        let latest = self.get_latest_block()?.unwrap_or(0);
        let covered_prefix = [KeyType::AccountHash as u8];
        let covered: std::collections::BTreeSet<Address> = self
            .collect_prefix(&covered_prefix)?
            .into_iter()
            .filter(|(k, _)| block_from_property_key(k) <= block)
            .map(|(k, _)| address_from_key(&k))
            .collect();

        for tag in [KeyType::AccountState, KeyType::Balance, KeyType::Nonce, KeyType::Code, KeyType::Storage] {
            let prefix = [tag as u8];
            for (k, _) in self.collect_prefix(&prefix)? {
                let address = address_from_key(&k);
                let row_block = block_from_property_key(&k);
                if row_block <= block && !covered.contains(&address) {
                    return Err(ArchiveError::Corruption(format!(
                        "Found extra key/value pair in key space `{}`.",
                        tag.label()
                    )));
                }
                if row_block > latest {
                    return Err(ArchiveError::Corruption(format!(
                        "Found entry of future block height in `{}`.",
                        tag.label()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reconstructs the full per-block history of `address` up to `block`
    /// from the raw rows and checks the reincarnation discipline and hash
    /// chain against what is stored.
    pub fn verify_account(&self, block: BlockId, address: &Address) -> Result<(), ArchiveError> {
        let mut by_block: BTreeMap<BlockId, AccountUpdate> = BTreeMap::new();

        for (k, v) in self.collect_prefix(&property_prefix(KeyType::AccountState, address))? {
            let b = block_from_property_key(&k);
            if b > block {
                continue;
            }
            let state = AccountState::decode(&v)?;
            let entry = by_block.entry(b).or_default();
            entry.created = state.exists;
            entry.deleted = !state.exists;
        }
        for (k, v) in self.collect_prefix(&property_prefix(KeyType::Balance, address))? {
            let b = block_from_property_key(&k);
            if b <= block {
                by_block.entry(b).or_default().balance = Some(Balance::from_slice(&v));
            }
        }
        for (k, v) in self.collect_prefix(&property_prefix(KeyType::Nonce, address))? {
            let b = block_from_property_key(&k);
            if b <= block {
                by_block.entry(b).or_default().nonce = Some(Nonce::from_slice(&v));
            }
        }
        for (k, v) in self.collect_prefix(&property_prefix(KeyType::Code, address))? {
            let b = block_from_property_key(&k);
            if b <= block {
                by_block.entry(b).or_default().code = Some(Code::from(v));
            }
        }

        let mut storage_reincarnations: BTreeMap<BlockId, Vec<ReincarnationNumber>> = BTreeMap::new();
        for (k, v) in self.collect_prefix(&storage_account_prefix(address))? {
            let b = block_from_property_key(&k);
            if b > block {
                continue;
            }
            let slot = slot_from_storage_key(&k);
            let reincarnation = reincarnation_from_storage_key(&k);
            by_block.entry(b).or_default().storage.push((slot, Value::from_slice(&v)));
            storage_reincarnations.entry(b).or_default().push(reincarnation);
        }

        let hash_rows: BTreeMap<BlockId, Hash> = self
            .collect_prefix(&property_prefix(KeyType::AccountHash, address))?
            .into_iter()
            .filter(|(k, _)| block_from_property_key(k) <= block)
            .map(|(k, v)| (block_from_property_key(&k), Hash::from_slice(&v)))
            .collect();

        let mut reincarnation: Option<ReincarnationNumber> = None;
        let mut hash = Hash::ZERO;
        for (&b, update) in &by_block {
            if update.created || update.deleted {
                let expected_next = reincarnation.map(|r| r + 1).unwrap_or(0);
                let state_value = self
                    .db()?
                    .get(property_key(KeyType::AccountState, address, b))
                    .map_err(ArchiveError::from)?
                    .ok_or_else(|| ArchiveError::Corruption(format!("missing account state row at block {b}")))?;
                let decoded = AccountState::decode(&state_value)?;
                if decoded.reincarnation != expected_next {
                    return Err(ArchiveError::Corruption(format!(
                        "Reincarnation numbers are not incremental, at block {} the value moves from {} to {}",
                        b,
                        reincarnation.map(|r| r as i64).unwrap_or(-1),
                        decoded.reincarnation
                    )));
                }
                reincarnation = Some(decoded.reincarnation);
            }

            let current_reincarnation = reincarnation.unwrap_or(0);
            if let Some(reincarnations) = storage_reincarnations.get(&b) {
                for r in reincarnations {
                    if *r != current_reincarnation {
                        return Err(ArchiveError::Corruption(format!(
                            "Invalid reincarnation number for storage value at block {b}, expected {current_reincarnation}, got {r}"
                        )));
                    }
                }
            }

            let mut update = update.clone();
            update.storage.sort_by_key(|(slot, _)| *slot);
            let dh = update.diff_hash();
            hash = combine([hash.as_bytes(), dh.as_bytes()]);

            match hash_rows.get(&b) {
                Some(stored) => {
                    if *stored != hash {
                        return Err(ArchiveError::Corruption(format!("Hash for diff at block {b} does not match.")));
                    }
                }
                None => {
                    return Err(ArchiveError::Corruption(format!(
                        "Archive contains update for block {b} but no hash for it."
                    )));
                }
            }
        }

        for (&b, _) in hash_rows.iter() {
            if !by_block.contains_key(&b) {
                return Err(ArchiveError::Corruption(format!(
                    "Archive contains hash for update at block {b} but no change for it."
                )));
            }
        }

        Ok(())
    }

    /// No-op: RocksDB writes are already durable once `write` returns.
    pub fn flush(&self) -> Result<(), ArchiveError> {
        Ok(())
    }

    /// Closes the database. Further operations fail with a precondition
    /// error.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        self.db = None;
        Ok(())
    }
}

impl Drop for KvArchive {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> (tempfile::TempDir, KvArchive) {
        let dir = tempfile::tempdir().unwrap();
        let a = KvArchive::open(dir.path().join("db")).unwrap();
        (dir, a)
    }

    #[test]
    fn empty_archive_reads_as_zero() {
        let (_dir, a) = archive();
        assert_eq!(a.get_hash(10).unwrap(), Hash::ZERO);
        let addr = Address::from_slice(&[1; 20]);
        let key = Key::from_slice(&[2; 32]);
        assert_eq!(a.get_storage(10, &addr, &key).unwrap(), Value::ZERO);
        assert!(a.verify(10, Hash::ZERO).is_ok());
    }

    #[test]
    fn reject_out_of_order_block() {
        let (_dir, mut a) = archive();
        let addr = Address::from_slice(&[1; 20]);
        let mut u1 = Update::new();
        u1.create_account(addr);
        a.add(5, &u1).unwrap();
        let mut u2 = Update::new();
        u2.create_account(addr);
        let err = a.add(3, &u2).unwrap_err();
        assert!(err.to_string().contains("Unable to insert block 3"));
    }

    /// Block 1 creates the account and sets every property; block 3
    /// deletes it while simultaneously overwriting every property in the
    /// same update; block 5 recreates it with a fresh balance.
    fn s2_state() -> (tempfile::TempDir, KvArchive, Address) {
        let (dir, mut a) = archive();
        let addr = Address::from_slice(&[1; 20]);
        let slot1 = Key::from_slice(&[0x15; 32]);
        let slot3 = Key::from_slice(&[0x35; 32]);

        let mut u1 = Update::new();
        u1.create_account(addr);
        u1.set_balance(addr, Balance::from_slice(&[0x12; 32]));
        u1.set_nonce(addr, Nonce::from_slice(&[0x13; 8]));
        u1.set_code(addr, Code::from(vec![0x14]));
        u1.set_storage(addr, slot1, Value::from_slice(&[0x16; 32]));
        a.add(1, &u1).unwrap();

        let mut u3 = Update::new();
        u3.delete_account(addr);
        u3.set_balance(addr, Balance::from_slice(&[0x31; 32]));
        u3.set_nonce(addr, Nonce::from_slice(&[0x33; 8]));
        u3.set_code(addr, Code::from(vec![0x34]));
        u3.set_storage(addr, slot3, Value::from_slice(&[0x36; 32]));
        a.add(3, &u3).unwrap();

        let mut u5 = Update::new();
        u5.create_account(addr);
        u5.set_balance(addr, Balance::from_slice(&[0x51; 32]));
        a.add(5, &u5).unwrap();

        (dir, a, addr)
    }

    #[test]
    fn full_lifecycle_round_trips_and_verifies() {
        let (_dir, a, addr) = s2_state();

        for b in 0..10u32 {
            a.verify_account(b, &addr).unwrap();
        }
        let hash = a.get_hash(10).unwrap();
        a.verify(10, hash).unwrap();

        assert_eq!(a.get_balance(2, &addr).unwrap(), Balance::from_slice(&[0x12; 32]));
        assert!(!a.exists(4, &addr).unwrap());
        assert!(a.exists(1, &addr).unwrap());
    }

    #[test]
    fn corrupted_balance_row_fails_verification() {
        let (_dir, a, addr) = s2_state();
        let original_hash = a.get_hash(10).unwrap();

        a.db()
            .unwrap()
            .put(property_key(KeyType::Balance, &addr, 3), Balance::from_slice(&[0xff; 32]).as_bytes())
            .unwrap();

        let err = a.verify_account(10, &addr).unwrap_err();
        assert!(err.to_string().contains("Hash for diff at block 3 does not match."));
        let err = a.verify(10, original_hash).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn missing_account_hash_row_fails_verification() {
        let (_dir, a, addr) = s2_state();

        a.db()
            .unwrap()
            .delete(property_key(KeyType::AccountHash, &addr, 3))
            .unwrap();

        let err = a.verify_account(10, &addr).unwrap_err();
        assert!(err.to_string().contains("Archive contains update for block 3 but no hash for it."));
    }

    #[test]
    fn extra_row_for_untracked_address_fails_verification() {
        let (_dir, a, _addr) = s2_state();
        let hash = a.get_hash(10).unwrap();

        let stray = Address::from_slice(&[2; 20]);
        a.db()
            .unwrap()
            .put(
                property_key(KeyType::Balance, &stray, 1),
                Balance::from_slice(&[9; 32]).as_bytes(),
            )
            .unwrap();

        let err = a.verify(10, hash).unwrap_err();
        assert!(err.to_string().contains("Found extra key/value pair in key space `balance`."));
    }
}
