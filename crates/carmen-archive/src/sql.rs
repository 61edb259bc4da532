//! The relational backing: one SQLite database with a table per property,
//! mirroring the key/value schema but addressed by ordinary `SELECT`s.

use std::collections::BTreeMap;
use std::path::Path;

use carmen_types::{combine, Address, Balance, BlockId, Code, Hash, Key, Nonce, ReincarnationNumber, Value};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{closed, ArchiveError};
use crate::update::{AccountUpdate, Update};

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS block (number INT PRIMARY KEY, hash BLOB);
CREATE TABLE IF NOT EXISTS account_hash (account BLOB, block INT, hash BLOB, PRIMARY KEY(account,block));
CREATE TABLE IF NOT EXISTS status (account BLOB, block INT, exist INT, reincarnation INT, PRIMARY KEY (account,block));
CREATE TABLE IF NOT EXISTS balance (account BLOB, block INT, value BLOB, PRIMARY KEY (account,block));
CREATE TABLE IF NOT EXISTS code (account BLOB, block INT, code BLOB, PRIMARY KEY (account,block));
CREATE TABLE IF NOT EXISTS nonce (account BLOB, block INT, value BLOB, PRIMARY KEY (account,block));
CREATE TABLE IF NOT EXISTS storage (account BLOB, reincarnation INT, slot BLOB, block INT, value BLOB, PRIMARY KEY (account,reincarnation,slot,block));
";

/// An archive backed by a SQLite database, one table per property.
pub struct SqlArchive {
    conn: Option<Connection>,
}

impl SqlArchive {
    /// Opens (creating if necessary) the SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let conn = Connection::open(path).map_err(ArchiveError::from)?;
        conn.execute_batch(CREATE_TABLES).map_err(ArchiveError::from)?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection, ArchiveError> {
        self.conn.as_ref().ok_or_else(closed)
    }

    /// The highest block added, or `None` if the archive is empty.
    pub fn get_latest_block(&self) -> Result<Option<BlockId>, ArchiveError> {
        let conn = self.conn()?;
        conn.query_row("SELECT number FROM block ORDER BY number DESC LIMIT 1", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .map_err(ArchiveError::from)
        .map(|v| v.map(|n| n as BlockId))
    }

    /// Appends the per-block update. Empty updates are silently ignored.
    /// `block` must be strictly greater than the archive's latest block.
    pub fn add(&mut self, block: BlockId, update: &Update) -> Result<(), ArchiveError> {
        if update.is_empty() {
            return Ok(());
        }
        if let Some(latest) = self.get_latest_block()? {
            if block <= latest {
                return Err(ArchiveError::PreconditionFailure(format!(
                    "Unable to insert block {block}, archive already contains block {latest}"
                )));
            }
        }

        let addresses = update.touched_addresses();
        #[cfg(feature = "tracing-log")]
        tracing::info!("[carmen-archive] adding block {block} ({} touched accounts)", addresses.len());
        let mut account_hashes: Vec<(Address, Hash)> = Vec::with_capacity(addresses.len());

        let conn = self.conn()?;
        conn.execute_batch("BEGIN TRANSACTION").map_err(ArchiveError::from)?;
        let result = (|| -> Result<(), ArchiveError> {
            for address in &addresses {
                let Some(account_update) = update.account_update(address) else {
                    continue;
                };
                stage_account_update(conn, address, block, &account_update)?;
                let dh = account_update.diff_hash();
                let prev = account_hash_at(conn, address, block)?;
                let new_hash = combine([prev.as_bytes(), dh.as_bytes()]);
                conn.execute(
                    "INSERT INTO account_hash(account, block, hash) VALUES (?1,?2,?3)",
                    params![address.as_bytes(), block, new_hash.as_bytes()],
                )?;
                account_hashes.push((*address, new_hash));
            }

            let prev_block_hash = get_hash_tx(conn, block)?;
            let block_hash = combine(
                std::iter::once(prev_block_hash.as_bytes().to_vec())
                    .chain(account_hashes.iter().map(|(_, h)| h.as_bytes().to_vec())),
            );
            conn.execute(
                "INSERT INTO block(number,hash) VALUES (?1,?2)",
                params![block, block_hash.as_bytes()],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("END TRANSACTION").map_err(ArchiveError::from)?;
                Ok(())
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK").map_err(ArchiveError::from)?;
                Err(e)
            }
        }
    }

    /// True if `address` exists (was created and not subsequently deleted)
    /// as of `block`.
    pub fn exists(&self, block: BlockId, address: &Address) -> Result<bool, ArchiveError> {
        let conn = self.conn()?;
        let exist: Option<i64> = conn
            .query_row(
                "SELECT exist FROM status WHERE account = ?1 AND block <= ?2 ORDER BY block DESC LIMIT 1",
                params![address.as_bytes(), block],
                |row| row.get(0),
            )
            .optional()
            .map_err(ArchiveError::from)?;
        Ok(exist.map(|v| v != 0).unwrap_or(false))
    }

    /// `address`'s balance at `block`, or zero if never set.
    pub fn get_balance(&self, block: BlockId, address: &Address) -> Result<Balance, ArchiveError> {
        let bytes = self.latest_blob("balance", address, block)?;
        Ok(bytes.map(|b| Balance::from_slice(&b)).unwrap_or(Balance::ZERO))
    }

    /// `address`'s nonce at `block`, or zero if never set.
    pub fn get_nonce(&self, block: BlockId, address: &Address) -> Result<Nonce, ArchiveError> {
        let bytes = self.latest_blob("nonce", address, block)?;
        Ok(bytes.map(|b| Nonce::from_slice(&b)).unwrap_or(Nonce::ZERO))
    }

    /// `address`'s code at `block`, or empty if never set.
    pub fn get_code(&self, block: BlockId, address: &Address) -> Result<Code, ArchiveError> {
        let conn = self.conn()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT code FROM code WHERE account = ?1 AND block <= ?2 ORDER BY block DESC LIMIT 1",
                params![address.as_bytes(), block],
                |row| row.get(0),
            )
            .optional()
            .map_err(ArchiveError::from)?;
        Ok(bytes.map(Code::from).unwrap_or_default())
    }

    fn latest_blob(&self, table: &str, address: &Address, block: BlockId) -> Result<Option<Vec<u8>>, ArchiveError> {
        let conn = self.conn()?;
        let sql = format!("SELECT value FROM {table} WHERE account = ?1 AND block <= ?2 ORDER BY block DESC LIMIT 1");
        conn.query_row(&sql, params![address.as_bytes(), block], |row| row.get(0))
            .optional()
            .map_err(ArchiveError::from)
    }

    /// The value of storage slot `key` for `address` at `block`, or zero
    /// if never written.
    pub fn get_storage(&self, block: BlockId, address: &Address, key: &Key) -> Result<Value, ArchiveError> {
        let conn = self.conn()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM storage WHERE account = ?1 AND reincarnation = \
                 (SELECT IFNULL(MAX(reincarnation),0) FROM status WHERE account = ?1 AND block <= ?3) \
                 AND slot = ?2 AND block <= ?3 ORDER BY block DESC LIMIT 1",
                params![address.as_bytes(), key.as_bytes(), block],
                |row| row.get(0),
            )
            .optional()
            .map_err(ArchiveError::from)?;
        Ok(bytes.map(|b| Value::from_slice(&b)).unwrap_or(Value::ZERO))
    }

    /// The root hash covering every block up to and including `block`, or
    /// zero if no block that low has been added.
    pub fn get_hash(&self, block: BlockId) -> Result<Hash, ArchiveError> {
        get_hash_tx(self.conn()?, block)
    }

    /// Every address with a hash chain entry at or before `block`, sorted.
    pub fn get_account_list(&self, block: BlockId) -> Result<Vec<Address>, ArchiveError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT account FROM account_hash WHERE block <= ?1 ORDER BY account")
            .map_err(ArchiveError::from)?;
        let rows = stmt
            .query_map(params![block], |row| row.get::<_, Vec<u8>>(0))
            .map_err(ArchiveError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Address::from_slice(&row.map_err(ArchiveError::from)?));
        }
        Ok(out)
    }

    /// The hash chain value for `address` at `block`, or zero if the
    /// address has never been touched.
    pub fn get_account_hash(&self, block: BlockId, address: &Address) -> Result<Hash, ArchiveError> {
        account_hash_at(self.conn()?, address, block)
    }

    /// Re-derives every block hash up to `block` from the stored
    /// per-account hash rows and checks it against the stored block hash.
    pub fn verify_hashes(&self, block: BlockId) -> Result<(), ArchiveError> {
        let conn = self.conn()?;
        let mut block_stmt = conn
            .prepare("SELECT number, hash FROM block WHERE number <= ?1 ORDER BY number")
            .map_err(ArchiveError::from)?;
        let block_rows: Vec<(BlockId, Hash)> = block_stmt
            .query_map(params![block], |row| {
                let n: i64 = row.get(0)?;
                let h: Vec<u8> = row.get(1)?;
                Ok((n as BlockId, Hash::from_slice(&h)))
            })
            .map_err(ArchiveError::from)?
            .collect::<Result<_, _>>()
            .map_err(ArchiveError::from)?;

        let mut diff_stmt = conn
            .prepare("SELECT block, hash FROM account_hash WHERE block <= ?1 ORDER BY block, account")
            .map_err(ArchiveError::from)?;
        let diff_rows: Vec<(BlockId, Hash)> = diff_stmt
            .query_map(params![block], |row| {
                let n: i64 = row.get(0)?;
                let h: Vec<u8> = row.get(1)?;
                Ok((n as BlockId, Hash::from_slice(&h)))
            })
            .map_err(ArchiveError::from)?
            .collect::<Result<_, _>>()
            .map_err(ArchiveError::from)?;

        let mut diffs: BTreeMap<BlockId, Vec<Hash>> = BTreeMap::new();
        for (b, h) in diff_rows {
            diffs.entry(b).or_default().push(h);
        }

        let mut hash = Hash::ZERO;
        let mut covered = std::collections::BTreeSet::new();
        for (b, stored) in &block_rows {
            let mut parts = vec![hash.as_bytes().to_vec()];
            if let Some(hashes) = diffs.get(b) {
                parts.extend(hashes.iter().map(|h| h.as_bytes().to_vec()));
            }
            hash = combine(parts);
            covered.insert(*b);
            if hash != *stored {
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
        let conn = self.conn()?;
        for table in ["status", "balance", "nonce", "code", "storage"] {
            let extra_sql = format!(
                "SELECT 1 FROM (SELECT account FROM {table} WHERE block <= ?1 \
                 EXCEPT SELECT account FROM account_hash WHERE block <= ?1) LIMIT 1"
            );
            let found: Option<i64> = conn
                .query_row(&extra_sql, params![block], |row| row.get(0))
                .optional()
                .map_err(ArchiveError::from)?;
            if found.is_some() {
                return Err(ArchiveError::Corruption(format!("Found extra row of data in table `{table}`.")));
            }

            let future_sql = format!("SELECT 1 FROM {table} WHERE block > ?1 LIMIT 1");
            let found: Option<i64> = conn
                .query_row(&future_sql, params![latest], |row| row.get(0))
                .optional()
                .map_err(ArchiveError::from)?;
            if found.is_some() {
                return Err(ArchiveError::Corruption(format!("Found entry of future block height in `{table}`.")));
            }
        }
        Ok(())
    }

    /// Reconstructs the full per-block history of `address` up to `block`
    /// from the raw rows and checks the reincarnation discipline and hash
    /// chain against what is stored.
    pub fn verify_account(&self, block: BlockId, address: &Address) -> Result<(), ArchiveError> {
        let conn = self.conn()?;
        let mut by_block: BTreeMap<BlockId, AccountUpdate> = BTreeMap::new();

        {
            let mut stmt = conn
                .prepare("SELECT block, exist, reincarnation FROM status WHERE account = ?1 AND block <= ?2 ORDER BY block")
                .map_err(ArchiveError::from)?;
            let rows = stmt
                .query_map(params![address.as_bytes(), block], |row| {
                    let b: i64 = row.get(0)?;
                    let exist: i64 = row.get(1)?;
                    let reincarnation: i64 = row.get(2)?;
                    Ok((b as BlockId, exist != 0, reincarnation as ReincarnationNumber))
                })
                .map_err(ArchiveError::from)?;
            for row in rows {
                let (b, exist, _) = row.map_err(ArchiveError::from)?;
                let entry = by_block.entry(b).or_default();
                entry.created = exist;
                entry.deleted = !exist;
            }
        }
        for (table, setter): (&str, fn(&mut AccountUpdate, Vec<u8>)) in [
            ("balance", (|u: &mut AccountUpdate, v: Vec<u8>| u.balance = Some(Balance::from_slice(&v))) as fn(&mut AccountUpdate, Vec<u8>)),
            ("nonce", (|u: &mut AccountUpdate, v: Vec<u8>| u.nonce = Some(Nonce::from_slice(&v))) as fn(&mut AccountUpdate, Vec<u8>)),
        ] {
            let sql = format!("SELECT block, value FROM {table} WHERE account = ?1 AND block <= ?2 ORDER BY block");
            let mut stmt = conn.prepare(&sql).map_err(ArchiveError::from)?;
            let rows = stmt
                .query_map(params![address.as_bytes(), block], |row| {
                    let b: i64 = row.get(0)?;
                    let v: Vec<u8> = row.get(1)?;
                    Ok((b as BlockId, v))
                })
                .map_err(ArchiveError::from)?;
            for row in rows {
                let (b, v) = row.map_err(ArchiveError::from)?;
                setter(by_block.entry(b).or_default(), v);
            }
        }
        {
            let mut stmt = conn
                .prepare("SELECT block, code FROM code WHERE account = ?1 AND block <= ?2 ORDER BY block")
                .map_err(ArchiveError::from)?;
            let rows = stmt
                .query_map(params![address.as_bytes(), block], |row| {
                    let b: i64 = row.get(0)?;
                    let v: Vec<u8> = row.get(1)?;
                    Ok((b as BlockId, v))
                })
                .map_err(ArchiveError::from)?;
            for row in rows {
                let (b, v) = row.map_err(ArchiveError::from)?;
                by_block.entry(b).or_default().code = Some(Code::from(v));
            }
        }

        let mut storage_reincarnations: BTreeMap<BlockId, Vec<ReincarnationNumber>> = BTreeMap::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT block, reincarnation, slot, value FROM storage WHERE account = ?1 AND block <= ?2 ORDER BY block",
                )
                .map_err(ArchiveError::from)?;
            let rows = stmt
                .query_map(params![address.as_bytes(), block], |row| {
                    let b: i64 = row.get(0)?;
                    let r: i64 = row.get(1)?;
                    let slot: Vec<u8> = row.get(2)?;
                    let v: Vec<u8> = row.get(3)?;
                    Ok((b as BlockId, r as ReincarnationNumber, slot, v))
                })
                .map_err(ArchiveError::from)?;
            for row in rows {
                let (b, r, slot, v) = row.map_err(ArchiveError::from)?;
                by_block
                    .entry(b)
                    .or_default()
                    .storage
                    .push((Key::from_slice(&slot), Value::from_slice(&v)));
                storage_reincarnations.entry(b).or_default().push(r);
            }
        }

        let mut hash_rows: BTreeMap<BlockId, Hash> = BTreeMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT block, hash FROM account_hash WHERE account = ?1 AND block <= ?2 ORDER BY block")
                .map_err(ArchiveError::from)?;
            let rows = stmt
                .query_map(params![address.as_bytes(), block], |row| {
                    let b: i64 = row.get(0)?;
                    let h: Vec<u8> = row.get(1)?;
                    Ok((b as BlockId, Hash::from_slice(&h)))
                })
                .map_err(ArchiveError::from)?;
            for row in rows {
                let (b, h) = row.map_err(ArchiveError::from)?;
                hash_rows.insert(b, h);
            }
        }

        let mut reincarnation: Option<ReincarnationNumber> = None;
        let mut hash = Hash::ZERO;
        for (&b, update) in &by_block {
            if update.created || update.deleted {
                let expected_next = reincarnation.map(|r| r + 1).unwrap_or(0);
                let actual: ReincarnationNumber = conn
                    .query_row(
                        "SELECT reincarnation FROM status WHERE account = ?1 AND block = ?2",
                        params![address.as_bytes(), b],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(ArchiveError::from)? as ReincarnationNumber;
                if actual != expected_next {
                    return Err(ArchiveError::Corruption(format!(
                        "Reincarnation numbers are not incremental, at block {} the value moves from {} to {}",
                        b,
                        reincarnation.map(|r| r as i64).unwrap_or(-1),
                        actual
                    )));
                }
                reincarnation = Some(actual);
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

        for &b in hash_rows.keys() {
            if !by_block.contains_key(&b) {
                return Err(ArchiveError::Corruption(format!(
                    "Archive contains hash for update at block {b} but no change for it."
                )));
            }
        }

        Ok(())
    }

    /// Flushes any pending writes to disk.
    pub fn flush(&self) -> Result<(), ArchiveError> {
        self.conn()?.execute_batch("PRAGMA wal_checkpoint(FULL)").map_err(ArchiveError::from)
    }

    /// Closes the database. Further operations fail with a precondition
    /// error.
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        self.conn = None;
        Ok(())
    }
}

impl Drop for SqlArchive {
    fn drop(&mut self) {
        if self.conn.is_some() {
            let _ = self.flush();
            let _ = self.close();
        }
    }
}

fn account_hash_at(conn: &Connection, address: &Address, block: BlockId) -> Result<Hash, ArchiveError> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT hash FROM account_hash WHERE account = ?1 AND block <= ?2 ORDER BY block DESC LIMIT 1",
            params![address.as_bytes(), block],
            |row| row.get(0),
        )
        .optional()
        .map_err(ArchiveError::from)?;
    Ok(bytes.map(|b| Hash::from_slice(&b)).unwrap_or(Hash::ZERO))
}

fn get_hash_tx(conn: &Connection, block: BlockId) -> Result<Hash, ArchiveError> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT hash FROM block WHERE number <= ?1 ORDER BY number DESC LIMIT 1",
            params![block],
            |row| row.get(0),
        )
        .optional()
        .map_err(ArchiveError::from)?;
    Ok(bytes.map(|b| Hash::from_slice(&b)).unwrap_or(Hash::ZERO))
}

fn stage_account_update(
    conn: &Connection,
    address: &Address,
    block: BlockId,
    update: &AccountUpdate,
) -> Result<ReincarnationNumber, ArchiveError> {
    let r_before: ReincarnationNumber = conn
        .query_row(
            "SELECT IFNULL(MAX(reincarnation),0) FROM status WHERE account = ?1 AND block <= ?2",
            params![address.as_bytes(), block],
            |row| row.get::<_, i64>(0),
        )
        .map_err(ArchiveError::from)? as ReincarnationNumber;

    let r_effective = if update.created || update.deleted {
        conn.execute(
            "INSERT INTO status(account,block,exist,reincarnation) VALUES \
             (?1,?2,?3,(SELECT IFNULL(MAX(reincarnation)+1,0) FROM status WHERE account = ?1))",
            params![address.as_bytes(), block, (update.created && !update.deleted) as i64],
        )
        .map_err(ArchiveError::from)?;
        conn.query_row(
            "SELECT IFNULL(MAX(reincarnation),0) FROM status WHERE account = ?1 AND block <= ?2",
            params![address.as_bytes(), block],
            |row| row.get::<_, i64>(0),
        )
        .map_err(ArchiveError::from)? as ReincarnationNumber
    } else {
        r_before
    };

    if let Some(balance) = update.balance {
        conn.execute(
            "INSERT INTO balance(account,block,value) VALUES (?1,?2,?3)",
            params![address.as_bytes(), block, balance.as_bytes()],
        )
        .map_err(ArchiveError::from)?;
    }
    if let Some(nonce) = update.nonce {
        conn.execute(
            "INSERT INTO nonce(account,block,value) VALUES (?1,?2,?3)",
            params![address.as_bytes(), block, nonce.as_bytes()],
        )
        .map_err(ArchiveError::from)?;
    }
    if let Some(code) = &update.code {
        conn.execute(
            "INSERT INTO code(account,block,code) VALUES (?1,?2,?3)",
            params![address.as_bytes(), block, code.as_bytes()],
        )
        .map_err(ArchiveError::from)?;
    }
    for (slot, value) in &update.storage {
        conn.execute(
            "INSERT INTO storage(account,reincarnation,slot,block,value) VALUES (?1,?2,?3,?4,?5)",
            params![address.as_bytes(), r_effective, slot.as_bytes(), block, value.as_bytes()],
        )
        .map_err(ArchiveError::from)?;
    }
    Ok(r_effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> (tempfile::TempDir, SqlArchive) {
        let dir = tempfile::tempdir().unwrap();
        let a = SqlArchive::open(dir.path().join("archive.sqlite")).unwrap();
        (dir, a)
    }

    #[test]
    fn empty_archive_reads_as_zero() {
        let (_dir, a) = archive();
        assert_eq!(a.get_hash(10).unwrap(), Hash::ZERO);
        let addr = Address::from_slice(&[1; 20]);
        assert_eq!(a.get_balance(10, &addr).unwrap(), Balance::ZERO);
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
    fn s2_state() -> (tempfile::TempDir, SqlArchive, Address) {
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

        a.conn()
            .unwrap()
            .execute(
                "UPDATE balance SET value = ?1 WHERE account = ?2 AND block = ?3",
                params![Balance::from_slice(&[0xff; 32]).as_bytes(), addr.as_bytes(), 3i64],
            )
            .unwrap();

        let err = a.verify_account(10, &addr).unwrap_err();
        assert!(err.to_string().contains("Hash for diff at block 3 does not match."));
        let err = a.verify(10, original_hash).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn extra_row_for_untracked_address_fails_verification() {
        let (_dir, a, _addr) = s2_state();
        let hash = a.get_hash(10).unwrap();

        let stray = Address::from_slice(&[2; 20]);
        a.conn()
            .unwrap()
            .execute(
                "INSERT INTO balance(account,block,value) VALUES (?1,?2,?3)",
                params![stray.as_bytes(), 1i64, Balance::from_slice(&[9; 32]).as_bytes()],
            )
            .unwrap();

        let err = a.verify(10, hash).unwrap_err();
        assert!(err.to_string().contains("Found extra row of data in table `balance`."));
    }

    #[test]
    fn missing_account_hash_row_fails_verification() {
        let (_dir, a, addr) = s2_state();

        a.conn()
            .unwrap()
            .execute(
                "DELETE FROM account_hash WHERE account = ?1 AND block = ?2",
                params![addr.as_bytes(), 3i64],
            )
            .unwrap();

        let err = a.verify_account(10, &addr).unwrap_err();
        assert!(err.to_string().contains("Archive contains update for block 3 but no hash for it."));
    }
}
