//! The per-block update model: the delta an engine applies in one `Add`,
//! and its canonical per-account decomposition used for diff hashing.

use std::collections::{BTreeMap, BTreeSet};

use carmen_types::{Address, Balance, Code, Digest, Hash, Key, Nonce, Value};

/// A per-block delta: account lifecycle events plus property and storage
/// writes, each keyed by address (and, for storage, also by slot).
#[derive(Default, Clone)]
pub struct Update {
    deleted: BTreeSet<Address>,
    created: BTreeSet<Address>,
    balances: BTreeMap<Address, Balance>,
    nonces: BTreeMap<Address, Nonce>,
    codes: BTreeMap<Address, Code>,
    storage: BTreeMap<Address, BTreeMap<Key, Value>>,
}

impl Update {
    /// An update with no changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `address` is deleted in this block.
    pub fn delete_account(&mut self, address: Address) {
        self.deleted.insert(address);
    }

    /// Records that `address` is (re-)created in this block.
    pub fn create_account(&mut self, address: Address) {
        self.created.insert(address);
    }

    /// Sets the new balance for `address`.
    pub fn set_balance(&mut self, address: Address, balance: Balance) {
        self.balances.insert(address, balance);
    }

    /// Sets the new nonce for `address`.
    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) {
        self.nonces.insert(address, nonce);
    }

    /// Sets the new code for `address`.
    pub fn set_code(&mut self, address: Address, code: Code) {
        self.codes.insert(address, code);
    }

    /// Sets the new value of storage slot `key` for `address`.
    pub fn set_storage(&mut self, address: Address, key: Key, value: Value) {
        self.storage.entry(address).or_default().insert(key, value);
    }

    /// True if this update carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.created.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.storage.is_empty()
    }

    /// Every address touched by this update, in ascending order.
    pub fn touched_addresses(&self) -> BTreeSet<Address> {
        let mut out = BTreeSet::new();
        out.extend(self.deleted.iter().copied());
        out.extend(self.created.iter().copied());
        out.extend(self.balances.keys().copied());
        out.extend(self.nonces.keys().copied());
        out.extend(self.codes.keys().copied());
        out.extend(self.storage.keys().copied());
        out
    }

    /// Builds the canonical per-account view of this update for `address`.
    /// Returns `None` if the address is not touched at all.
    pub fn account_update(&self, address: &Address) -> Option<AccountUpdate> {
        let deleted = self.deleted.contains(address);
        let created = self.created.contains(address);
        let balance = self.balances.get(address).copied();
        let nonce = self.nonces.get(address).copied();
        let code = self.codes.get(address).cloned();
        let storage: Vec<(Key, Value)> = self
            .storage
            .get(address)
            .map(|slots| slots.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default();

        if !deleted && !created && balance.is_none() && nonce.is_none() && code.is_none() && storage.is_empty() {
            return None;
        }
        Some(AccountUpdate {
            created,
            deleted,
            balance,
            nonce,
            code,
            storage,
        })
    }
}

/// The canonical decomposition of one block's update for a single address.
///
/// Storage writes are ordered by slot so that two updates applying the
/// same logical change always serialize identically.
#[derive(Clone, Default)]
pub struct AccountUpdate {
    pub created: bool,
    pub deleted: bool,
    pub balance: Option<Balance>,
    pub nonce: Option<Nonce>,
    pub code: Option<Code>,
    pub storage: Vec<(Key, Value)>,
}

impl AccountUpdate {
    /// Hashes the canonical byte serialization of this update: a status
    /// byte (bit 0 deleted, bit 1 created), then a present-flag and
    /// length-prefixed payload for balance, nonce and code in turn, then
    /// the storage write count followed by ordered `(slot, value)` pairs.
    ///
    /// A lifecycle event collapses to the single `exists` bit that gets
    /// persisted (`created && !deleted`), so a block with both flags set
    /// hashes identically to a plain create, matching what verification
    /// reconstructs from storage.
    pub fn diff_hash(&self) -> Hash {
        let mut digest = Digest::new();
        let mut status = 0u8;
        if self.created || self.deleted {
            let exists = self.created && !self.deleted;
            if exists {
                status |= 0b10;
            } else {
                status |= 0b01;
            }
        }
        digest.ingest([status]);
        ingest_optional(&mut digest, self.balance.as_ref().map(|b| b.as_bytes()));
        ingest_optional(&mut digest, self.nonce.as_ref().map(|n| n.as_bytes()));
        ingest_optional(&mut digest, self.code.as_ref().map(|c| c.as_bytes()));
        digest.ingest((self.storage.len() as u32).to_le_bytes());
        for (slot, value) in &self.storage {
            digest.ingest(slot.as_bytes());
            digest.ingest(value.as_bytes());
        }
        digest.finish()
    }
}

fn ingest_optional(digest: &mut Digest, data: Option<&[u8]>) {
    match data {
        Some(bytes) => {
            digest.ingest([1u8]);
            digest.ingest((bytes.len() as u32).to_le_bytes());
            digest.ingest(bytes);
        }
        None => {
            digest.ingest([0u8]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_has_no_touched_accounts() {
        let update = Update::new();
        assert!(update.is_empty());
        assert!(update.touched_addresses().is_empty());
    }

    #[test]
    fn untouched_address_has_no_account_update() {
        let mut update = Update::new();
        update.set_balance(Address::from_slice(&[1; 20]), Balance::ZERO);
        assert!(update.account_update(&Address::from_slice(&[2; 20])).is_none());
    }

    #[test]
    fn equal_updates_yield_equal_hashes() {
        let a = AccountUpdate {
            created: true,
            deleted: false,
            balance: Some(Balance::from_slice(&[1; 32])),
            nonce: None,
            code: None,
            storage: vec![(Key::from_slice(&[2; 32]), Value::from_slice(&[3; 32]))],
        };
        let b = a.clone();
        assert_eq!(a.diff_hash(), b.diff_hash());
    }

    #[test]
    fn storage_order_changes_hash() {
        let k1 = Key::from_slice(&[1; 32]);
        let v1 = Value::from_slice(&[1; 32]);
        let k2 = Key::from_slice(&[2; 32]);
        let v2 = Value::from_slice(&[2; 32]);
        let a = AccountUpdate {
            storage: vec![(k1, v1), (k2, v2)],
            ..Default::default()
        };
        let b = AccountUpdate {
            storage: vec![(k2, v2), (k1, v1)],
            ..Default::default()
        };
        assert_ne!(a.diff_hash(), b.diff_hash());
    }

    #[test]
    fn created_and_deleted_bits_are_distinguished() {
        let created = AccountUpdate {
            created: true,
            ..Default::default()
        };
        let deleted = AccountUpdate {
            deleted: true,
            ..Default::default()
        };
        assert_ne!(created.diff_hash(), deleted.diff_hash());
    }

    #[test]
    fn created_and_deleted_together_collapses_to_created() {
        let both = AccountUpdate {
            created: true,
            deleted: true,
            ..Default::default()
        };
        let created_only = AccountUpdate {
            created: true,
            deleted: false,
            ..Default::default()
        };
        assert_eq!(both.diff_hash(), created_only.diff_hash());
    }
}
