//! Binary key layout for the ordered key/value backing.
//!
//! Every key starts with a one-byte [`KeyType`] tag. Multi-byte integers
//! are big-endian throughout so that lexicographic key order matches
//! numeric order, letting point reads and range scans use plain key
//! comparisons.

use carmen_types::{Address, BlockId, Key, ReincarnationNumber};

/// The key space a stored row belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum KeyType {
    Block = 0x31,
    AccountState = 0x32,
    Balance = 0x33,
    Code = 0x34,
    Nonce = 0x35,
    Storage = 0x36,
    AccountHash = 0x37,
}

impl KeyType {
    /// The table/key-space name used in diagnostic messages, matching the
    /// relational backing's table names.
    pub fn label(self) -> &'static str {
        match self {
            KeyType::Block => "block",
            KeyType::AccountState => "status",
            KeyType::Balance => "balance",
            KeyType::Code => "code",
            KeyType::Nonce => "nonce",
            KeyType::Storage => "storage",
            KeyType::AccountHash => "account_hash",
        }
    }
}

/// `[tag=0x31][block:4BE]`
pub fn block_key(block: BlockId) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = KeyType::Block as u8;
    key[1..5].copy_from_slice(&block.to_be_bytes());
    key
}

/// `[tag][address:20][block:4BE]`, used for account_state, balance, code,
/// nonce and account_hash rows.
pub fn property_key(tag: KeyType, address: &Address, block: BlockId) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = tag as u8;
    key[1..21].copy_from_slice(address.as_bytes());
    key[21..25].copy_from_slice(&block.to_be_bytes());
    key
}

/// `[tag][address:20]`: the prefix shared by every property row for one
/// address, regardless of block.
pub fn property_prefix(tag: KeyType, address: &Address) -> [u8; 21] {
    let mut key = [0u8; 21];
    key[0] = tag as u8;
    key[1..21].copy_from_slice(address.as_bytes());
    key
}

/// `[0x36][address:20][reincarnation:4BE][slot:32][block:4BE]`
pub fn storage_key(address: &Address, reincarnation: ReincarnationNumber, slot: &Key, block: BlockId) -> [u8; 61] {
    let mut key = [0u8; 61];
    key[0] = KeyType::Storage as u8;
    key[1..21].copy_from_slice(address.as_bytes());
    key[21..25].copy_from_slice(&reincarnation.to_be_bytes());
    key[25..57].copy_from_slice(slot.as_bytes());
    key[57..61].copy_from_slice(&block.to_be_bytes());
    key
}

/// `[0x36][address:20][reincarnation:4BE][slot:32]`: the prefix shared by
/// every block's write to one storage slot.
pub fn storage_slot_prefix(address: &Address, reincarnation: ReincarnationNumber, slot: &Key) -> [u8; 57] {
    let mut key = [0u8; 57];
    key[0] = KeyType::Storage as u8;
    key[1..21].copy_from_slice(address.as_bytes());
    key[21..25].copy_from_slice(&reincarnation.to_be_bytes());
    key[25..57].copy_from_slice(slot.as_bytes());
    key
}

/// `[0x36][address:20]`: the prefix shared by every storage row for one
/// address, regardless of reincarnation, slot or block.
pub fn storage_account_prefix(address: &Address) -> [u8; 21] {
    let mut key = [0u8; 21];
    key[0] = KeyType::Storage as u8;
    key[1..21].copy_from_slice(address.as_bytes());
    key
}

/// Decodes the block number out of the trailing 4 bytes of a property key.
pub fn block_from_property_key(key: &[u8]) -> BlockId {
    BlockId::from_be_bytes(key[key.len() - 4..].try_into().expect("4-byte block suffix"))
}

/// Decodes the address embedded at `key[1..21]`.
pub fn address_from_key(key: &[u8]) -> Address {
    Address::from_slice(&key[1..21])
}

/// Decodes the reincarnation number embedded at `key[21..25]` of a storage
/// key.
pub fn reincarnation_from_storage_key(key: &[u8]) -> ReincarnationNumber {
    ReincarnationNumber::from_be_bytes(key[21..25].try_into().expect("4-byte reincarnation field"))
}

/// Decodes the slot embedded at `key[25..57]` of a storage key.
pub fn slot_from_storage_key(key: &[u8]) -> Key {
    Key::from_slice(&key[25..57])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_keys_order_by_block_for_fixed_address() {
        let addr = Address::from_slice(&[9; 20]);
        let a = property_key(KeyType::Balance, &addr, 1);
        let b = property_key(KeyType::Balance, &addr, 2);
        assert!(a < b);
    }

    #[test]
    fn storage_key_round_trips_fields() {
        let addr = Address::from_slice(&[1; 20]);
        let slot = Key::from_slice(&[2; 32]);
        let key = storage_key(&addr, 3, &slot, 4);
        assert_eq!(address_from_key(&key), addr);
        assert_eq!(reincarnation_from_storage_key(&key), 3);
        assert_eq!(slot_from_storage_key(&key), slot);
        assert_eq!(block_from_property_key(&key), 4);
    }

    #[test]
    fn labels_match_relational_table_names() {
        assert_eq!(KeyType::AccountState.label(), "status");
        assert_eq!(KeyType::AccountHash.label(), "account_hash");
    }
}
