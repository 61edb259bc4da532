//! Fixed-width byte containers used as keys and values across the archive
//! and paged store. All are zero-initialised by default, ordered
//! lexicographically, and compared byte-for-byte.

use std::fmt;

macro_rules! byte_array_type {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Length in bytes of this container.
            pub const LEN: usize = $len;

            /// The all-zero value.
            pub const ZERO: Self = Self([0u8; $len]);

            /// Borrows the underlying bytes.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Builds a value from a byte slice, zero-padding on the right if
            /// `data` is shorter than `LEN` and truncating if longer.
            pub fn from_slice(data: &[u8]) -> Self {
                let mut out = [0u8; $len];
                let n = data.len().min($len);
                out[..n].copy_from_slice(&data[..n]);
                Self(out)
            }

            /// True if this is the zero value.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; $len]
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x", stringify!($name))?;
                for b in &self.0[..self.0.len().min(4)] {
                    write!(f, "{:02x}", b)?;
                }
                if self.0.len() > 4 {
                    write!(f, "..")?;
                }
                write!(f, ")")
            }
        }
    };
}

byte_array_type!(Address, 20, "A 20-byte account address.");
byte_array_type!(Key, 32, "A 32-byte storage slot key.");
byte_array_type!(Value, 32, "A 32-byte storage slot value.");
byte_array_type!(Balance, 32, "A 32-byte big-endian account balance.");
byte_array_type!(Nonce, 8, "An 8-byte big-endian account transaction counter.");
byte_array_type!(Hash, 32, "A 32-byte cryptographic digest.");

/// Variable-length contract bytecode, ordered lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Code(pub Vec<u8>);

impl Code {
    /// Borrows the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if the code is empty (an externally-owned account).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Code {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl AsRef<[u8]> for Code {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-bit block height, monotonically increasing within an archive.
pub type BlockId = u32;

/// A per-address counter incremented on each account create/delete,
/// partitioning storage writes by account lifetime.
pub type ReincarnationNumber = u32;
