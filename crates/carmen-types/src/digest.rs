//! The cryptographic digest primitive `H` referenced throughout the archive
//! spec: a hasher producing a 32-byte output, used both for the per-account
//! and per-block hash chains and for the Merkle hash tree over pages.

use crate::Hash;
use sha2::{Digest as _, Sha256};

/// An incremental hasher over an ordered sequence of byte strings.
///
/// Mirrors the `Sha256Hasher`/`GetSha256Hash` pattern used by the archive:
/// callers ingest one or more byte spans and then finalize to a [`Hash`].
#[derive(Default)]
pub struct Digest {
    inner: Sha256,
}

impl Digest {
    /// Starts a new, empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds another chunk of bytes into the running hash.
    pub fn ingest(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.inner.update(data.as_ref());
        self
    }

    /// Consumes the digest and returns the final hash.
    pub fn finish(self) -> Hash {
        Hash(self.inner.finalize().into())
    }
}

/// Hashes a single byte span.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> Hash {
    let mut d = Digest::new();
    d.ingest(data);
    d.finish()
}

/// Combines a sequence of byte spans into a single hash, in order. This is
/// the primitive used to extend per-account and per-block hash chains:
/// `combine([prev, diff])` implements `H(prev, diff)`.
pub fn combine<I, B>(parts: I) -> Hash
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut d = Digest::new();
    for part in parts {
        d.ingest(part);
    }
    d.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_is_deterministic() {
        assert_eq!(hash_bytes(b""), hash_bytes(b""));
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = combine([b"a".as_slice(), b"b".as_slice()]);
        let b = combine([b"b".as_slice(), b"a".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn combine_matches_sequential_ingest() {
        let mut d = Digest::new();
        d.ingest(b"a");
        d.ingest(b"b");
        let expected = d.finish();
        assert_eq!(combine([b"a".as_slice(), b"b".as_slice()]), expected);
    }
}
