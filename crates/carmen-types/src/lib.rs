//! # carmen-types
//!
//! Primitive value types and the digest hasher shared by the paged storage
//! substrate and the archive engine.
//!
//! ## Types
//!
//! - Fixed-width byte containers: [`Address`], [`Key`], [`Value`],
//!   [`Balance`], [`Nonce`], [`Hash`].
//! - [`Code`]: variable-length contract bytecode.
//! - [`BlockId`] / [`ReincarnationNumber`]: 32-bit monotonic counters.
//! - [`Digest`]: the SHA-256 based hash primitive `H` used throughout the
//!   archive's hash chains and the Merkle hash tree.
//! - [`hash_bytes`] / [`combine`]: one-shot helpers built on [`Digest`].

mod digest;
mod primitives;

pub use digest::{combine, hash_bytes, Digest};
pub use primitives::{Address, Balance, BlockId, Code, Hash, Key, Nonce, ReincarnationNumber, Value};
