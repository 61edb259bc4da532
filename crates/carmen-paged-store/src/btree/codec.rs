//! Fixed-width wire encoding for B-tree keys and values.

use carmen_types::{Address, Hash, Key, Value};

/// A type with a fixed, known-at-compile-time byte width, encodable into
/// and decodable from a page buffer. B-tree keys and values must implement
/// this so node sizes (and hence fan-out) can be computed statically.
pub trait FixedBytes: Copy + Ord + Send + Sync + 'static {
    /// Width in bytes of the encoded form.
    const SIZE: usize;

    /// Encodes `self` into the first `SIZE` bytes of `buf`.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes a value from the first `SIZE` bytes of `buf`.
    fn read_from(buf: &[u8]) -> Self;
}

/// The unit value, used for sets: a B-tree keyed on `(K, ())` stores only
/// keys.
impl FixedBytes for () {
    const SIZE: usize = 0;
    fn write_to(&self, _buf: &mut [u8]) {}
    fn read_from(_buf: &[u8]) {}
}

macro_rules! impl_fixed_bytes_uint {
    ($ty:ty, $size:expr) => {
        impl FixedBytes for $ty {
            const SIZE: usize = $size;
            fn write_to(&self, buf: &mut [u8]) {
                buf[..$size].copy_from_slice(&self.to_be_bytes());
            }
            fn read_from(buf: &[u8]) -> Self {
                <$ty>::from_be_bytes(buf[..$size].try_into().unwrap())
            }
        }
    };
}

impl_fixed_bytes_uint!(u32, 4);
impl_fixed_bytes_uint!(u64, 8);
impl_fixed_bytes_uint!(u16, 2);

macro_rules! impl_fixed_bytes_array_type {
    ($ty:ty) => {
        impl FixedBytes for $ty {
            const SIZE: usize = <$ty>::LEN;
            fn write_to(&self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(self.as_bytes());
            }
            fn read_from(buf: &[u8]) -> Self {
                <$ty>::from_slice(&buf[..Self::SIZE])
            }
        }
    };
}

impl_fixed_bytes_array_type!(Address);
impl_fixed_bytes_array_type!(Key);
impl_fixed_bytes_array_type!(Value);
impl_fixed_bytes_array_type!(Hash);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trips_big_endian_order_preserving() {
        let mut buf = [0u8; 8];
        5u64.write_to(&mut buf);
        assert_eq!(u64::read_from(&buf), 5);
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        5u64.write_to(&mut a);
        300u64.write_to(&mut b);
        assert!(a < b);
    }

    #[test]
    fn address_round_trips() {
        let addr = Address::from_slice(&[7u8; 20]);
        let mut buf = [0u8; Address::LEN];
        addr.write_to(&mut buf);
        assert_eq!(Address::read_from(&buf), addr);
    }
}
