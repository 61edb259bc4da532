//! Fixed-size page buffers: the unit of I/O and caching for the whole
//! storage substrate.

/// The page size used throughout this crate. Chosen to match the common
/// filesystem and `O_DIRECT` block size; every file backing a page-based
/// structure is a multiple of this many bytes.
pub const PAGE_SIZE: usize = 4096;

/// An opaque page identifier: an offset into a page-addressed file,
/// counted in pages rather than bytes.
pub type PageId = u64;

/// A single fixed-size page buffer.
///
/// Pages are plain byte arrays; structures stored on top (B-tree nodes,
/// hash tree leaves, archive metadata) serialize into and out of a page's
/// bytes explicitly rather than being reinterpreted in place.
#[derive(Clone)]
#[repr(align(4096))]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// A fresh, zero-filled page.
    pub fn zeroed() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Builds a page from a byte slice, zero-padding if `data` is shorter
    /// than [`PAGE_SIZE`] and truncating if longer.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut page = Self::zeroed();
        let n = data.len().min(PAGE_SIZE);
        page.data[..n].copy_from_slice(&data[..n]);
        page
    }

    /// Borrows the page's bytes.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Mutably borrows the page's bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}
