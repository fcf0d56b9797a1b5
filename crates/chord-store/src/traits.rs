//! Core trait for page-addressed block storage.

use bytes::Bytes;
use chord_types::PAGE_SIZE;

use crate::error::StoreError;

/// Value every byte of an erased page reads back as.
pub const ERASED_BYTE: u8 = 0xFF;

/// Trait for a page-addressed storage medium.
///
/// The device is an array of `block_count()` pages of
/// [`PAGE_SIZE`] bytes. Reads and writes address a single page: the
/// range `offset..offset + len` must stay inside that page. Callers that
/// store larger values split them into page-aligned pieces.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync {
    /// Number of pages on the device.
    fn block_count(&self) -> u32;

    /// Read `len` bytes from `block` starting at `offset`.
    async fn read(&self, block: u32, offset: u32, len: u32) -> Result<Bytes, StoreError>;

    /// Write `data` into `block` starting at `offset`.
    async fn write(&self, block: u32, offset: u32, data: &[u8]) -> Result<(), StoreError>;

    /// Erase `len` bytes starting at the beginning of `block`.
    ///
    /// Every page touched by the range is reset to [`ERASED_BYTE`].
    async fn erase(&self, block: u32, len: u32) -> Result<(), StoreError>;

    /// Total capacity in bytes.
    fn capacity_bytes(&self) -> u64 {
        u64::from(self.block_count()) * PAGE_SIZE as u64
    }
}

/// Validate a single-page access against the device geometry.
pub fn check_access(block: u32, offset: u32, len: u32, block_count: u32) -> Result<(), StoreError> {
    if block >= block_count {
        return Err(StoreError::OutOfRange { block, block_count });
    }
    if offset as usize + len as usize > PAGE_SIZE {
        return Err(StoreError::PageOverflow {
            offset,
            len,
            page_size: PAGE_SIZE,
        });
    }
    Ok(())
}

/// Number of pages an erase of `len` bytes touches (at least one).
pub(crate) fn pages_spanned(len: u32) -> u32 {
    (len as usize).div_ceil(PAGE_SIZE).max(1) as u32
}
