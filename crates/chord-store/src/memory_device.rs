//! In-memory block device.

use std::sync::RwLock;

use bytes::Bytes;
use chord_types::PAGE_SIZE;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{BlockDevice, ERASED_BYTE, check_access, pages_spanned};

/// In-memory block device backed by a `RwLock<Vec<u8>>`.
///
/// Starts fully erased. Useful for tests and for nodes configured to run
/// in memory-only mode.
pub struct MemoryDevice {
    pages: RwLock<Vec<u8>>,
    block_count: u32,
}

impl MemoryDevice {
    /// Create a device with `block_count` erased pages.
    pub fn new(block_count: u32) -> Self {
        Self {
            pages: RwLock::new(vec![ERASED_BYTE; block_count as usize * PAGE_SIZE]),
            block_count,
        }
    }

    /// Return a reference to the raw page buffer (for testing purposes).
    #[cfg(test)]
    pub(crate) fn inner(&self) -> &RwLock<Vec<u8>> {
        &self.pages
    }
}

#[async_trait::async_trait]
impl BlockDevice for MemoryDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    async fn read(&self, block: u32, offset: u32, len: u32) -> Result<Bytes, StoreError> {
        check_access(block, offset, len, self.block_count)?;
        let pages = self.pages.read().expect("lock poisoned");
        let start = block as usize * PAGE_SIZE + offset as usize;
        Ok(Bytes::copy_from_slice(&pages[start..start + len as usize]))
    }

    async fn write(&self, block: u32, offset: u32, data: &[u8]) -> Result<(), StoreError> {
        check_access(block, offset, data.len() as u32, self.block_count)?;
        let mut pages = self.pages.write().expect("lock poisoned");
        let start = block as usize * PAGE_SIZE + offset as usize;
        pages[start..start + data.len()].copy_from_slice(data);
        debug!(block, offset, size = data.len(), "wrote page in memory");
        Ok(())
    }

    async fn erase(&self, block: u32, len: u32) -> Result<(), StoreError> {
        let count = pages_spanned(len);
        let last = block.saturating_add(count - 1);
        check_access(last, 0, 0, self.block_count)?;
        let mut pages = self.pages.write().expect("lock poisoned");
        let start = block as usize * PAGE_SIZE;
        let end = start + count as usize * PAGE_SIZE;
        pages[start..end].fill(ERASED_BYTE);
        debug!(block, pages = count, "erased pages in memory");
        Ok(())
    }
}
