//! Error types for block storage operations.

/// Errors that can occur during block device operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The block index lies beyond the end of the device.
    #[error("block {block} out of range (device has {block_count} blocks)")]
    OutOfRange {
        /// Requested block index.
        block: u32,
        /// Number of blocks on the device.
        block_count: u32,
    },

    /// A read or write would cross the end of its page.
    #[error("access at offset {offset} with length {len} overflows page of {page_size} bytes")]
    PageOverflow {
        /// Byte offset within the page.
        offset: u32,
        /// Requested length.
        len: u32,
        /// Device page size.
        page_size: usize,
    },

    /// Not enough free pages for the requested write.
    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
