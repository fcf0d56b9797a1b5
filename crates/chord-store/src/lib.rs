//! Block storage for chordstore.
//!
//! This crate defines the [`BlockDevice`] trait, the page-addressed medium
//! the key directory writes values into, along with two concrete backends:
//!
//! - [`MemoryDevice`]: volatile pages held in a `RwLock<Vec<u8>>`.
//! - [`FileDevice`]: a single preallocated image file, one page per
//!   [`PAGE_SIZE`](chord_types::PAGE_SIZE) bytes.

mod error;
mod file_device;
mod memory_device;
mod traits;

pub use error::StoreError;
pub use file_device::FileDevice;
pub use memory_device::MemoryDevice;
pub use traits::{BlockDevice, ERASED_BYTE, check_access};
