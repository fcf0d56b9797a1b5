//! File-backed block device.
//!
//! The device is a single image file of `block_count * PAGE_SIZE` bytes;
//! page `n` lives at byte offset `n * PAGE_SIZE`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chord_types::PAGE_SIZE;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::traits::{BlockDevice, ERASED_BYTE, check_access, pages_spanned};

/// Block device persisted in a preallocated image file.
///
/// The file handle sits behind a `Mutex` because every access is a
/// seek followed by a read or write, which must not interleave.
pub struct FileDevice {
    file: Mutex<File>,
    path: PathBuf,
    block_count: u32,
}

impl FileDevice {
    /// Open (or create) the image at `path` with room for `block_count` pages.
    ///
    /// A new or shorter image is extended with erased bytes. An existing
    /// image is reused as is; its pages are not erased on open.
    pub async fn open(path: impl AsRef<Path>, block_count: u32) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let expected = u64::from(block_count) * PAGE_SIZE as u64;
        let current = file.metadata().await?.len();
        if current < expected {
            file.seek(SeekFrom::Start(current)).await?;
            let fill = vec![ERASED_BYTE; (expected - current) as usize];
            file.write_all(&fill).await?;
            file.flush().await?;
            info!(path = %path.display(), block_count, "initialized block image");
        }

        Ok(Self {
            file: Mutex::new(file),
            path,
            block_count,
        })
    }

    /// Path of the backing image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn position(block: u32, offset: u32) -> u64 {
        u64::from(block) * PAGE_SIZE as u64 + u64::from(offset)
    }
}

#[async_trait::async_trait]
impl BlockDevice for FileDevice {
    fn block_count(&self) -> u32 {
        self.block_count
    }

    async fn read(&self, block: u32, offset: u32, len: u32) -> Result<Bytes, StoreError> {
        check_access(block, offset, len, self.block_count)?;
        let mut buf = vec![0u8; len as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(Self::position(block, offset)))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, block: u32, offset: u32, data: &[u8]) -> Result<(), StoreError> {
        check_access(block, offset, data.len() as u32, self.block_count)?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(Self::position(block, offset)))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        debug!(block, offset, size = data.len(), "wrote page to file");
        Ok(())
    }

    async fn erase(&self, block: u32, len: u32) -> Result<(), StoreError> {
        let count = pages_spanned(len);
        check_access(block.saturating_add(count - 1), 0, 0, self.block_count)?;
        let fill = vec![ERASED_BYTE; count as usize * PAGE_SIZE];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(Self::position(block, 0))).await?;
        file.write_all(&fill).await?;
        file.flush().await?;
        debug!(block, pages = count, "erased pages in file");
        Ok(())
    }
}
