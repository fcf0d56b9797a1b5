//! Key directory: the node-local index from key ids to pages on the block
//! device.
//!
//! Values are split into [`PAGE_SIZE`] pieces and written to a contiguous
//! run of pages found first-fit. The directory remembers, per key, its size,
//! its ring owner at store time and the page run holding it. Nothing is
//! persisted: the index lives in memory and the device is erased page by
//! page as keys are replaced or removed.

use std::sync::Arc;

use bytes::Bytes;
use chord_store::{BlockDevice, StoreError};
use chord_types::{KeySummary, NodeId, PAGE_SIZE};
use tracing::{debug, warn};

/// One stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// Ring id of the key.
    pub id: NodeId,
    /// Value length in bytes.
    pub size: u32,
    /// Ring owner of the key, as last derived from the predecessor.
    pub owner: NodeId,
    /// First page of the value.
    pub first_block: u32,
    /// Number of pages the value occupies.
    pub block_count: u32,
}

impl KeyEntry {
    /// Summary offered to replicas during sync.
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            id: self.id,
            size: self.size,
        }
    }
}

/// Bytes allocated to keys and bytes still free, page granular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Bytes in pages holding values.
    pub used: u64,
    /// Bytes in free pages.
    pub available: u64,
}

/// Node-local key index over a [`BlockDevice`].
pub struct KeyDirectory {
    device: Arc<dyn BlockDevice>,
    /// Insertion ordered.
    entries: Vec<KeyEntry>,
    /// Free page runs as `(start, len)`, sorted by start and coalesced.
    free: Vec<(u32, u32)>,
}

impl KeyDirectory {
    /// Create an empty directory owning every page of `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let block_count = device.block_count();
        let free = if block_count > 0 {
            vec![(0, block_count)]
        } else {
            Vec::new()
        };
        Self {
            device,
            entries: Vec::new(),
            free,
        }
    }

    /// Store `data` under `id`, replacing any previous value.
    ///
    /// Fails with [`StoreError::CapacityExceeded`] when no run of free pages
    /// is long enough.
    pub async fn put(&mut self, id: NodeId, owner: NodeId, data: &[u8]) -> Result<(), StoreError> {
        let size = u32::try_from(data.len()).map_err(|_| StoreError::CapacityExceeded {
            needed: data.len() as u64,
            available: self.usage().available,
        })?;
        let pages = pages_for(data.len());

        let first_block = match self.allocate(pages) {
            Some(start) => start,
            None if self.position(id).is_some() => {
                // Make room by dropping the value being replaced.
                self.erase(id).await?;
                self.allocate(pages).ok_or_else(|| self.capacity_error(pages))?
            }
            None => return Err(self.capacity_error(pages)),
        };

        if let Err(e) = self.write_pages(first_block, pages, data).await {
            self.release(first_block, pages);
            return Err(e);
        }

        let replaced = self.position(id).map(|pos| self.entries.remove(pos));
        self.entries.push(KeyEntry {
            id,
            size,
            owner,
            first_block,
            block_count: pages,
        });
        debug!(%id, %owner, size, first_block, pages, "stored key");

        if let Some(old) = replaced {
            if let Err(e) = self
                .device
                .erase(old.first_block, old.block_count * PAGE_SIZE as u32)
                .await
            {
                warn!(%id, first_block = old.first_block, "erasing replaced value failed: {e}");
            }
            // Pages are erased again before reuse.
            self.release(old.first_block, old.block_count);
        }
        Ok(())
    }

    /// Read the value stored under `id`.
    pub async fn get(&self, id: NodeId) -> Result<Option<Bytes>, StoreError> {
        let Some(entry) = self.entry(id) else {
            return Ok(None);
        };

        let mut value = Vec::with_capacity(entry.size as usize);
        let mut remaining = entry.size as usize;
        for page in 0..entry.block_count {
            let len = remaining.min(PAGE_SIZE);
            if len == 0 {
                break;
            }
            let piece = self
                .device
                .read(entry.first_block + page, 0, len as u32)
                .await?;
            value.extend_from_slice(&piece);
            remaining -= len;
        }
        Ok(Some(Bytes::from(value)))
    }

    /// Erase the value stored under `id` and forget the key.
    ///
    /// Returns whether the key was present. The key stays indexed when the
    /// device erase fails.
    pub async fn erase(&mut self, id: NodeId) -> Result<bool, StoreError> {
        let Some(pos) = self.position(id) else {
            return Ok(false);
        };
        let entry = self.entries[pos];
        self.device
            .erase(entry.first_block, entry.block_count * PAGE_SIZE as u32)
            .await?;
        self.entries.remove(pos);
        self.release(entry.first_block, entry.block_count);
        debug!(%id, "erased key");
        Ok(true)
    }

    /// Descriptor of `id`, if stored.
    pub fn entry(&self, id: NodeId) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// All stored keys in insertion order.
    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a copy of `id` with exactly `size` bytes is stored.
    pub fn contains(&self, id: NodeId, size: u32) -> bool {
        self.entry(id).is_some_and(|e| e.size == size)
    }

    /// Retag `id` as owned by `owner`. Returns whether the key is stored.
    pub fn set_owner(&mut self, id: NodeId, owner: NodeId) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.owner = owner;
                true
            }
            None => false,
        }
    }

    /// Summaries of the keys tagged as owned by `owner`.
    pub fn owned_keys(&self, owner: NodeId) -> Vec<KeySummary> {
        self.entries
            .iter()
            .filter(|e| e.owner == owner)
            .map(KeyEntry::summary)
            .collect()
    }

    /// Summaries of every stored key.
    pub fn summaries(&self) -> Vec<KeySummary> {
        self.entries.iter().map(KeyEntry::summary).collect()
    }

    /// Retag key ownership after the predecessor changed.
    ///
    /// Keys in `(predecessor, local]` become owned by `local`; the rest are
    /// now owned (at least) by `predecessor` and kept as replicas. Returns
    /// the number of entries whose owner changed.
    pub fn reassign_owners(&mut self, predecessor: NodeId, local: NodeId) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            let owner = if entry.id.in_half_open(predecessor, local) {
                local
            } else {
                predecessor
            };
            if entry.owner != owner {
                entry.owner = owner;
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(%predecessor, %local, changed, "reassigned key owners");
        }
        changed
    }

    /// Page-granular space accounting.
    pub fn usage(&self) -> Usage {
        let free_pages: u64 = self.free.iter().map(|&(_, len)| u64::from(len)).sum();
        let total_pages = u64::from(self.device.block_count());
        Usage {
            used: (total_pages - free_pages) * PAGE_SIZE as u64,
            available: free_pages * PAGE_SIZE as u64,
        }
    }

    // ------------------------------------------------------------------
    // Page allocation
    // ------------------------------------------------------------------

    fn position(&self, id: NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// First-fit allocation of `pages` contiguous pages.
    fn allocate(&mut self, pages: u32) -> Option<u32> {
        let slot = self.free.iter().position(|&(_, len)| len >= pages)?;
        let (start, len) = self.free[slot];
        if len == pages {
            self.free.remove(slot);
        } else {
            self.free[slot] = (start + pages, len - pages);
        }
        Some(start)
    }

    /// Return a page run to the free list, merging with its neighbours.
    fn release(&mut self, start: u32, pages: u32) {
        let at = self.free.partition_point(|&(s, _)| s < start);
        self.free.insert(at, (start, pages));

        if at + 1 < self.free.len() {
            let (s, l) = self.free[at];
            let (next_s, next_l) = self.free[at + 1];
            if s + l == next_s {
                self.free[at] = (s, l + next_l);
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_s, prev_l) = self.free[at - 1];
            let (s, l) = self.free[at];
            if prev_s + prev_l == s {
                self.free[at - 1] = (prev_s, prev_l + l);
                self.free.remove(at);
            }
        }
    }

    async fn write_pages(&self, first_block: u32, pages: u32, data: &[u8]) -> Result<(), StoreError> {
        self.device
            .erase(first_block, pages * PAGE_SIZE as u32)
            .await?;
        for (i, piece) in data.chunks(PAGE_SIZE).enumerate() {
            if let Err(e) = self.device.write(first_block + i as u32, 0, piece).await {
                warn!(first_block, page = i, "page write failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    fn capacity_error(&self, pages: u32) -> StoreError {
        StoreError::CapacityExceeded {
            needed: u64::from(pages) * PAGE_SIZE as u64,
            available: self.usage().available,
        }
    }
}

/// Pages needed for a value of `len` bytes (at least one).
fn pages_for(len: usize) -> u32 {
    len.div_ceil(PAGE_SIZE).max(1) as u32
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chord_store::MemoryDevice;

    use super::*;

    fn directory(blocks: u32) -> KeyDirectory {
        KeyDirectory::new(Arc::new(MemoryDevice::new(blocks)))
    }

    /// Memory device whose erase fails when it starts at one chosen page.
    struct FailingEraseDevice {
        inner: MemoryDevice,
        fail_at: AtomicU32,
    }

    impl FailingEraseDevice {
        fn new(blocks: u32) -> Self {
            Self {
                inner: MemoryDevice::new(blocks),
                fail_at: AtomicU32::new(u32::MAX),
            }
        }
    }

    #[async_trait::async_trait]
    impl BlockDevice for FailingEraseDevice {
        fn block_count(&self) -> u32 {
            self.inner.block_count()
        }

        async fn read(&self, block: u32, offset: u32, len: u32) -> Result<Bytes, StoreError> {
            self.inner.read(block, offset, len).await
        }

        async fn write(&self, block: u32, offset: u32, data: &[u8]) -> Result<(), StoreError> {
            self.inner.write(block, offset, data).await
        }

        async fn erase(&self, block: u32, len: u32) -> Result<(), StoreError> {
            if block == self.fail_at.load(Ordering::Acquire) {
                return Err(StoreError::Io(std::io::Error::other("erase failed")));
            }
            self.inner.erase(block, len).await
        }
    }

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_put_get_single_page() {
        let mut dir = directory(8);
        dir.put(id(130), id(192), b"bar").await.unwrap();

        let value = dir.get(id(130)).await.unwrap().unwrap();
        assert_eq!(&value[..], b"bar");
        let entry = dir.entry(id(130)).unwrap();
        assert_eq!(entry.size, 3);
        assert_eq!(entry.block_count, 1);
        assert_eq!(entry.owner, id(192));
    }

    #[tokio::test]
    async fn test_value_spanning_pages_roundtrips_exactly() {
        let mut dir = directory(16);
        let data = pattern(PAGE_SIZE * 3 + 17);
        dir.put(id(5), id(5), &data).await.unwrap();

        assert_eq!(dir.entry(id(5)).unwrap().block_count, 4);
        let value = dir.get(id(5)).await.unwrap().unwrap();
        assert_eq!(value.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_exact_page_multiple() {
        let mut dir = directory(4);
        let data = pattern(PAGE_SIZE * 2);
        dir.put(id(9), id(9), &data).await.unwrap();
        assert_eq!(dir.entry(id(9)).unwrap().block_count, 2);
        assert_eq!(dir.get(id(9)).await.unwrap().unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_empty_value_takes_one_page() {
        let mut dir = directory(2);
        dir.put(id(1), id(1), b"").await.unwrap();
        assert_eq!(dir.entry(id(1)).unwrap().block_count, 1);
        assert_eq!(dir.get(id(1)).await.unwrap().unwrap().len(), 0);
        assert_eq!(dir.usage().used, PAGE_SIZE as u64);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let dir = directory(2);
        assert!(dir.get(id(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_device_rejects_put() {
        let mut dir = directory(2);
        dir.put(id(1), id(1), &pattern(PAGE_SIZE * 2)).await.unwrap();

        let err = dir.put(id(2), id(2), b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { .. }), "got {err:?}");
        assert_eq!(dir.len(), 1, "failed put must not add an entry");
    }

    #[tokio::test]
    async fn test_replace_frees_old_pages() {
        let mut dir = directory(4);
        dir.put(id(1), id(1), &pattern(PAGE_SIZE * 3)).await.unwrap();
        dir.put(id(1), id(1), b"short").await.unwrap();

        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get(id(1)).await.unwrap().unwrap().as_ref(), b"short");
        assert_eq!(dir.usage().used, PAGE_SIZE as u64);
    }

    #[tokio::test]
    async fn test_replace_on_full_device_reuses_own_pages() {
        let mut dir = directory(2);
        dir.put(id(1), id(1), &pattern(PAGE_SIZE * 2)).await.unwrap();
        dir.put(id(1), id(1), &pattern(PAGE_SIZE + 1)).await.unwrap();
        assert_eq!(
            dir.get(id(1)).await.unwrap().unwrap().as_ref(),
            pattern(PAGE_SIZE + 1).as_slice()
        );
    }

    #[tokio::test]
    async fn test_replace_survives_failed_erase_of_old_pages() {
        let device = Arc::new(FailingEraseDevice::new(8));
        let mut dir = KeyDirectory::new(device.clone());
        dir.put(id(1), id(1), &pattern(PAGE_SIZE * 3)).await.unwrap();

        device.fail_at.store(0, Ordering::Release);
        dir.put(id(1), id(1), b"short").await.unwrap();

        assert_eq!(dir.len(), 1);
        let entry = *dir.entry(id(1)).unwrap();
        assert_eq!(entry.first_block, 3);
        assert_eq!(dir.get(id(1)).await.unwrap().unwrap().as_ref(), b"short");
        // The old run went back to the free list.
        assert_eq!(dir.usage().used, PAGE_SIZE as u64);

        device.fail_at.store(u32::MAX, Ordering::Release);
        dir.put(id(2), id(2), &pattern(PAGE_SIZE * 3)).await.unwrap();
        assert_eq!(dir.entry(id(2)).unwrap().first_block, 0);
    }

    #[tokio::test]
    async fn test_failed_erase_keeps_key_indexed() {
        let device = Arc::new(FailingEraseDevice::new(4));
        let mut dir = KeyDirectory::new(device.clone());
        dir.put(id(1), id(1), b"one").await.unwrap();
        dir.put(id(2), id(2), b"two").await.unwrap();

        device.fail_at.store(1, Ordering::Release);
        assert!(dir.erase(id(2)).await.is_err());

        assert_eq!(dir.get(id(2)).await.unwrap().unwrap().as_ref(), b"two");
        assert_eq!(dir.usage().used, 2 * PAGE_SIZE as u64);
    }

    #[tokio::test]
    async fn test_set_owner_retags_stored_key() {
        let mut dir = directory(2);
        dir.put(id(4), id(64), b"four").await.unwrap();
        assert!(dir.set_owner(id(4), id(128)));
        assert_eq!(dir.entry(id(4)).unwrap().owner, id(128));
        assert!(!dir.set_owner(id(5), id(128)));
    }

    #[tokio::test]
    async fn test_erase_coalesces_free_space() {
        let mut dir = directory(3);
        for n in 0..3 {
            dir.put(id(n), id(n), b"page").await.unwrap();
        }
        assert_eq!(dir.usage().available, 0);

        // Free the outer pages first, then the middle one joins them.
        assert!(dir.erase(id(0)).await.unwrap());
        assert!(dir.erase(id(2)).await.unwrap());
        assert!(dir.erase(id(1)).await.unwrap());
        assert!(!dir.erase(id(1)).await.unwrap());

        dir.put(id(7), id(7), &pattern(PAGE_SIZE * 3)).await.unwrap();
        assert_eq!(dir.entry(id(7)).unwrap().first_block, 0);
    }

    #[tokio::test]
    async fn test_contains_checks_size() {
        let mut dir = directory(2);
        dir.put(id(4), id(4), b"four").await.unwrap();
        assert!(dir.contains(id(4), 4));
        assert!(!dir.contains(id(4), 5));
        assert!(!dir.contains(id(5), 4));
    }

    #[tokio::test]
    async fn test_reassign_owners_on_new_predecessor() {
        let mut dir = directory(8);
        // Node 128 holds keys it owned while its predecessor was 0.
        for n in [10, 70, 100, 128] {
            dir.put(id(n), id(128), b"v").await.unwrap();
        }

        // Node 64 joins between 0 and 128.
        let changed = dir.reassign_owners(id(64), id(128));
        assert_eq!(changed, 1);
        assert_eq!(dir.entry(id(10)).unwrap().owner, id(64));
        assert_eq!(dir.owned_keys(id(128)).len(), 3);
        assert_eq!(dir.summaries().len(), 4);
    }

    #[tokio::test]
    async fn test_usage_accounts_pages() {
        let mut dir = directory(10);
        assert_eq!(dir.usage().available, 10 * PAGE_SIZE as u64);
        dir.put(id(1), id(1), &pattern(PAGE_SIZE + 1)).await.unwrap();
        let usage = dir.usage();
        assert_eq!(usage.used, 2 * PAGE_SIZE as u64);
        assert_eq!(usage.available, 8 * PAGE_SIZE as u64);
    }
}
