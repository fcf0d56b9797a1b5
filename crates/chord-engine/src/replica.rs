//! Replica sync: copies owned keys onto the successor list.
//!
//! Each round offers the owner's key summaries to every successor, which
//! answers with the ids it lacks; the owner then pushes those values one-way.
//! In an offer, a copy with the same id and size counts as already present,
//! so rounds are idempotent. A pushed value always replaces differing bytes. Rounds never overlap: if one is still running when the next
//! is due, the new one is skipped.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chord_types::NodeId;
use tracing::{debug, error, warn};

use crate::node::ChordNode;

/// Clears the in-flight flag when a sync round ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ChordNode {
    /// Run one sync round. Returns the number of values pushed, or `None`
    /// when the round was skipped because another one is in flight.
    pub async fn sync_tick(&self) -> Option<usize> {
        if self.sync_in_flight().swap(true, Ordering::AcqRel) {
            debug!(local = %self.local(), "previous sync round still running, skipping");
            return None;
        }
        let _guard = InFlight(self.sync_in_flight());

        let local = self.local();
        let keys = self.directory().read().await.owned_keys(local.id);
        if keys.is_empty() {
            return Some(0);
        }
        let replicas = self.ring().read().await.successor_list();

        let mut pushed = 0;
        for replica in replicas {
            let wanted = match self.sync(replica, keys.clone()).await {
                Ok(wanted) => wanted,
                Err(e) => {
                    debug!(%replica, "sync offer failed: {e}");
                    continue;
                }
            };

            for key_id in wanted {
                let value = self.directory().read().await.get(key_id).await;
                let data = match value {
                    Ok(Some(data)) => data,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(%key_id, "reading key for sync failed: {e}");
                        continue;
                    }
                };
                match self.push(replica, key_id, local.id, &data).await {
                    Ok(()) => pushed += 1,
                    Err(e) => {
                        debug!(%replica, %key_id, "push failed: {e}");
                        break;
                    }
                }
            }
        }

        if pushed > 0 {
            debug!(%local, pushed, "sync round pushed replicas");
        }
        Some(pushed)
    }

    /// Best-effort push of a freshly stored value to the successor list,
    /// in the background.
    pub(crate) fn spawn_replication(&self, key_id: NodeId, data: Bytes) {
        let Some(node) = self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let local = node.local();
            let replicas = node.ring().read().await.successor_list();
            for replica in replicas {
                if let Err(e) = node.push(replica, key_id, local.id, &data).await {
                    debug!(%replica, %key_id, "immediate replication failed: {e}");
                }
            }
        });
    }

    /// Store a pushed copy and take the pusher's owner tag.
    ///
    /// An existing copy is rewritten only when its bytes differ, so an
    /// overwrite of the same length still reaches every replica.
    pub(crate) async fn store_replica(&self, key_id: NodeId, owner: NodeId, data: &[u8]) {
        let mut directory = self.directory().write().await;
        if directory.contains(key_id, data.len() as u32) {
            match directory.get(key_id).await {
                Ok(Some(current)) if current.as_ref() == data => {
                    directory.set_owner(key_id, owner);
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(%key_id, "reading current replica failed, rewriting: {e}"),
            }
        }
        if let Err(e) = directory.put(key_id, owner, data).await {
            warn!(%key_id, %owner, "storing replica failed: {e}");
        }
    }

    /// Pull a missing owned key from the successor list and keep it.
    pub(crate) async fn read_repair(&self, key_id: NodeId) -> Option<Bytes> {
        let local = self.local();
        let holders = self.ring().read().await.successor_list();
        for holder in holders {
            match self.fetch(holder, key_id).await {
                Ok(Some(data)) => {
                    debug!(%key_id, from = %holder, "read repair");
                    if let Err(e) = self
                        .directory()
                        .write()
                        .await
                        .put(key_id, local.id, &data)
                        .await
                    {
                        warn!(%key_id, "keeping repaired key failed: {e}");
                    }
                    return Some(data);
                }
                Ok(None) => {}
                Err(e) => debug!(%key_id, from = %holder, "fetch failed: {e}"),
            }
        }
        None
    }
}
