//! Inbound side of the protocol: answers every request a peer can send.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use chord_net::ChordMessage;
use chord_ring::RingTable;
use chord_store::StoreError;
use chord_types::{AggregateStats, KeySummary, NodeId, NodeRef};
use tracing::{debug, error, info, warn};

use crate::node::ChordNode;
use crate::router::Hop;
use crate::tree::Registration;

/// Boxed reply future returned by [`ChordNode::handle_message`].
pub type Reply<'a> = Pin<Box<dyn Future<Output = Option<ChordMessage>> + Send + 'a>>;

/// Where a request for `id` should go from this node's point of view.
///
/// `Done(local)` means this node owns `id`. Otherwise the answer is the
/// successor when it owns `id`, or the closest preceding finger (falling
/// back to the successor when no finger precedes `id`).
pub(crate) fn route(ring: &RingTable, id: NodeId) -> Hop {
    if ring.owns(id) {
        return Hop::Done(ring.local());
    }
    if ring.successor_owns(id) {
        return Hop::Done(ring.successor());
    }
    let next = ring.closest_preceding_finger(id);
    if next == ring.local() {
        Hop::Next(ring.successor())
    } else {
        Hop::Next(next)
    }
}

/// Like [`route`] but only ever moves one successor forward.
fn route_linear(ring: &RingTable, id: NodeId) -> Hop {
    if ring.owns(id) {
        Hop::Done(ring.local())
    } else if ring.successor_owns(id) {
        Hop::Done(ring.successor())
    } else {
        Hop::Next(ring.successor())
    }
}

impl ChordNode {
    /// Answer one inbound message.
    ///
    /// Returns `None` for one-way messages and for messages that are not
    /// valid requests (those are dropped with a warning).
    pub fn handle_message(&self, msg: ChordMessage) -> Reply<'_> {
        Box::pin(self.dispatch(msg))
    }

    async fn dispatch(&self, msg: ChordMessage) -> Option<ChordMessage> {
        debug!(local = %self.local(), kind = msg.kind(), "handling message");
        match msg {
            ChordMessage::Ping { timestamp } => Some(ChordMessage::Pong { timestamp }),

            ChordMessage::GetPredecessor => {
                let pred = self.ring().read().await.predecessor();
                Some(match pred {
                    Some(node) => ChordMessage::GetPredecessorResp { node },
                    None => ChordMessage::GetPredecessorRespNull,
                })
            }

            ChordMessage::GetSuccessor => {
                let node = self.ring().read().await.successor();
                Some(ChordMessage::GetSuccessorResp { node })
            }

            ChordMessage::CopySuccessorList => {
                let successors = self.ring().read().await.successor_list();
                Some(ChordMessage::CopySuccessorListResp { successors })
            }

            ChordMessage::FindSuccessor { id } => {
                let hop = route(&*self.ring().read().await, id);
                Some(hop_reply(hop))
            }

            ChordMessage::FindSuccessorLinear { id } => {
                let hop = route_linear(&*self.ring().read().await, id);
                Some(hop_reply(hop))
            }

            ChordMessage::Notify { candidate } => {
                self.handle_notify(candidate).await;
                None
            }

            ChordMessage::Exit {
                node,
                predecessor,
                successors,
            } => {
                self.handle_exit(node, predecessor, successors).await;
                Some(ChordMessage::ExitAck)
            }

            ChordMessage::Get { key_id } => Some(self.handle_get(key_id).await),

            ChordMessage::Put { key_id, data } => Some(self.handle_put(key_id, data).await),

            ChordMessage::GetSuccessorListId { id } => {
                let ring = self.ring().read().await;
                Some(if ring.owns(id) {
                    let mut nodes = vec![ring.local()];
                    nodes.extend(ring.successor_list());
                    ChordMessage::GetSuccessorListIdResp { id, nodes }
                } else {
                    ChordMessage::GetSuccessorListIdEfail { id }
                })
            }

            ChordMessage::Sync { from, keys } => Some(self.handle_sync(from, keys).await),

            ChordMessage::SyncReqFetch { key_id } => {
                let value = self.directory().read().await.get(key_id).await;
                Some(match value {
                    Ok(Some(data)) => ChordMessage::SyncReqFetchOk {
                        key_id,
                        data: data.to_vec(),
                    },
                    Ok(None) => ChordMessage::GetEfail { key_id },
                    Err(e) => {
                        error!(%key_id, "reading key for fetch failed: {e}");
                        ChordMessage::GetEfail { key_id }
                    }
                })
            }

            ChordMessage::Push {
                key_id,
                owner,
                data,
            } => {
                self.store_replica(key_id, owner, &data).await;
                None
            }

            ChordMessage::RegisterChild { child, slot } => {
                Some(self.handle_register_child(child, slot).await)
            }

            ChordMessage::RefreshChild { child, stats } => {
                let known = self
                    .tree()
                    .write()
                    .await
                    .refresh(child.id, stats, Instant::now());
                Some(if known {
                    ChordMessage::RefreshChildOk
                } else {
                    debug!(%child, "refresh from unknown child");
                    ChordMessage::RefreshChildRedirect
                })
            }

            ChordMessage::GetStats => {
                let status = self.status().await;
                Some(ChordMessage::GetStatsResp {
                    node: status.node,
                    predecessor: status.predecessor,
                    successor: status.successor,
                    stats: status.stats,
                })
            }

            other @ (ChordMessage::GetPredecessorResp { .. }
            | ChordMessage::GetPredecessorRespNull
            | ChordMessage::GetSuccessorResp { .. }
            | ChordMessage::FindSuccessorResp { .. }
            | ChordMessage::FindSuccessorRespNext { .. }
            | ChordMessage::Pong { .. }
            | ChordMessage::CopySuccessorListResp { .. }
            | ChordMessage::ExitAck
            | ChordMessage::GetResp { .. }
            | ChordMessage::GetEfail { .. }
            | ChordMessage::PutAck { .. }
            | ChordMessage::Redirect { .. }
            | ChordMessage::GetSuccessorListIdResp { .. }
            | ChordMessage::GetSuccessorListIdEfail { .. }
            | ChordMessage::SyncReqResp { .. }
            | ChordMessage::SyncReqFetchOk { .. }
            | ChordMessage::RegisterChildOk
            | ChordMessage::RegisterChildEfull
            | ChordMessage::RegisterChildEwrong
            | ChordMessage::RegisterChildRedirect { .. }
            | ChordMessage::RefreshChildOk
            | ChordMessage::RefreshChildRedirect
            | ChordMessage::GetStatsResp { .. }) => {
                warn!(kind = other.kind(), "dropping response received as a request");
                None
            }
        }
    }

    /// Accept `candidate` as predecessor if it is closer than the current one.
    ///
    /// A node alone on its ring also takes the candidate as its successor,
    /// which is how a ring of one grows back.
    async fn handle_notify(&self, candidate: NodeRef) {
        let local = self.local();
        if candidate.id == local.id {
            return;
        }

        let accepted = {
            let mut ring = self.ring().write().await;
            let accept = match ring.predecessor() {
                None => true,
                Some(pred) => candidate.id.in_open(pred.id, local.id),
            };
            if accept {
                ring.update_predecessor(Some(candidate));
            }
            if ring.is_singleton() {
                ring.update_successor(candidate);
            }
            accept
        };

        if accepted {
            self.directory()
                .write()
                .await
                .reassign_owners(candidate.id, local.id);
        }
    }

    /// Splice a gracefully leaving neighbour out of the ring.
    async fn handle_exit(
        &self,
        node: NodeRef,
        predecessor: Option<NodeRef>,
        successors: Vec<NodeRef>,
    ) {
        let local = self.local();
        let new_pred = {
            let mut ring = self.ring().write().await;
            let mut new_pred = None;

            if ring.predecessor() == Some(node) {
                let replacement = predecessor.filter(|p| p.id != local.id && p.id != node.id);
                ring.update_predecessor(replacement);
                new_pred = replacement;
            }

            if ring.successor() == node {
                let next = successors
                    .iter()
                    .copied()
                    .find(|s| s.id != node.id && s.id != local.id)
                    .unwrap_or(local);
                ring.update_successor(next);
                ring.set_successor_list(successors.iter().copied().filter(|s| s.id != node.id));
            }

            ring.remove_node(node.id);
            new_pred
        };

        info!(%local, leaving = %node, "neighbour left the ring");
        if let Some(pred) = new_pred {
            self.directory()
                .write()
                .await
                .reassign_owners(pred.id, local.id);
        }
    }

    async fn handle_get(&self, key_id: NodeId) -> ChordMessage {
        let hop = route(&*self.ring().read().await, key_id);
        match hop {
            Hop::Done(node) if node == self.local() => {}
            Hop::Done(next) | Hop::Next(next) => {
                return ChordMessage::Redirect { key_id, next };
            }
        }

        let stored = self.directory().read().await.get(key_id).await;
        match stored {
            Ok(Some(data)) => ChordMessage::GetResp {
                key_id,
                data: data.to_vec(),
            },
            Ok(None) => match self.read_repair(key_id).await {
                Some(data) => ChordMessage::GetResp {
                    key_id,
                    data: data.to_vec(),
                },
                None => ChordMessage::GetEfail { key_id },
            },
            Err(e) => {
                error!(%key_id, "reading key failed: {e}");
                ChordMessage::GetEfail { key_id }
            }
        }
    }

    async fn handle_put(&self, key_id: NodeId, data: Vec<u8>) -> ChordMessage {
        let hop = route(&*self.ring().read().await, key_id);
        match hop {
            Hop::Done(node) if node == self.local() => {}
            Hop::Done(next) | Hop::Next(next) => {
                return ChordMessage::Redirect { key_id, next };
            }
        }

        let local = self.local();
        let stored = self
            .directory()
            .write()
            .await
            .put(key_id, local.id, &data)
            .await;
        match stored {
            Ok(()) => {
                self.spawn_replication(key_id, data.into());
                ChordMessage::PutAck { key_id, ok: true }
            }
            Err(StoreError::CapacityExceeded { needed, available }) => {
                warn!(%key_id, needed, available, "rejecting put: storage full");
                ChordMessage::PutAck { key_id, ok: false }
            }
            Err(e) => {
                error!(%key_id, "storing key failed: {e}");
                ChordMessage::PutAck { key_id, ok: false }
            }
        }
    }

    async fn handle_sync(&self, from: NodeRef, keys: Vec<KeySummary>) -> ChordMessage {
        let directory = self.directory().read().await;
        let wanted: Vec<NodeId> = keys
            .iter()
            .filter(|k| !directory.contains(k.id, k.size))
            .map(|k| k.id)
            .collect();
        debug!(%from, offered = keys.len(), wanted = wanted.len(), "sync offer");
        ChordMessage::SyncReqResp { wanted }
    }

    async fn handle_register_child(&self, child: NodeRef, slot: Option<NodeId>) -> ChordMessage {
        let slot_owned = match slot {
            Some(slot) => Some(self.ring().read().await.owns(slot)),
            None => None,
        };
        let registration = self
            .tree()
            .write()
            .await
            .register(child, slot_owned, Instant::now());
        match registration {
            Registration::Accepted => ChordMessage::RegisterChildOk,
            Registration::Full => ChordMessage::RegisterChildEfull,
            Registration::WrongSlot => ChordMessage::RegisterChildEwrong,
            Registration::Redirect(parent) => ChordMessage::RegisterChildRedirect { parent },
        }
    }

    /// Current subtree stats: own usage plus the last report of each child.
    pub async fn stats(&self) -> AggregateStats {
        let usage = self.directory().read().await.usage();
        let own = AggregateStats::single(usage.used, usage.available);
        self.tree().read().await.aggregate(own)
    }
}

fn hop_reply(hop: Hop) -> ChordMessage {
    match hop {
        Hop::Done(node) => ChordMessage::FindSuccessorResp { node },
        Hop::Next(next) => ChordMessage::FindSuccessorRespNext { next },
    }
}
