//! Outbound side of the protocol.
//!
//! Each helper sends one request and validates the answer. A request
//! addressed to this node is answered by the local handler without touching
//! the transport. Nothing here retries: a timeout or a dead peer is handed
//! back to the caller, which decides whether to fall through to another node.

use std::net::SocketAddr;

use bytes::Bytes;
use chord_net::ChordMessage;
use chord_types::{AggregateStats, KeySummary, NodeId, NodeRef, RING_SIZE};
use tracing::{debug, trace};

use crate::error::ChordError;
use crate::node::{ChordNode, NodeStatus};
use crate::tree::Registration;

/// One step of a successor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// The asked node knows the answer.
    Done(NodeRef),
    /// Ask this node next.
    Next(NodeRef),
}

/// Outcome of a storage request at one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The node owns the key and answered.
    Found(T),
    /// The node does not own the key; retry at this node.
    Redirect(NodeRef),
}

fn unexpected(request: &ChordMessage, got: &ChordMessage) -> ChordError {
    ChordError::Malformed {
        request: request.kind(),
        got: got.kind(),
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ChordNode {
    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Send a request to `to` and return its answer.
    pub(crate) async fn call(
        &self,
        to: SocketAddr,
        msg: ChordMessage,
    ) -> Result<ChordMessage, ChordError> {
        if to == self.local().addr {
            return self.handle_message(msg.clone()).await.ok_or(ChordError::Malformed {
                request: msg.kind(),
                got: "no reply",
            });
        }
        trace!(%to, kind = msg.kind(), "request");
        Ok(self.transport().request(to, &msg).await?)
    }

    /// Send a one-way message to `to`.
    pub(crate) async fn cast(&self, to: SocketAddr, msg: ChordMessage) -> Result<(), ChordError> {
        if to == self.local().addr {
            self.handle_message(msg).await;
            return Ok(());
        }
        trace!(%to, kind = msg.kind(), "one-way");
        Ok(self.transport().send_to(to, &msg).await?)
    }

    // ------------------------------------------------------------------
    // Ring queries
    // ------------------------------------------------------------------

    /// Liveness probe.
    pub async fn ping(&self, node: NodeRef) -> Result<(), ChordError> {
        let timestamp = now_millis();
        let request = ChordMessage::Ping { timestamp };
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::Pong { timestamp: echoed } if echoed == timestamp => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Ask `node` for its predecessor. `None` means it has none yet.
    pub async fn get_predecessor(&self, node: NodeRef) -> Result<Option<NodeRef>, ChordError> {
        let request = ChordMessage::GetPredecessor;
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::GetPredecessorResp { node } => Ok(Some(node)),
            ChordMessage::GetPredecessorRespNull => Ok(None),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Ask `node` for its successor.
    pub async fn get_successor(&self, node: NodeRef) -> Result<NodeRef, ChordError> {
        let request = ChordMessage::GetSuccessor;
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::GetSuccessorResp { node } => Ok(node),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Ask `node` for its successor list.
    pub async fn copy_successor_list(&self, node: NodeRef) -> Result<Vec<NodeRef>, ChordError> {
        let request = ChordMessage::CopySuccessorList;
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::CopySuccessorListResp { successors } => Ok(successors),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Tell `node` that `candidate` believes it is its predecessor.
    pub async fn notify(&self, node: NodeRef, candidate: NodeRef) -> Result<(), ChordError> {
        self.cast(node.addr, ChordMessage::Notify { candidate }).await
    }

    /// One hop of the finger-based lookup.
    pub async fn find_successor_hop(&self, at: SocketAddr, id: NodeId) -> Result<Hop, ChordError> {
        let request = ChordMessage::FindSuccessor { id };
        match self.call(at, request.clone()).await? {
            ChordMessage::FindSuccessorResp { node } => Ok(Hop::Done(node)),
            ChordMessage::FindSuccessorRespNext { next } => Ok(Hop::Next(next)),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Iterative lookup of the owner of `id`, starting at `start`.
    ///
    /// Follows redirects for at most `max_lookup_hops` steps. A redirect
    /// back to the node just asked is taken as the answer.
    pub async fn find_successor(&self, start: SocketAddr, id: NodeId) -> Result<NodeRef, ChordError> {
        let max_hops = self.config().max_lookup_hops;
        let mut current = start;
        for hop in 0..max_hops {
            match self.find_successor_hop(current, id).await? {
                Hop::Done(node) => {
                    trace!(%id, owner = %node, hops = hop + 1, "lookup resolved");
                    return Ok(node);
                }
                Hop::Next(next) if next.addr == current => return Ok(next),
                Hop::Next(next) => current = next.addr,
            }
        }
        debug!(%id, hops = max_hops, "lookup exhausted");
        Err(ChordError::LookupExhausted { id, hops: max_hops })
    }

    /// Lookup that only follows successor pointers, bounded by the ring size.
    pub async fn find_successor_linear(
        &self,
        start: SocketAddr,
        id: NodeId,
    ) -> Result<NodeRef, ChordError> {
        let request = ChordMessage::FindSuccessorLinear { id };
        let mut current = start;
        for _ in 0..RING_SIZE {
            match self.call(current, request.clone()).await? {
                ChordMessage::FindSuccessorResp { node } => return Ok(node),
                ChordMessage::FindSuccessorRespNext { next } if next.addr == current => {
                    return Ok(next);
                }
                ChordMessage::FindSuccessorRespNext { next } => current = next.addr,
                other => return Err(unexpected(&request, &other)),
            }
        }
        Err(ChordError::LookupExhausted {
            id,
            hops: RING_SIZE as usize,
        })
    }

    /// Announce a graceful leave to `node`.
    pub async fn exit(
        &self,
        node: NodeRef,
        predecessor: Option<NodeRef>,
        successors: Vec<NodeRef>,
    ) -> Result<(), ChordError> {
        let request = ChordMessage::Exit {
            node: self.local(),
            predecessor,
            successors,
        };
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::ExitAck => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    /// Read `key_id` at `node`.
    pub async fn get_at(&self, node: NodeRef, key_id: NodeId) -> Result<Lookup<Bytes>, ChordError> {
        let request = ChordMessage::Get { key_id };
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::GetResp { data, .. } => Ok(Lookup::Found(Bytes::from(data))),
            ChordMessage::Redirect { next, .. } => Ok(Lookup::Redirect(next)),
            ChordMessage::GetEfail { key_id } => Err(ChordError::NotFound { key_id }),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Store `data` under `key_id` at `node`.
    pub async fn put_at(
        &self,
        node: NodeRef,
        key_id: NodeId,
        data: &[u8],
    ) -> Result<Lookup<()>, ChordError> {
        let request = ChordMessage::Put {
            key_id,
            data: data.to_vec(),
        };
        match self.call(node.addr, request).await? {
            ChordMessage::PutAck { ok: true, .. } => Ok(Lookup::Found(())),
            ChordMessage::PutAck { ok: false, key_id } => Err(ChordError::StorageFull { key_id }),
            ChordMessage::Redirect { next, .. } => Ok(Lookup::Redirect(next)),
            other => Err(ChordError::Malformed {
                request: "PUT",
                got: other.kind(),
            }),
        }
    }

    /// Ask the owner `node` for the replica set of `id`.
    pub async fn get_successor_list_id(
        &self,
        node: NodeRef,
        id: NodeId,
    ) -> Result<Vec<NodeRef>, ChordError> {
        let request = ChordMessage::GetSuccessorListId { id };
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::GetSuccessorListIdResp { nodes, .. } => Ok(nodes),
            ChordMessage::GetSuccessorListIdEfail { id } => Err(ChordError::OwnershipMismatch { id }),
            other => Err(unexpected(&request, &other)),
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Offer `keys` to `replica`; returns the ids it wants pushed.
    pub async fn sync(
        &self,
        replica: NodeRef,
        keys: Vec<KeySummary>,
    ) -> Result<Vec<NodeId>, ChordError> {
        let request = ChordMessage::Sync {
            from: self.local(),
            keys,
        };
        match self.call(replica.addr, request).await? {
            ChordMessage::SyncReqResp { wanted } => Ok(wanted),
            other => Err(ChordError::Malformed {
                request: "SYNC",
                got: other.kind(),
            }),
        }
    }

    /// Pull a copy of `key_id` from `node`. `None` if it holds none.
    pub async fn fetch(&self, node: NodeRef, key_id: NodeId) -> Result<Option<Bytes>, ChordError> {
        let request = ChordMessage::SyncReqFetch { key_id };
        match self.call(node.addr, request.clone()).await? {
            ChordMessage::SyncReqFetchOk { data, .. } => Ok(Some(Bytes::from(data))),
            ChordMessage::GetEfail { .. } => Ok(None),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Push a copy of `key_id` to `node` (one-way).
    pub async fn push(
        &self,
        node: NodeRef,
        key_id: NodeId,
        owner: NodeId,
        data: &[u8],
    ) -> Result<(), ChordError> {
        let msg = ChordMessage::Push {
            key_id,
            owner,
            data: data.to_vec(),
        };
        self.cast(node.addr, msg).await
    }

    // ------------------------------------------------------------------
    // Aggregation tree
    // ------------------------------------------------------------------

    /// Ask `parent` to adopt this node. `slot` is the ring slot `parent` was
    /// resolved from, `None` after a redirect.
    pub async fn register_child(
        &self,
        parent: NodeRef,
        slot: Option<NodeId>,
    ) -> Result<Registration, ChordError> {
        let request = ChordMessage::RegisterChild {
            child: self.local(),
            slot,
        };
        match self.call(parent.addr, request.clone()).await? {
            ChordMessage::RegisterChildOk => Ok(Registration::Accepted),
            ChordMessage::RegisterChildEfull => Ok(Registration::Full),
            ChordMessage::RegisterChildEwrong => Ok(Registration::WrongSlot),
            ChordMessage::RegisterChildRedirect { parent } => Ok(Registration::Redirect(parent)),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Report subtree stats to `parent`. Returns `false` when the parent no
    /// longer knows this node and it must register again.
    pub async fn refresh_child(
        &self,
        parent: NodeRef,
        stats: AggregateStats,
    ) -> Result<bool, ChordError> {
        let request = ChordMessage::RefreshChild {
            child: self.local(),
            stats,
        };
        match self.call(parent.addr, request.clone()).await? {
            ChordMessage::RefreshChildOk => Ok(true),
            ChordMessage::RefreshChildRedirect => Ok(false),
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Status query against the node at `addr`.
    pub async fn get_stats(&self, addr: SocketAddr) -> Result<NodeStatus, ChordError> {
        let request = ChordMessage::GetStats;
        match self.call(addr, request.clone()).await? {
            ChordMessage::GetStatsResp {
                node,
                predecessor,
                successor,
                stats,
            } => Ok(NodeStatus {
                node,
                predecessor,
                successor,
                stats,
            }),
            other => Err(unexpected(&request, &other)),
        }
    }
}
