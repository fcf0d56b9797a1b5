//! Protocol messages for the chordstore network layer.
//!
//! All messages are serialized with postcard and sent as length-prefixed
//! frames. Requests and responses share one enum; which variants answer
//! which request is documented on each request variant.

use chord_types::{AggregateStats, KeySummary, NodeId, NodeRef};
use serde::{Deserialize, Serialize};

/// Protocol messages exchanged between chordstore nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChordMessage {
    // -------------------------------------------------------------------
    // Ring maintenance and routing
    // -------------------------------------------------------------------
    /// Ask for the node's predecessor.
    ///
    /// Answered by [`GetPredecessorResp`](Self::GetPredecessorResp) or
    /// [`GetPredecessorRespNull`](Self::GetPredecessorRespNull).
    GetPredecessor,

    /// The node's current predecessor.
    GetPredecessorResp {
        /// The predecessor.
        node: NodeRef,
    },

    /// The node has no predecessor yet.
    GetPredecessorRespNull,

    /// Ask for the node's successor. Answered by
    /// [`GetSuccessorResp`](Self::GetSuccessorResp).
    GetSuccessor,

    /// The node's current successor.
    GetSuccessorResp {
        /// The successor.
        node: NodeRef,
    },

    /// One hop of an iterative successor lookup.
    ///
    /// Answered by [`FindSuccessorResp`](Self::FindSuccessorResp) when the
    /// callee knows the owner of `id`, otherwise by
    /// [`FindSuccessorRespNext`](Self::FindSuccessorRespNext).
    FindSuccessor {
        /// The id being resolved.
        id: NodeId,
    },

    /// One hop of the linear fallback lookup, which only follows successor
    /// pointers. Answered like [`FindSuccessor`](Self::FindSuccessor).
    FindSuccessorLinear {
        /// The id being resolved.
        id: NodeId,
    },

    /// Terminal lookup answer: `node` is the successor of the queried id.
    FindSuccessorResp {
        /// Owner of the queried id.
        node: NodeRef,
    },

    /// Lookup redirect: continue the lookup at `next`.
    FindSuccessorRespNext {
        /// Node to query next.
        next: NodeRef,
    },

    /// Liveness probe. Answered by [`Pong`](Self::Pong).
    Ping {
        /// Timestamp (millis since epoch) when the ping was sent.
        timestamp: u64,
    },

    /// Liveness answer (response to [`ChordMessage::Ping`]).
    Pong {
        /// Timestamp from the original ping.
        timestamp: u64,
    },

    /// "I believe I am your predecessor." One-way, no response.
    Notify {
        /// The node proposing itself as predecessor.
        candidate: NodeRef,
    },

    /// Ask for the node's successor list. Answered by
    /// [`CopySuccessorListResp`](Self::CopySuccessorListResp).
    CopySuccessorList,

    /// The node's successor list, nearest first.
    CopySuccessorListResp {
        /// Known successors in ring order.
        successors: Vec<NodeRef>,
    },

    /// Graceful leave announcement. Answered by [`ExitAck`](Self::ExitAck).
    Exit {
        /// The departing node.
        node: NodeRef,
        /// The departing node's predecessor.
        predecessor: Option<NodeRef>,
        /// The departing node's successor list.
        successors: Vec<NodeRef>,
    },

    /// Acknowledgement of an [`Exit`](Self::Exit).
    ExitAck,

    // -------------------------------------------------------------------
    // Key storage
    // -------------------------------------------------------------------
    /// Read a key. Answered by [`GetResp`](Self::GetResp),
    /// [`GetEfail`](Self::GetEfail) or [`Redirect`](Self::Redirect).
    Get {
        /// Ring id of the key.
        key_id: NodeId,
    },

    /// The stored value of a key.
    GetResp {
        /// Ring id of the key.
        key_id: NodeId,
        /// Raw value bytes.
        data: Vec<u8>,
    },

    /// The owner does not hold the key.
    GetEfail {
        /// Ring id of the key.
        key_id: NodeId,
    },

    /// Store a key. Answered by [`PutAck`](Self::PutAck) or
    /// [`Redirect`](Self::Redirect).
    Put {
        /// Ring id of the key.
        key_id: NodeId,
        /// Raw value bytes.
        data: Vec<u8>,
    },

    /// Result of a [`Put`](Self::Put) at the owner.
    PutAck {
        /// Ring id of the key.
        key_id: NodeId,
        /// Whether the value was stored (`false` when the owner is full).
        ok: bool,
    },

    /// The callee does not own the key; retry at `next`.
    Redirect {
        /// Ring id of the key.
        key_id: NodeId,
        /// Closer node to continue at.
        next: NodeRef,
    },

    /// Ask the owner of `id` for the nodes holding its replicas. Answered by
    /// [`GetSuccessorListIdResp`](Self::GetSuccessorListIdResp) or
    /// [`GetSuccessorListIdEfail`](Self::GetSuccessorListIdEfail).
    GetSuccessorListId {
        /// The id whose replica set is requested.
        id: NodeId,
    },

    /// Replica set of `id`: the owner followed by its successor list.
    GetSuccessorListIdResp {
        /// The id that was asked for.
        id: NodeId,
        /// Owner first, then replicas.
        nodes: Vec<NodeRef>,
    },

    /// The callee does not own `id`.
    GetSuccessorListIdEfail {
        /// The id that was asked for.
        id: NodeId,
    },

    // -------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------
    /// Owner offers the keys it holds to a replica. Answered by
    /// [`SyncReqResp`](Self::SyncReqResp).
    Sync {
        /// The offering owner.
        from: NodeRef,
        /// Keys the owner holds.
        keys: Vec<KeySummary>,
    },

    /// The subset of offered keys the replica does not hold yet.
    SyncReqResp {
        /// Ids the replica wants pushed.
        wanted: Vec<NodeId>,
    },

    /// Pull a key's value from a node holding a copy. Answered by
    /// [`SyncReqFetchOk`](Self::SyncReqFetchOk) or
    /// [`GetEfail`](Self::GetEfail).
    SyncReqFetch {
        /// Ring id of the key.
        key_id: NodeId,
    },

    /// A fetched copy.
    SyncReqFetchOk {
        /// Ring id of the key.
        key_id: NodeId,
        /// Raw value bytes.
        data: Vec<u8>,
    },

    /// One-way push of a replica copy.
    Push {
        /// Ring id of the key.
        key_id: NodeId,
        /// Ring owner of the key at push time.
        owner: NodeId,
        /// Raw value bytes.
        data: Vec<u8>,
    },

    // -------------------------------------------------------------------
    // Aggregation tree
    // -------------------------------------------------------------------
    /// Ask to become a child of the callee. Answered by one of the
    /// `RegisterChild*` variants.
    RegisterChild {
        /// The registering node.
        child: NodeRef,
        /// Ring slot the child resolved the callee from; `None` after a redirect.
        slot: Option<NodeId>,
    },

    /// Registration accepted.
    RegisterChildOk,

    /// All child slots are taken and no redirect target exists.
    RegisterChildEfull,

    /// The callee does not own the slot the child targeted.
    RegisterChildEwrong,

    /// All child slots are taken; register at `parent` instead.
    RegisterChildRedirect {
        /// Suggested parent.
        parent: NodeRef,
    },

    /// Periodic child heartbeat carrying the child's subtree stats.
    /// Answered by [`RefreshChildOk`](Self::RefreshChildOk) or
    /// [`RefreshChildRedirect`](Self::RefreshChildRedirect).
    RefreshChild {
        /// The refreshing child.
        child: NodeRef,
        /// Aggregated stats of the child's subtree.
        stats: AggregateStats,
    },

    /// Refresh recorded.
    RefreshChildOk,

    /// The callee does not know this child any more; register again.
    RefreshChildRedirect,

    /// Status query. Answered by [`GetStatsResp`](Self::GetStatsResp).
    GetStats,

    /// A node's current view of itself and its subtree.
    GetStatsResp {
        /// The answering node.
        node: NodeRef,
        /// Its predecessor.
        predecessor: Option<NodeRef>,
        /// Its successor.
        successor: NodeRef,
        /// Aggregated stats of its subtree.
        stats: AggregateStats,
    },
}

impl ChordMessage {
    /// Short name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetPredecessor => "GET_PREDECESSOR",
            Self::GetPredecessorResp { .. } => "GET_PREDECESSOR_RESP",
            Self::GetPredecessorRespNull => "GET_PREDECESSOR_RESP_NULL",
            Self::GetSuccessor => "GET_SUCCESSOR",
            Self::GetSuccessorResp { .. } => "GET_SUCCESSOR_RESP",
            Self::FindSuccessor { .. } => "FIND_SUCCESSOR",
            Self::FindSuccessorLinear { .. } => "FIND_SUCCESSOR_LINEAR",
            Self::FindSuccessorResp { .. } => "FIND_SUCCESSOR_RESP",
            Self::FindSuccessorRespNext { .. } => "FIND_SUCCESSOR_RESP_NEXT",
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
            Self::Notify { .. } => "NOTIFY",
            Self::CopySuccessorList => "COPY_SUCCESSORLIST",
            Self::CopySuccessorListResp { .. } => "COPY_SUCCESSORLIST_RESP",
            Self::Exit { .. } => "EXIT",
            Self::ExitAck => "EXIT_ACK",
            Self::Get { .. } => "GET",
            Self::GetResp { .. } => "GET_RESP",
            Self::GetEfail { .. } => "GET_EFAIL",
            Self::Put { .. } => "PUT",
            Self::PutAck { .. } => "PUT_ACK",
            Self::Redirect { .. } => "REDIRECT",
            Self::GetSuccessorListId { .. } => "GET_SUCCESSORLIST_ID",
            Self::GetSuccessorListIdResp { .. } => "GET_SUCCESSORLIST_ID_RESP",
            Self::GetSuccessorListIdEfail { .. } => "GET_SUCCESSORLIST_ID_EFAIL",
            Self::Sync { .. } => "SYNC",
            Self::SyncReqResp { .. } => "SYNC_REQ_RESP",
            Self::SyncReqFetch { .. } => "SYNC_REQ_FETCH",
            Self::SyncReqFetchOk { .. } => "SYNC_REQ_FETCH_OK",
            Self::Push { .. } => "PUSH",
            Self::RegisterChild { .. } => "REGISTER_CHILD",
            Self::RegisterChildOk => "REGISTER_CHILD_OK",
            Self::RegisterChildEfull => "REGISTER_CHILD_EFULL",
            Self::RegisterChildEwrong => "REGISTER_CHILD_EWRONG",
            Self::RegisterChildRedirect { .. } => "REGISTER_CHILD_REDIRECT",
            Self::RefreshChild { .. } => "REFRESH_CHILD",
            Self::RefreshChildOk => "REFRESH_CHILD_OK",
            Self::RefreshChildRedirect => "REFRESH_CHILD_REDIRECT",
            Self::GetStats => "GET_STATS",
            Self::GetStatsResp { .. } => "GET_STATS_RESP",
        }
    }
}
