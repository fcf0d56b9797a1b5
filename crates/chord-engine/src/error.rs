//! Error types for the engine.

use chord_types::NodeId;

/// Errors that can occur during node operations.
#[derive(Debug, thiserror::Error)]
pub enum ChordError {
    /// A remote node did not answer within the request deadline.
    #[error("request to {node} timed out")]
    Timeout {
        /// The node that did not answer.
        node: String,
    },

    /// A lookup followed too many redirects without reaching the owner.
    #[error("lookup for {id} exhausted after {hops} hops")]
    LookupExhausted {
        /// The id being resolved.
        id: NodeId,
        /// Hops taken before giving up.
        hops: usize,
    },

    /// The owner has no free pages for the value.
    #[error("owner of key {key_id} has no space left")]
    StorageFull {
        /// Ring id of the key.
        key_id: NodeId,
    },

    /// The request landed on a node that does not own the id.
    #[error("node does not own {id}")]
    OwnershipMismatch {
        /// The id that was asked for.
        id: NodeId,
    },

    /// The owner does not hold the key.
    #[error("key {key_id} not found")]
    NotFound {
        /// Ring id of the key.
        key_id: NodeId,
    },

    /// Another live node already holds this node's ring id.
    #[error("ring id {id} is already taken by {holder}")]
    IdTaken {
        /// The contested id.
        id: NodeId,
        /// Address of the node holding it.
        holder: std::net::SocketAddr,
    },

    /// A peer answered with a message that does not fit the request.
    #[error("unexpected {got} in response to {request}")]
    Malformed {
        /// Kind of the request that was sent.
        request: &'static str,
        /// Kind of the response that arrived.
        got: &'static str,
    },

    /// Network transport error.
    #[error("network error: {0}")]
    Net(chord_net::NetError),

    /// Local block storage error.
    #[error("store error: {0}")]
    Store(#[from] chord_store::StoreError),
}

impl From<chord_net::NetError> for ChordError {
    fn from(err: chord_net::NetError) -> Self {
        match err {
            chord_net::NetError::Timeout { addr, .. } => ChordError::Timeout {
                node: addr.to_string(),
            },
            other => ChordError::Net(other),
        }
    }
}

impl ChordError {
    /// Whether the error means the remote node could not be reached or did
    /// not answer in time.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ChordError::Timeout { .. } | ChordError::Net(_))
    }
}
