//! Shared types and identifiers for chordstore.
//!
//! This crate defines the identifier space every other crate works in:
//! ring constants ([`RING_BITS`], [`RING_SIZE`], [`SUCCESSOR_LIST_LEN`], ...),
//! the ring identifier [`NodeId`] with its modular interval predicates,
//! node addressing ([`NodeRef`]) and the small value types exchanged between
//! nodes ([`AggregateStats`], [`KeySummary`]).

use std::fmt;
use std::net::SocketAddr;
use std::ops::Add;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Ring constants
// ---------------------------------------------------------------------------

/// Width of a ring identifier in bits.
pub const RING_BITS: u32 = 8;

/// Number of identifiers on the ring. Always a power of two.
pub const RING_SIZE: u32 = 1 << RING_BITS;

const RING_MASK: u32 = RING_SIZE - 1;

/// Number of finger table entries (one per identifier bit).
pub const FINGER_COUNT: usize = RING_BITS as usize;

/// Length of the successor list kept for fault tolerance.
pub const SUCCESSOR_LIST_LEN: usize = 3;

/// Maximum number of children a node accepts in the aggregation tree.
pub const TREE_FANOUT: usize = 4;

/// Page size of the block device, in bytes.
pub const PAGE_SIZE: usize = 128;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A position on the identifier ring, always in `[0, RING_SIZE)`.
///
/// Used both for node identities and for hashed keys. All comparisons
/// between ids must go through the modular helpers below; plain `<` on two
/// ids is meaningless once the ring wraps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Create an id, reducing `raw` modulo the ring size.
    pub const fn new(raw: u32) -> Self {
        Self(raw & RING_MASK)
    }

    /// Hash arbitrary bytes onto the ring.
    ///
    /// BLAKE3 digest, first four bytes read little-endian, reduced modulo
    /// [`RING_SIZE`].
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&hash.as_bytes()[..4]);
        Self::new(u32::from_le_bytes(prefix))
    }

    /// Return the raw integer value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Clockwise distance from `self` to `other`.
    pub const fn distance_to(self, other: NodeId) -> u32 {
        other.0.wrapping_sub(self.0) & RING_MASK
    }

    /// The id `offset` positions clockwise from `self`.
    pub const fn offset(self, offset: u32) -> NodeId {
        NodeId(self.0.wrapping_add(offset) & RING_MASK)
    }

    /// Start of finger `i`: `self + 2^i mod RING_SIZE`.
    pub const fn finger_start(self, i: usize) -> NodeId {
        self.offset(1 << i)
    }

    /// `self` lies strictly between `a` and `b` going clockwise.
    ///
    /// When `a == b` the interval is the whole ring except `a`.
    pub const fn in_open(self, a: NodeId, b: NodeId) -> bool {
        if a.0 == b.0 {
            return self.0 != a.0;
        }
        let d = a.distance_to(self);
        d > 0 && d < a.distance_to(b)
    }

    /// `self` lies in the half-open interval `(a, b]` going clockwise.
    ///
    /// When `a == b` the interval is the whole ring.
    pub const fn in_half_open(self, a: NodeId, b: NodeId) -> bool {
        if a.0 == b.0 {
            return true;
        }
        let d = a.distance_to(self);
        d > 0 && d <= a.distance_to(b)
    }
}

impl From<u32> for NodeId {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// A live node: its ring position and the endpoint it is reachable at.
///
/// The absence of a node is always expressed as `Option<NodeRef>`; there is
/// no in-band null value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Ring identifier of the node.
    pub id: NodeId,
    /// Transport endpoint of the node.
    pub addr: SocketAddr,
}

impl NodeRef {
    /// Create a reference with an explicit id.
    pub const fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Create a reference whose id is the hash of the textual address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            id: NodeId::from_data(addr.to_string().as_bytes()),
            addr,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({self})")
    }
}

// ---------------------------------------------------------------------------
// Exchanged values
// ---------------------------------------------------------------------------

/// Cluster-wide capacity rollup carried up the aggregation tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Number of nodes in the subtree.
    pub node_count: u64,
    /// Bytes occupied by stored keys.
    pub bytes_used: u64,
    /// Bytes still free for new keys.
    pub bytes_available: u64,
}

impl AggregateStats {
    /// Stats for a single node with the given usage.
    pub const fn single(bytes_used: u64, bytes_available: u64) -> Self {
        Self {
            node_count: 1,
            bytes_used,
            bytes_available,
        }
    }
}

impl Add for AggregateStats {
    type Output = AggregateStats;

    fn add(self, rhs: AggregateStats) -> AggregateStats {
        AggregateStats {
            node_count: self.node_count + rhs.node_count,
            bytes_used: self.bytes_used + rhs.bytes_used,
            bytes_available: self.bytes_available + rhs.bytes_available,
        }
    }
}

/// Identity of a stored key as offered during replica sync.
///
/// Two copies with the same id and size are treated as the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySummary {
    /// Ring id of the key.
    pub id: NodeId,
    /// Value length in bytes.
    pub size: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
