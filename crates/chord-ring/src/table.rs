//! Routing table implementation.

use chord_types::{FINGER_COUNT, NodeId, NodeRef, SUCCESSOR_LIST_LEN};
use tracing::{debug, info};

/// One finger table slot.
///
/// Entry `i` covers `[start, start + interval_len)` with
/// `start = self + 2^i` and `interval_len = 2^i`; `node` is the best known
/// successor of `start`, or `None` until the slot is first fixed (or after
/// the node it pointed at died).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerEntry {
    /// First id covered by this entry.
    pub start: NodeId,
    /// Number of ids covered by this entry.
    pub interval_len: u32,
    /// Best known successor of `start`.
    pub node: Option<NodeRef>,
}

/// Routing state of the local node.
///
/// Created once at join time and updated in place afterwards. The successor
/// is never absent: a fresh ring (or a node that lost every successor)
/// points at itself. Finger 0 always mirrors the successor.
#[derive(Debug, Clone)]
pub struct RingTable {
    local: NodeRef,
    predecessor: Option<NodeRef>,
    successor: NodeRef,
    fingers: [FingerEntry; FINGER_COUNT],
    successor_list: [Option<NodeRef>; SUCCESSOR_LIST_LEN],
    next_finger: usize,
}

impl RingTable {
    /// Create the table of a one-node ring: no predecessor, successor = self.
    pub fn new(local: NodeRef) -> Self {
        let fingers = std::array::from_fn(|i| FingerEntry {
            start: local.id.finger_start(i),
            interval_len: 1 << i,
            node: None,
        });
        let mut table = Self {
            local,
            predecessor: None,
            successor: local,
            fingers,
            successor_list: [None; SUCCESSOR_LIST_LEN],
            next_finger: 0,
        };
        table.fingers[0].node = Some(local);
        table
    }

    /// This node.
    pub fn local(&self) -> NodeRef {
        self.local
    }

    /// Current predecessor, if one is known.
    pub fn predecessor(&self) -> Option<NodeRef> {
        self.predecessor
    }

    /// Current successor.
    pub fn successor(&self) -> NodeRef {
        self.successor
    }

    /// The node is alone on its ring (its successor is itself).
    pub fn is_singleton(&self) -> bool {
        self.successor.id == self.local.id
    }

    /// Whether this node owns `id`, i.e. `id ∈ (predecessor, self]`.
    ///
    /// A singleton without a predecessor owns the whole ring. A node that
    /// has a successor but has not been notified by a predecessor yet only
    /// claims its own id; everything else is routed onward.
    pub fn owns(&self, id: NodeId) -> bool {
        match self.predecessor {
            Some(pred) => id.in_half_open(pred.id, self.local.id),
            None if self.is_singleton() => true,
            None => id == self.local.id,
        }
    }

    /// Whether `id` falls between this node and its successor, `(self, succ]`.
    ///
    /// If so the successor is the owner of `id`.
    pub fn successor_owns(&self, id: NodeId) -> bool {
        !self.is_singleton() && id.in_half_open(self.local.id, self.successor.id)
    }

    /// The finger node that most closely precedes `id`.
    ///
    /// Scans from the farthest finger down and returns the first node lying
    /// strictly inside `(self, id)`. Falls back to `self`, so the result is
    /// never farther from `id` than this node is.
    pub fn closest_preceding_finger(&self, id: NodeId) -> NodeRef {
        self.fingers
            .iter()
            .rev()
            .filter_map(|f| f.node)
            .find(|node| node.id.in_open(self.local.id, id))
            .unwrap_or(self.local)
    }

    /// Replace the successor. Finger 0 follows.
    pub fn update_successor(&mut self, node: NodeRef) {
        if self.successor != node {
            info!(local = %self.local, successor = %node, "successor changed");
        }
        self.successor = node;
        self.fingers[0].node = Some(node);
    }

    /// Replace (or clear) the predecessor.
    pub fn update_predecessor(&mut self, node: Option<NodeRef>) {
        if self.predecessor != node {
            match node {
                Some(pred) => info!(local = %self.local, predecessor = %pred, "predecessor changed"),
                None => info!(local = %self.local, "predecessor cleared"),
            }
        }
        self.predecessor = node;
    }

    /// Record the successor of finger `i`'s start.
    ///
    /// Setting finger 0 also sets the successor.
    pub fn set_finger(&mut self, i: usize, node: NodeRef) {
        if i == 0 {
            self.update_successor(node);
            return;
        }
        if let Some(finger) = self.fingers.get_mut(i) {
            finger.node = Some(node);
        }
    }

    /// Finger entry `i`.
    pub fn finger(&self, i: usize) -> &FingerEntry {
        &self.fingers[i]
    }

    /// All finger entries, nearest first.
    pub fn fingers(&self) -> &[FingerEntry] {
        &self.fingers
    }

    /// Start id of finger `i`.
    pub fn finger_start(&self, i: usize) -> NodeId {
        self.fingers[i].start
    }

    /// Index of the finger to repair this round. Advances round-robin.
    pub fn next_finger_index(&mut self) -> usize {
        let i = self.next_finger;
        self.next_finger = (self.next_finger + 1) % FINGER_COUNT;
        i
    }

    /// Known successors in ring order, nearest first.
    pub fn successor_list(&self) -> Vec<NodeRef> {
        self.successor_list.iter().flatten().copied().collect()
    }

    /// Replace the successor list.
    ///
    /// Entries pointing at this node and duplicates are dropped, and the
    /// list is truncated to [`SUCCESSOR_LIST_LEN`].
    pub fn set_successor_list(&mut self, nodes: impl IntoIterator<Item = NodeRef>) {
        let mut list = [None; SUCCESSOR_LIST_LEN];
        let mut len = 0;
        for node in nodes {
            if len == SUCCESSOR_LIST_LEN {
                break;
            }
            if node.id == self.local.id || list[..len].contains(&Some(node)) {
                continue;
            }
            list[len] = Some(node);
            len += 1;
        }
        self.successor_list = list;
    }

    /// Forget a node that stopped answering.
    ///
    /// Clears every finger, successor-list entry and the predecessor if they
    /// point at `id`. When `id` was the successor, the next successor-list
    /// entry is promoted, or this node becomes its own successor. Returns
    /// whether anything referenced the node.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if id == self.local.id {
            return false;
        }
        let mut removed = false;

        for finger in self.fingers.iter_mut().skip(1) {
            if finger.node.is_some_and(|n| n.id == id) {
                finger.node = None;
                removed = true;
            }
        }

        let remaining: Vec<NodeRef> = self
            .successor_list()
            .into_iter()
            .filter(|n| n.id != id)
            .collect();
        if remaining.len() != self.successor_list().len() {
            removed = true;
        }
        self.set_successor_list(remaining);

        if self.predecessor.is_some_and(|p| p.id == id) {
            self.update_predecessor(None);
            removed = true;
        }

        if self.successor.id == id {
            let next = self.successor_list.iter().flatten().next().copied();
            let promoted = next.unwrap_or(self.local);
            debug!(local = %self.local, dead = %id, promoted = %promoted, "promoting successor");
            self.update_successor(promoted);
            removed = true;
        }

        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
