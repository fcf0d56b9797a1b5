//! Aggregation tree: a parent/child overlay for rolling up cluster stats.
//!
//! The tree is laid out as a heap over ring slots. A node starts at its own
//! id and walks up `parent_slot(s) = (s - 1) / TREE_FANOUT` until the owner
//! of the slot is some other node; that node is its parent. Slot owners are
//! the first node at or after the slot, so a parent always has a smaller id
//! than its child and the node owning slot 0 is the root.
//!
//! Every node reports `own usage + Σ children` upward on each tree tick.
//! Children that stop refreshing are evicted, and a child whose parent
//! forgot it registers again.

use std::time::{Duration, Instant};

use chord_types::{AggregateStats, NodeId, NodeRef, TREE_FANOUT};
use tracing::{debug, info, warn};

use crate::node::ChordNode;

/// Heap parent of a ring slot. Slot 0 has none.
pub fn parent_slot(slot: NodeId) -> Option<NodeId> {
    match slot.value() {
        0 => None,
        s => Some(NodeId::new((s - 1) / TREE_FANOUT as u32)),
    }
}

/// Answer to a child registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The child is registered (or already was).
    Accepted,
    /// No free slot and no registered child to hand the requester to.
    Full,
    /// The parent does not own the slot the child targeted.
    WrongSlot,
    /// No free slot; try this registered child instead.
    Redirect(NodeRef),
}

/// A registered child and what it last reported.
#[derive(Debug, Clone, Copy)]
pub struct ChildEntry {
    /// The child.
    pub node: NodeRef,
    /// Stats of the child's subtree from its last refresh.
    pub stats: AggregateStats,
    /// When the child last registered or refreshed.
    pub last_refresh: Instant,
}

/// Local view of the aggregation tree: the parent and up to
/// [`TREE_FANOUT`] children.
#[derive(Debug)]
pub struct AggregationTree {
    parent: Option<NodeRef>,
    children: Vec<ChildEntry>,
    child_timeout: Duration,
}

impl AggregationTree {
    /// Empty tree state; children expire after `child_timeout` without a refresh.
    pub fn new(child_timeout: Duration) -> Self {
        Self {
            parent: None,
            children: Vec::with_capacity(TREE_FANOUT),
            child_timeout,
        }
    }

    /// Current parent, `None` for the root or while unattached.
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    /// Record the parent this node is attached to.
    pub fn set_parent(&mut self, parent: Option<NodeRef>) {
        self.parent = parent;
    }

    /// Registered children.
    pub fn children(&self) -> &[ChildEntry] {
        &self.children
    }

    /// Handle a registration request from `child`.
    ///
    /// `slot_owned` is `Some(owned)` when the child targeted a ring slot,
    /// `None` when it arrives through a redirect.
    pub fn register(
        &mut self,
        child: NodeRef,
        slot_owned: Option<bool>,
        now: Instant,
    ) -> Registration {
        if let Some(entry) = self.children.iter_mut().find(|c| c.node.id == child.id) {
            entry.node = child;
            entry.last_refresh = now;
            return Registration::Accepted;
        }

        if slot_owned == Some(false) {
            return Registration::WrongSlot;
        }

        if self.children.len() < TREE_FANOUT {
            self.children.push(ChildEntry {
                node: child,
                stats: AggregateStats::default(),
                last_refresh: now,
            });
            info!(%child, children = self.children.len(), "child registered");
            return Registration::Accepted;
        }

        // Hand the requester to the largest child below it so that parents
        // keep smaller ids than their children.
        self.children
            .iter()
            .filter(|c| c.node.id.value() < child.id.value())
            .max_by_key(|c| c.node.id.value())
            .map_or(Registration::Full, |c| Registration::Redirect(c.node))
    }

    /// Record a refresh. Returns `false` if `child` is not registered.
    pub fn refresh(&mut self, child: NodeId, stats: AggregateStats, now: Instant) -> bool {
        match self.children.iter_mut().find(|c| c.node.id == child) {
            Some(entry) => {
                entry.stats = stats;
                entry.last_refresh = now;
                true
            }
            None => false,
        }
    }

    /// Drop children that have not refreshed within the timeout.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<NodeRef> {
        let timeout = self.child_timeout;
        let mut evicted = Vec::new();
        self.children.retain(|c| {
            let fresh = now.saturating_duration_since(c.last_refresh) <= timeout;
            if !fresh {
                evicted.push(c.node);
            }
            fresh
        });
        evicted
    }

    /// `own` plus every child's last reported stats.
    pub fn aggregate(&self, own: AggregateStats) -> AggregateStats {
        self.children.iter().fold(own, |acc, c| acc + c.stats)
    }
}

impl ChordNode {
    /// One aggregation round: evict stale children, then report upward,
    /// (re)attaching to a parent when needed.
    pub async fn tree_tick(&self) {
        let evicted = self.tree().write().await.evict_stale(Instant::now());
        for child in evicted {
            info!(local = %self.local(), %child, "evicted stale tree child");
        }

        let parent = self.tree().read().await.parent();
        if let Some(parent) = parent {
            let stats = self.stats().await;
            match self.refresh_child(parent, stats).await {
                Ok(true) => return,
                Ok(false) => debug!(%parent, "parent forgot us, registering again"),
                Err(e) => warn!(%parent, "tree refresh failed: {e}"),
            }
            self.tree().write().await.set_parent(None);
        }

        self.attach_to_parent().await;
    }

    /// Find the owner of the nearest ancestor slot that is not this node.
    ///
    /// Returns `Ok(None)` when this node is the root.
    async fn resolve_parent(&self) -> Result<Option<(NodeId, NodeRef)>, crate::ChordError> {
        let local = self.local();
        let mut slot = local.id;
        while let Some(up) = parent_slot(slot) {
            let owner = self.lookup(up).await?;
            if owner.id != local.id {
                return Ok(Some((up, owner)));
            }
            slot = up;
        }
        Ok(None)
    }

    async fn attach_to_parent(&self) {
        let local = self.local();
        let (slot, mut candidate) = match self.resolve_parent().await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!(%local, "aggregation tree root");
                return;
            }
            Err(e) => {
                debug!(%local, "could not resolve tree parent: {e}");
                return;
            }
        };

        if candidate.id.value() > local.id.value() {
            // Only possible while lookups are still converging.
            debug!(%local, %candidate, "resolved parent above us, retrying later");
            return;
        }

        let mut slot = Some(slot);
        for _ in 0..self.config().max_lookup_hops {
            match self.register_child(candidate, slot).await {
                Ok(Registration::Accepted) => {
                    info!(%local, parent = %candidate, "attached to tree parent");
                    self.tree().write().await.set_parent(Some(candidate));
                    let stats = self.stats().await;
                    if let Err(e) = self.refresh_child(candidate, stats).await {
                        debug!(parent = %candidate, "initial tree refresh failed: {e}");
                    }
                    return;
                }
                Ok(Registration::Redirect(next)) => {
                    debug!(from = %candidate, to = %next, "tree registration redirected");
                    candidate = next;
                    slot = None;
                }
                Ok(outcome) => {
                    debug!(parent = %candidate, ?outcome, "tree registration refused");
                    return;
                }
                Err(e) => {
                    warn!(parent = %candidate, "tree registration failed: {e}");
                    return;
                }
            }
        }
    }
}
