//! Periodic ring maintenance.
//!
//! One [`ChordNode::stabilize`] call is one round: verify the successor,
//! stabilize against the successor's predecessor, fix one finger, verify
//! the predecessor and refresh the successor list. Every update is applied
//! after the response that justifies it arrived, and no lock is held while a
//! request is in flight.

use chord_types::NodeId;
use tracing::{debug, error, warn};

use crate::node::ChordNode;

impl ChordNode {
    /// Run one full stabilization round.
    pub async fn stabilize(&self) {
        self.check_successor().await;
        self.stabilize_successor().await;
        self.fix_next_finger().await;
        self.check_predecessor().await;
        self.refresh_successor_list().await;
    }

    /// Ping the successor; drop it and promote the next live entry of the
    /// successor list when it does not answer.
    pub(crate) async fn check_successor(&self) {
        let local = self.local();
        loop {
            let succ = self.ring().read().await.successor();
            if succ == local {
                return;
            }
            let Err(e) = self.ping(succ).await else {
                return;
            };

            warn!(%local, dead = %succ, "successor unreachable: {e}");
            let mut ring = self.ring().write().await;
            if ring.successor() != succ {
                // Changed under us (notify, exit); verify the new one next.
                continue;
            }
            ring.remove_node(succ.id);
            if ring.is_singleton() {
                error!(
                    %local,
                    "ring empty: every successor is unreachable, continuing as a ring of one"
                );
                return;
            }
        }
    }

    /// Adopt the successor's predecessor when it sits between us and the
    /// successor, then notify the successor about us.
    pub(crate) async fn stabilize_successor(&self) {
        let local = self.local();
        let succ = self.ring().read().await.successor();

        match self.get_predecessor(succ).await {
            Ok(Some(x)) if x.id != local.id && x.id.in_open(local.id, succ.id) => {
                let mut ring = self.ring().write().await;
                if ring.successor() == succ {
                    ring.update_successor(x);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(%local, successor = %succ, "get_predecessor failed: {e}"),
        }

        let succ = self.ring().read().await.successor();
        if succ != local
            && let Err(e) = self.notify(succ, local).await
        {
            debug!(%local, successor = %succ, "notify failed: {e}");
        }
    }

    /// Recompute the next finger in round-robin order.
    ///
    /// Finger 0 is the successor and is kept by stabilization itself.
    pub(crate) async fn fix_next_finger(&self) {
        let (i, start) = {
            let mut ring = self.ring().write().await;
            let i = ring.next_finger_index();
            (i, ring.finger_start(i))
        };
        if i == 0 {
            return;
        }
        self.fix_finger(i, start).await;
    }

    async fn fix_finger(&self, i: usize, start: NodeId) {
        match self.find_successor(self.local().addr, start).await {
            Ok(node) => self.ring().write().await.set_finger(i, node),
            Err(e) => debug!(local = %self.local(), finger = i, %start, "fix finger failed: {e}"),
        }
    }

    /// Recompute every finger at once. Used right after joining.
    pub async fn fix_all_fingers(&self) {
        let starts: Vec<(usize, NodeId)> = {
            let ring = self.ring().read().await;
            (1..ring.fingers().len())
                .map(|i| (i, ring.finger_start(i)))
                .collect()
        };
        for (i, start) in starts {
            self.fix_finger(i, start).await;
        }
    }

    /// Clear the predecessor if it stopped answering.
    pub(crate) async fn check_predecessor(&self) {
        let Some(pred) = self.ring().read().await.predecessor() else {
            return;
        };
        if let Err(e) = self.ping(pred).await {
            warn!(local = %self.local(), dead = %pred, "predecessor unreachable: {e}");
            let mut ring = self.ring().write().await;
            if ring.predecessor() == Some(pred) {
                ring.update_predecessor(None);
            }
        }
    }

    /// Successor list = successor followed by the successor's own list.
    pub(crate) async fn refresh_successor_list(&self) {
        let local = self.local();
        let succ = self.ring().read().await.successor();
        if succ == local {
            self.ring().write().await.set_successor_list(std::iter::empty());
            return;
        }

        match self.copy_successor_list(succ).await {
            Ok(list) => {
                let mut ring = self.ring().write().await;
                if ring.successor() == succ {
                    ring.set_successor_list(std::iter::once(succ).chain(list));
                }
            }
            Err(e) => debug!(%local, successor = %succ, "copy successor list failed: {e}"),
        }
    }
}
