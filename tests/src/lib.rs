//! Shared test harness for chordstore integration tests.
//!
//! Provides [`TcpCluster`]: N real nodes on localhost, each with its own
//! listener, in-memory block device and running maintenance loop. Nodes are
//! given explicit ring ids so tests can reason about ownership.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chord_engine::{ChordNode, ChordNodeConfig};
use chord_store::{BlockDevice, MemoryDevice};
use chord_types::{NodeId, NodeRef};
use tracing::debug;

/// Pages per node.
pub const BLOCKS_PER_NODE: u32 = 256;

/// How long tests wait for the ring to settle.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A cluster of real TCP nodes with failure injection.
pub struct TcpCluster {
    nodes: Vec<Arc<ChordNode>>,
    dead: HashSet<NodeId>,
}

impl TcpCluster {
    /// Start one node per id, joined one after another through the first.
    pub async fn start(ids: &[u32]) -> Self {
        assert!(!ids.is_empty(), "need at least one node");

        let mut cluster = Self {
            nodes: Vec::with_capacity(ids.len()),
            dead: HashSet::new(),
        };
        for &id in ids {
            cluster.add_node(id).await;
        }
        cluster
    }

    /// Start a node with ring id `id` and join it through the first live node.
    pub async fn add_node(&mut self, id: u32) -> Arc<ChordNode> {
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(BLOCKS_PER_NODE));
        let node = ChordNode::bind(
            listen,
            Some(NodeId::new(id)),
            ChordNodeConfig::test_config(),
            device,
        )
        .await
        .unwrap();

        let bootstrap = self.live_nodes().first().map(|n| n.local().addr);
        node.join(bootstrap).await.unwrap();
        node.start();
        debug!(node = %node.local(), "test node started");

        self.nodes.push(node.clone());
        node
    }

    /// Node with ring id `id`.
    pub fn node(&self, id: u32) -> &Arc<ChordNode> {
        self.nodes
            .iter()
            .find(|n| n.local().id == NodeId::new(id))
            .unwrap_or_else(|| panic!("no node with id {id}"))
    }

    pub fn node_ref(&self, id: u32) -> NodeRef {
        self.node(id).local()
    }

    /// Nodes not killed or departed, in ring order.
    pub fn live_nodes(&self) -> Vec<Arc<ChordNode>> {
        let mut live: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| !self.dead.contains(&n.local().id))
            .cloned()
            .collect();
        live.sort_by_key(|n| n.local().id);
        live
    }

    /// Crash a node: it stops listening and stops maintenance.
    pub fn kill(&mut self, id: u32) {
        self.node(id).shutdown();
        self.dead.insert(NodeId::new(id));
    }

    /// Leave gracefully.
    pub async fn leave(&mut self, id: u32) {
        self.node(id).leave().await.unwrap();
        self.dead.insert(NodeId::new(id));
    }

    /// Whether every live node points at its ring neighbours.
    pub async fn is_consistent(&self) -> bool {
        let live = self.live_nodes();
        let n = live.len();
        for (i, node) in live.iter().enumerate() {
            let next = live[(i + 1) % n].local();
            let prev = live[(i + n - 1) % n].local();
            if node.successor().await != next {
                return false;
            }
            let expected_pred = if n == 1 { None } else { Some(prev) };
            if node.predecessor().await != expected_pred {
                return false;
            }
        }
        true
    }

    /// Poll until the ring is consistent. Returns `false` on timeout.
    pub async fn wait_converged(&self) -> bool {
        let deadline = Instant::now() + CONVERGE_TIMEOUT;
        while Instant::now() < deadline {
            if self.is_consistent().await {
                // Let the fingers catch up with the final topology.
                tokio::time::sleep(ChordNodeConfig::test_config().stabilize_interval * 12).await;
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// Poll until the root of the aggregation tree counts `expected` nodes.
    pub async fn wait_root_count(&self, expected: u64) -> bool {
        let root = self.live_nodes()[0].clone();
        let deadline = Instant::now() + CONVERGE_TIMEOUT;
        while Instant::now() < deadline {
            if root.stats().await.node_count == expected {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        false
    }

    /// The live node that owns `id`.
    pub fn expected_owner(&self, id: NodeId) -> NodeRef {
        let live = self.live_nodes();
        live.iter()
            .find(|n| n.local().id >= id)
            .unwrap_or(&live[0])
            .local()
    }

    /// Stop every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for TcpCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    test_data_seeded(size, 0xDEAD_BEEF)
}

/// Generate test data with a specific seed (for unique values).
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}
