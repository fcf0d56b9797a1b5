//! Shared test utilities for chord-engine tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use chord_net::{ChordMessage, NetError, Transport};
use chord_store::{BlockDevice, MemoryDevice};
use chord_types::{NodeId, NodeRef};
use tokio::sync::RwLock;

use crate::config::ChordNodeConfig;
use crate::node::ChordNode;

/// Pages per node unless a test asks for fewer.
pub const TEST_BLOCKS: u32 = 256;

/// Stabilization rounds after which a small ring has converged, fingers
/// included.
pub const CONVERGE_ROUNDS: usize = 20;

/// Route engine logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Only the first test in the binary installs it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// A key whose ring id lies in `(lo, hi]`.
pub fn key_in(lo: u32, hi: u32) -> Vec<u8> {
    (0u32..)
        .map(|n| format!("key-{n}").into_bytes())
        .find(|k| NodeId::from_data(k).in_half_open(NodeId::new(lo), NodeId::new(hi)))
        .unwrap()
}

/// Address a test node with ring id `id` is reachable at.
pub fn test_addr(id: u32) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000 + id as u16))
}

/// An in-process network that delivers requests straight into the target
/// node's handler, with support for simulating crashed nodes.
///
/// A node in `down_nodes` fails every request with
/// [`NetError::Unreachable`], as a crashed peer would after its timeout.
#[derive(Default)]
pub struct MemoryNetwork {
    /// Maps address → node for all nodes on the network.
    nodes: RwLock<HashMap<SocketAddr, Weak<ChordNode>>>,
    /// Set of nodes currently "down" (unreachable).
    down_nodes: RwLock<HashSet<SocketAddr>>,
}

impl MemoryNetwork {
    pub async fn attach(&self, node: &Arc<ChordNode>) {
        self.nodes
            .write()
            .await
            .insert(node.local().addr, Arc::downgrade(node));
    }

    pub async fn set_down(&self, addr: SocketAddr) {
        self.down_nodes.write().await.insert(addr);
    }

    pub async fn set_up(&self, addr: SocketAddr) {
        self.down_nodes.write().await.remove(&addr);
    }

    async fn target(&self, addr: SocketAddr) -> Result<Arc<ChordNode>, NetError> {
        if self.down_nodes.read().await.contains(&addr) {
            return Err(NetError::Unreachable(addr));
        }
        self.nodes
            .read()
            .await
            .get(&addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| NetError::Connect {
                addr,
                reason: "no node at this address".into(),
            })
    }
}

#[async_trait::async_trait]
impl Transport for MemoryNetwork {
    async fn request(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<ChordMessage, NetError> {
        let node = self.target(addr).await?;
        node.handle_message(msg.clone())
            .await
            .ok_or(NetError::StreamClosed(addr))
    }

    async fn send_to(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<(), NetError> {
        let node = self.target(addr).await?;
        node.handle_message(msg.clone()).await;
        Ok(())
    }
}

/// A ring of in-process nodes with explicit ids, driven by hand: nothing
/// runs in the background, tests call the maintenance rounds themselves.
pub struct TestRing {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Arc<ChordNode>>,
}

impl TestRing {
    /// Create a ring of nodes with the given ids, joined one by one through
    /// the first node and stabilized until converged.
    pub async fn with_ids(ids: &[u32]) -> Self {
        Self::build(ids, TEST_BLOCKS).await
    }

    /// Like [`with_ids`](Self::with_ids) with `blocks` pages per node.
    pub async fn build(ids: &[u32], blocks: u32) -> Self {
        assert!(!ids.is_empty(), "need at least one node");
        init_tracing();

        let mut ring = Self {
            network: Arc::new(MemoryNetwork::default()),
            nodes: Vec::new(),
        };
        for &id in ids {
            ring.spawn_node(id, blocks).await;
            ring.stabilize_rounds(2).await;
        }
        ring.stabilize_rounds(CONVERGE_ROUNDS).await;
        ring
    }

    /// Add a node with ring id `id` and join it through the first node.
    pub async fn spawn_node(&mut self, id: u32, blocks: u32) -> Arc<ChordNode> {
        let node = self.new_node(id, blocks).await;
        let bootstrap = self.nodes.first().map(|n| n.local().addr);
        node.join(bootstrap).await.unwrap();
        self.nodes.push(node.clone());
        node
    }

    /// Create a node on this network without joining it anywhere.
    pub async fn new_node(&self, id: u32, blocks: u32) -> Arc<ChordNode> {
        let local = NodeRef::new(NodeId::new(id), test_addr(id));
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(blocks));
        let node = ChordNode::new(
            local,
            ChordNodeConfig::test_config(),
            self.network.clone(),
            device,
        );
        self.network.attach(&node).await;
        node
    }

    pub fn node(&self, id: u32) -> &Arc<ChordNode> {
        self.nodes
            .iter()
            .find(|n| n.local().id == NodeId::new(id))
            .unwrap()
    }

    pub fn node_ref(&self, id: u32) -> NodeRef {
        self.node(id).local()
    }

    /// Nodes the network still delivers to.
    pub async fn live_nodes(&self) -> Vec<Arc<ChordNode>> {
        let down = self.network.down_nodes.read().await;
        self.nodes
            .iter()
            .filter(|n| !down.contains(&n.local().addr))
            .cloned()
            .collect()
    }

    /// Run `rounds` stabilization rounds on every live node.
    pub async fn stabilize_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.live_nodes().await {
                node.stabilize().await;
            }
        }
    }

    /// Run `rounds` replica sync rounds on every live node.
    pub async fn sync_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.live_nodes().await {
                node.sync_tick().await;
            }
        }
    }

    /// Run `rounds` aggregation tree rounds on every live node.
    pub async fn tree_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            for node in self.live_nodes().await {
                node.tree_tick().await;
            }
        }
    }

    /// Crash the node with ring id `id`.
    pub async fn kill(&self, id: u32) {
        self.network.set_down(test_addr(id)).await;
    }

    /// Let spawned background work (immediate replication) run to completion.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
