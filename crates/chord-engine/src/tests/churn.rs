//! Failures, joins and graceful leaves.

use std::net::SocketAddr;
use std::sync::Arc;

use chord_store::MemoryDevice;
use chord_types::{NodeId, NodeRef, RING_SIZE};

use crate::config::ChordNodeConfig;
use crate::error::ChordError;
use crate::node::ChordNode;

use super::helpers::{CONVERGE_ROUNDS, TEST_BLOCKS, TestRing, key_in, test_data};

const IDS: [u32; 4] = [0, 64, 128, 192];

/// Owner of `id` among `live` node ids (sorted).
fn owner_among(live: &[u32], id: u32) -> u32 {
    live.iter().copied().find(|&n| n >= id).unwrap_or(live[0])
}

#[tokio::test]
async fn test_ring_heals_after_node_failure() {
    let ring = TestRing::with_ids(&IDS).await;

    ring.kill(64).await;
    ring.stabilize_rounds(CONVERGE_ROUNDS).await;

    assert_eq!(ring.node(0).successor().await, ring.node_ref(128));
    assert_eq!(ring.node(128).predecessor().await, Some(ring.node_ref(0)));
    assert!(
        !ring
            .node(192)
            .successor_list()
            .await
            .contains(&ring.node_ref(64))
    );

    let live = [0, 128, 192];
    for node in ring.live_nodes().await {
        for id in (0..RING_SIZE).step_by(3) {
            let owner = node.lookup(NodeId::new(id)).await.unwrap();
            assert_eq!(owner, ring.node_ref(owner_among(&live, id)), "lookup of {id}");
        }
    }
}

#[tokio::test]
async fn test_ring_survives_consecutive_failures_within_successor_list() {
    let ids = [0, 40, 80, 120, 160, 200];
    let ring = TestRing::with_ids(&ids).await;

    // Two adjacent failures: node 0 must skip both via its successor list.
    ring.kill(40).await;
    ring.kill(80).await;
    ring.stabilize_rounds(CONVERGE_ROUNDS).await;

    assert_eq!(ring.node(0).successor().await, ring.node_ref(120));
    assert_eq!(ring.node(120).predecessor().await, Some(ring.node_ref(0)));

    let live = [0, 120, 160, 200];
    for id in [10, 50, 90, 130, 210] {
        let owner = ring.node(160).lookup(NodeId::new(id)).await.unwrap();
        assert_eq!(owner, ring.node_ref(owner_among(&live, id)));
    }
}

#[tokio::test]
async fn test_last_survivor_becomes_ring_of_one() {
    let ring = TestRing::with_ids(&[0, 128]).await;
    ring.kill(128).await;
    ring.stabilize_rounds(3).await;

    let node = ring.node(0);
    assert_eq!(node.successor().await, node.local());
    assert_eq!(node.predecessor().await, None);
    assert_eq!(node.lookup(NodeId::new(77)).await.unwrap(), node.local());

    let key = key_in(0, 128);
    node.put(&key, b"alone").await.unwrap();
    assert_eq!(node.get(&key).await.unwrap().as_ref(), b"alone");
}

#[tokio::test]
async fn test_notify_is_idempotent() {
    let ring = TestRing::with_ids(&IDS).await;
    let node = ring.node(128);

    for _ in 0..3 {
        node.notify(node.local(), ring.node_ref(64)).await.unwrap();
    }
    assert_eq!(node.predecessor().await, Some(ring.node_ref(64)));

    // A candidate outside (predecessor, self) is ignored.
    node.notify(node.local(), ring.node_ref(0)).await.unwrap();
    assert_eq!(node.predecessor().await, Some(ring.node_ref(64)));
    assert_eq!(node.successor().await, ring.node_ref(192));
}

#[tokio::test]
async fn test_join_takes_over_keys_in_its_range() {
    let mut ring = TestRing::with_ids(&[0, 128]).await;
    let key = key_in(0, 64);
    let id = NodeId::from_data(&key);
    let data = test_data(90);

    let owner = ring.node(0).put(&key, &data).await.unwrap();
    assert_eq!(owner, ring.node_ref(128));
    ring.settle().await;

    ring.spawn_node(64, TEST_BLOCKS).await;
    ring.stabilize_rounds(CONVERGE_ROUNDS).await;
    assert_eq!(ring.node(128).predecessor().await, Some(ring.node_ref(64)));

    // The newcomer pulls the value from its successors on first read.
    let value = ring.node(0).get(&key).await.unwrap();
    assert_eq!(value.as_ref(), data.as_slice());

    let entry = *ring.node(64).directory().read().await.entry(id).unwrap();
    assert_eq!(entry.owner, NodeId::new(64));
    let old_tag = ring.node(128).directory().read().await.entry(id).unwrap().owner;
    assert_eq!(old_tag, NodeId::new(64));
}

#[tokio::test]
async fn test_join_with_taken_id_is_rejected() {
    let ring = TestRing::with_ids(&[0, 64]).await;

    let addr: SocketAddr = "127.0.0.1:9064".parse().unwrap();
    let intruder = ChordNode::new(
        NodeRef::new(NodeId::new(64), addr),
        ChordNodeConfig::test_config(),
        ring.network.clone(),
        Arc::new(MemoryDevice::new(TEST_BLOCKS)),
    );
    ring.network.attach(&intruder).await;

    let err = intruder.join(Some(ring.node_ref(0).addr)).await.unwrap_err();
    assert!(
        matches!(err, ChordError::IdTaken { holder, .. } if holder == ring.node_ref(64).addr),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_graceful_leave_hands_keys_to_successor() {
    let ring = TestRing::with_ids(&IDS).await;
    let key = key_in(0, 64);
    let id = NodeId::from_data(&key);
    let data = test_data(260);

    ring.node(0).put(&key, &data).await.unwrap();
    ring.settle().await;

    ring.node(64).leave().await.unwrap();
    ring.kill(64).await;

    // Neighbours are spliced without waiting for stabilization.
    assert_eq!(ring.node(0).successor().await, ring.node_ref(128));
    assert_eq!(ring.node(128).predecessor().await, Some(ring.node_ref(0)));

    let entry = *ring.node(128).directory().read().await.entry(id).unwrap();
    assert_eq!(entry.owner, NodeId::new(128));

    ring.stabilize_rounds(CONVERGE_ROUNDS).await;
    let value = ring.node(192).get(&key).await.unwrap();
    assert_eq!(value.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_leave_of_last_node_is_clean() {
    let ring = TestRing::with_ids(&[5]).await;
    ring.node(5).leave().await.unwrap();
    assert_eq!(ring.node(5).successor().await, ring.node_ref(5));
}
