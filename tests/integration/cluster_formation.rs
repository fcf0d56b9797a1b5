//! Integration test: ring formation over TCP.
//!
//! Nodes join one by one through the first node and the maintenance loops
//! close the ring without further help.

use chord_integration_tests::TcpCluster;
use chord_types::{NodeId, RING_SIZE};

#[tokio::test]
async fn test_5_node_ring_converges() {
    let c = TcpCluster::start(&[10, 60, 110, 160, 210]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let live = c.live_nodes();
    for node in &live {
        let list = node.successor_list().await;
        assert_eq!(list.len(), 3, "successor list of {}", node.local());
        assert_eq!(list[0], node.successor().await);
    }
}

#[tokio::test]
async fn test_lookup_agrees_from_every_node() {
    let c = TcpCluster::start(&[10, 60, 110, 160, 210]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    for node in c.live_nodes() {
        for id in (0..RING_SIZE).step_by(11) {
            let id = NodeId::new(id);
            let owner = node.lookup(id).await.unwrap();
            assert_eq!(owner, c.expected_owner(id), "lookup of {id} from {}", node.local());
        }
    }
}

#[tokio::test]
async fn test_root_aggregates_whole_ring() {
    let c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");
    assert!(c.wait_root_count(4).await, "root never counted 4 nodes");

    let status = c.node(64).get_stats(c.node_ref(0).addr).await.unwrap();
    assert_eq!(status.node, c.node_ref(0));
    assert_eq!(status.predecessor, Some(c.node_ref(192)));
    assert_eq!(status.successor, c.node_ref(64));
    assert_eq!(status.stats.node_count, 4);
}

#[tokio::test]
async fn test_single_node_ring() {
    let c = TcpCluster::start(&[99]).await;
    assert!(c.wait_converged().await);

    let node = c.node(99);
    assert_eq!(node.lookup(NodeId::new(3)).await.unwrap(), node.local());
    assert_eq!(node.stats().await.node_count, 1);
}
