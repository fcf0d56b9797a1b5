//! Integration test: node failure and departure.
//!
//! Crashed nodes are routed around once stabilization notices them; values
//! they owned stay readable from their successor.

use chord_integration_tests::{TcpCluster, test_data_seeded};
use chord_types::NodeId;

#[tokio::test]
async fn test_ring_repairs_after_crash() {
    let mut c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    c.kill(64);
    assert!(c.wait_converged().await, "ring did not repair");

    assert_eq!(c.node(0).successor().await, c.node_ref(128));
    assert_eq!(c.node(128).predecessor().await, Some(c.node_ref(0)));
    let owner = c.node(192).lookup(NodeId::new(30)).await.unwrap();
    assert_eq!(owner, c.node_ref(128));
}

#[tokio::test]
async fn test_values_survive_owner_crash() {
    let mut c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let mut values = Vec::new();
    for i in 0..30u32 {
        let key = format!("obj-{i:03}");
        let data = test_data_seeded(100 + i as usize * 11, i + 1);
        c.node(0).put(key.as_bytes(), &data).await.unwrap();
        values.push((key, data));
    }
    // Let replication catch up.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    c.kill(128);
    assert!(c.wait_converged().await, "ring did not repair");

    for (key, data) in &values {
        let got = c.node(192).get(key.as_bytes()).await.unwrap();
        assert_eq!(got.as_ref(), data.as_slice(), "{key} lost");
    }
}

#[tokio::test]
async fn test_two_adjacent_crashes() {
    let mut c = TcpCluster::start(&[0, 50, 100, 150, 200]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    c.kill(50);
    c.kill(100);
    assert!(c.wait_converged().await, "ring did not repair");
    assert_eq!(c.node(0).successor().await, c.node_ref(150));
}

#[tokio::test]
async fn test_graceful_leave() {
    let mut c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    c.node(0).put(b"handover", b"value").await.unwrap();
    let id = NodeId::from_data(b"handover");
    let owner = c.expected_owner(id);

    c.leave(owner.id.value()).await;
    assert!(c.wait_converged().await, "ring did not close after leave");

    let got = c.live_nodes()[0].get(b"handover").await.unwrap();
    assert_eq!(got.as_ref(), b"value");
}

#[tokio::test]
async fn test_rejoin_after_crash() {
    let mut c = TcpCluster::start(&[0, 128]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    c.kill(128);
    assert!(c.wait_converged().await, "survivor did not settle alone");
    assert_eq!(c.node(0).successor().await, c.node_ref(0));

    c.add_node(100).await;
    assert!(c.wait_converged().await, "ring did not grow back");
    assert_eq!(c.node(0).successor().await, c.node_ref(100));
}
