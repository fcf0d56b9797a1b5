//! Integration test: writes and reads across a TCP ring.

use chord_engine::ChordError;
use chord_integration_tests::{TcpCluster, test_data, test_data_seeded};
use chord_types::{NodeId, PAGE_SIZE};

#[tokio::test]
async fn test_write_from_any_node_read_from_all() {
    let c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let mut values = Vec::new();
    for i in 0..20u32 {
        let key = format!("key-{i}");
        let data = test_data_seeded(50 + i as usize * 37, i + 1);
        let writer = &c.live_nodes()[i as usize % 4];
        let owner = writer.put(key.as_bytes(), &data).await.unwrap();
        assert_eq!(owner, c.expected_owner(NodeId::from_data(key.as_bytes())));
        values.push((key, data));
    }

    for node in c.live_nodes() {
        for (key, data) in &values {
            let got = node.get(key.as_bytes()).await.unwrap();
            assert_eq!(got.as_ref(), data.as_slice(), "{key} from {}", node.local());
        }
    }
}

#[tokio::test]
async fn test_multi_page_value_roundtrip() {
    let c = TcpCluster::start(&[0, 128]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let data = test_data(PAGE_SIZE * 10 + 1);
    c.node(0).put(b"big", &data).await.unwrap();
    let got = c.node(128).get(b"big").await.unwrap();
    assert_eq!(got.as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_missing_key_is_not_found() {
    let c = TcpCluster::start(&[0, 128]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let err = c.node(0).get(b"nobody-wrote-this").await.unwrap_err();
    assert!(matches!(err, ChordError::NotFound { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn test_value_is_replicated_to_successors() {
    let c = TcpCluster::start(&[0, 64, 128, 192]).await;
    assert!(c.wait_converged().await, "ring did not converge");

    let key = b"replicated";
    let id = NodeId::from_data(key);
    c.node(0).put(key, b"copy me").await.unwrap();

    let replicas = c.node(64).replicas(key).await.unwrap();
    assert_eq!(replicas.len(), 4);
    assert_eq!(replicas[0], c.expected_owner(id));

    // Sync rounds run every 100ms in the test config.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    for replica in &replicas {
        let node = c.node(replica.id.value());
        assert!(
            node.directory().read().await.entry(id).is_some(),
            "no copy on {replica}"
        );
    }
}
