/// Partition exchange tests
///
/// Membership changes drive every node through the same sequence of
/// topology versions, and an unresponsive node is failed out rather than
/// wedging the exchange forever.
/// Run with: cargo test --test exchange_tests

use gridmemdb::{GridConfig, LocalGrid, TopologyVersion};
use serde_json::json;
use std::time::Duration;

fn test_config() -> GridConfig {
    GridConfig::new(16, 1)
        .tx_timeout(Duration::from_secs(2))
        .lock_timeout(Duration::from_millis(500))
        .exchange_ack_timeout(Duration::from_secs(2))
        .retry_backoff(Duration::from_millis(5))
}

#[tokio::test]
async fn test_topology_advances_once_per_membership_change() {
    let grid = LocalGrid::new(test_config()).unwrap();

    let a = grid.start_node("a").await.unwrap();
    assert_eq!(a.stats().topology, TopologyVersion(1));

    grid.start_node("b").await.unwrap();
    grid.start_node("c").await.unwrap();
    for stats in grid.stats() {
        assert_eq!(stats.topology, TopologyVersion(3));
        assert!(stats.is_ready(), "{} not ready after joins", stats.node_id);
    }

    grid.stop_node("b").await.unwrap();
    for stats in grid.stats() {
        assert_eq!(stats.topology, TopologyVersion(4));
        assert!(stats.is_ready(), "{} not ready after leave", stats.node_id);
    }
    grid.shutdown();
}

#[tokio::test]
async fn test_coordinator_is_oldest_live_node() {
    let grid = LocalGrid::new(test_config()).unwrap();
    grid.start_node("a").await.unwrap();
    grid.start_node("b").await.unwrap();
    grid.start_node("c").await.unwrap();

    for node in grid.nodes() {
        assert_eq!(node.exchange().coordinator_id().as_deref(), Some("a"));
    }

    grid.stop_node("a").await.unwrap();
    for node in grid.nodes() {
        assert_eq!(node.exchange().coordinator_id().as_deref(), Some("b"));
    }
    grid.shutdown();
}

#[tokio::test]
async fn test_data_survives_the_coordinator_leaving() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let a = grid.start_node("a").await.unwrap();
    let b = grid.start_node("b").await.unwrap();
    grid.start_node("c").await.unwrap();

    for i in 0..24 {
        a.put(&format!("key-{i}"), json!(i)).await.unwrap();
    }
    grid.stop_node("a").await.unwrap();
    grid.quiesce(Duration::from_secs(3)).await.unwrap();

    for i in 0..24 {
        assert_eq!(
            b.get(&format!("key-{i}")).await.unwrap(),
            Some(json!(i)),
            "key-{i} lost when the coordinator left"
        );
    }
    grid.shutdown();
}

#[tokio::test]
async fn test_unresponsive_node_is_declared_failed() {
    let config = test_config().exchange_ack_timeout(Duration::from_millis(300));
    let grid = LocalGrid::new(config).unwrap();
    let a = grid.start_node("a").await.unwrap();
    grid.start_node("b").await.unwrap();
    grid.start_node("c").await.unwrap();

    for i in 0..20 {
        a.put(&format!("key-{i}"), json!(i)).await.unwrap();
    }

    // c stops talking to everyone; its ack for the next exchange never
    // arrives and the coordinator's deadline declares it failed.
    let transport = grid.transport().clone();
    for peer in ["a", "b", "d"] {
        transport.sever("c", peer);
        transport.sever(peer, "c");
    }
    let join = grid.start_node("d").await;
    assert!(
        join.is_err(),
        "join exchange should be superseded by the failure cascade"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = grid.stats();
        let converged = grid.node_count() == 3
            && grid.node("c").is_none()
            && stats
                .iter()
                .all(|s| s.is_ready() && s.topology == TopologyVersion(5));
        if converged {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster did not converge after the failure: {:?}",
            stats.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    grid.quiesce(Duration::from_secs(5)).await.unwrap();

    let d = grid.node("d").unwrap();
    for i in 0..20 {
        assert_eq!(
            d.get(&format!("key-{i}")).await.unwrap(),
            Some(json!(i)),
            "key-{i} lost in the failure cascade"
        );
    }
    grid.shutdown();
}
