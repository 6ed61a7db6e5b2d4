/// Eviction and expiry tests
///
/// Entry lifetime on a running node: per-write and default time-to-live,
/// the background sweep that reclaims expired entries, and LRU capacity
/// enforcement.
/// Run with: cargo test --test eviction_tests

use gridmemdb::{GridConfig, LocalGrid};
use serde_json::json;
use std::time::Duration;

fn test_config() -> GridConfig {
    GridConfig::new(8, 0)
        .exchange_ack_timeout(Duration::from_secs(2))
        .maintenance_interval(Duration::from_millis(100))
}

#[tokio::test]
async fn test_ttl_expires_on_read() {
    // A sweep interval far beyond the test keeps expiry a pure read-path
    // concern here.
    let config = test_config().maintenance_interval(Duration::from_secs(30));
    let grid = LocalGrid::new(config).unwrap();
    let node = grid.start_node("a").await.unwrap();

    node.put_with_ttl("fleeting", json!("soon gone"), Duration::from_millis(80))
        .await
        .unwrap();
    node.put("durable", json!("stays")).await.unwrap();
    assert_eq!(
        node.get("fleeting").await.unwrap(),
        Some(json!("soon gone"))
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node.get("fleeting").await.unwrap(), None);
    assert_eq!(node.get("durable").await.unwrap(), Some(json!("stays")));
    // The read only hides the entry; reclaiming it is the sweep's job.
    assert_eq!(node.store().resident_entries(), 2);
    grid.shutdown();
}

#[tokio::test]
async fn test_sweep_reclaims_expired_entries() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let node = grid.start_node("a").await.unwrap();

    for i in 0..10 {
        node.put_with_ttl(&format!("tmp-{i}"), json!(i), Duration::from_millis(80))
            .await
            .unwrap();
    }
    assert_eq!(node.store().resident_entries(), 10);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while node.store().resident_entries() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sweep left {} expired entries resident",
            node.store().resident_entries()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    grid.shutdown();
}

#[tokio::test]
async fn test_capacity_eviction_keeps_resident_under_limit() {
    let config = test_config().eviction_capacity(12);
    let grid = LocalGrid::new(config).unwrap();
    let node = grid.start_node("a").await.unwrap();

    for i in 0..40 {
        node.put(&format!("bulk-{i}"), json!(i)).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while node.store().resident_entries() > 12 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "eviction left {} entries over a capacity of 12",
            node.store().resident_entries()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Evicted keys read as absent; survivors keep their values.
    let mut present = 0;
    for i in 0..40 {
        if let Some(value) = node.get(&format!("bulk-{i}")).await.unwrap() {
            assert_eq!(value, json!(i));
            present += 1;
        }
    }
    assert_eq!(present, node.store().resident_entries());
    grid.shutdown();
}

#[tokio::test]
async fn test_default_ttl_applies_to_plain_writes() {
    let config = test_config().ttl_default(Duration::from_millis(80));
    let grid = LocalGrid::new(config).unwrap();
    let node = grid.start_node("a").await.unwrap();

    node.put("implicit", json!("short-lived")).await.unwrap();
    node.put_with_ttl("explicit", json!("long-lived"), Duration::from_secs(30))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node.get("implicit").await.unwrap(), None);
    assert_eq!(
        node.get("explicit").await.unwrap(),
        Some(json!("long-lived"))
    );
    grid.shutdown();
}
