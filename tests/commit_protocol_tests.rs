/// Commit protocol tests
///
/// Two-phase commit edges: replayed finishes, prepare rejection, and the
/// owner-set check when the topology moves between prepare and finish.
/// Run with: cargo test --test commit_protocol_tests

use gridmemdb::affinity::{partition_for_key, PartitionMap};
use gridmemdb::io::message::{FinishRequest, PrepareRequest, TxWrite};
use gridmemdb::topology::{DiscoveryEvent, TopologySnapshot};
use gridmemdb::tx::TxId;
use gridmemdb::{CacheVersion, GridConfig, GridError, IsolationLevel, LocalGrid, TxMode};
use serde_json::json;
use std::time::Duration;

const PARTITIONS: u32 = 16;

fn test_config() -> GridConfig {
    GridConfig::new(PARTITIONS, 1)
        .tx_timeout(Duration::from_secs(5))
        .lock_timeout(Duration::from_millis(500))
        .exchange_ack_timeout(Duration::from_secs(2))
        .retry_backoff(Duration::from_millis(5))
}

fn snapshot_of(ids: &[&str]) -> TopologySnapshot {
    let mut snap = TopologySnapshot::empty();
    for id in ids {
        snap = snap
            .apply(&DiscoveryEvent::NodeJoined(id.to_string()))
            .unwrap();
    }
    snap
}

#[tokio::test]
async fn test_replayed_commit_finish_is_a_noop() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let node = grid.start_node("a").await.unwrap();

    let tx = TxId::new();
    let topology = node.exchange().current_version();
    let prepare = PrepareRequest {
        tx,
        near_node: "a".to_string(),
        topology,
        mode: TxMode::Optimistic,
        writes: vec![TxWrite {
            partition: partition_for_key("idem", PARTITIONS),
            key: "idem".to_string(),
            value: Some(json!(41)),
            expires_at: None,
        }],
        reads: vec![],
    };
    let prepared = node.transactions().handle_prepare(prepare).await.unwrap();

    let commit_version = CacheVersion::new(
        topology,
        prepared.high_version.counter + 1,
        prepared.high_version.node_order,
    );
    let finish = FinishRequest {
        tx,
        commit: true,
        commit_version: Some(commit_version),
        topology,
    };
    node.transactions().handle_finish(finish.clone()).await.unwrap();
    assert_eq!(node.get("idem").await.unwrap(), Some(json!(41)));

    // The retry finds the outcome in the completed table and re-acks.
    node.transactions().handle_finish(finish).await.unwrap();
    assert_eq!(node.get("idem").await.unwrap(), Some(json!(41)));
    assert_eq!(node.transactions().staged_participants(), 0);
    grid.shutdown();
}

#[tokio::test]
async fn test_finish_for_an_unknown_transaction() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let node = grid.start_node("a").await.unwrap();
    let topology = node.exchange().current_version();

    // A rollback for a transaction this node never staged is harmless.
    let rollback = FinishRequest {
        tx: TxId::new(),
        commit: false,
        commit_version: None,
        topology,
    };
    node.transactions().handle_finish(rollback).await.unwrap();

    // A commit for one is a protocol error.
    let commit = FinishRequest {
        tx: TxId::new(),
        commit: true,
        commit_version: Some(CacheVersion::new(topology, 1, 0)),
        topology,
    };
    let err = node.transactions().handle_finish(commit).await.unwrap_err();
    assert!(matches!(err, GridError::TransactionNotFound(_)));
    grid.shutdown();
}

#[tokio::test]
async fn test_rejected_prepare_leaves_nothing_staged() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let a = grid.start_node("a").await.unwrap();
    let b = grid.start_node("b").await.unwrap();

    let holder = a.begin(TxMode::Pessimistic, IsolationLevel::Serializable);
    a.tx_write(holder, "blocked", json!("first")).await.unwrap();

    // The optimistic commit cannot take its commit lock while the
    // pessimistic holder is alive; that is a conflict, not a wait.
    let loser = b.begin(TxMode::Optimistic, IsolationLevel::Serializable);
    b.tx_write(loser, "blocked", json!("second")).await.unwrap();
    let err = b.commit(loser).await.unwrap_err();
    assert!(
        matches!(err, GridError::OptimisticConflict { .. }),
        "expected a conflict, got {err}"
    );

    a.commit(holder).await.unwrap();
    assert_eq!(b.get("blocked").await.unwrap(), Some(json!("first")));
    for node in grid.nodes() {
        assert_eq!(node.transactions().staged_participants(), 0);
    }
    grid.shutdown();
}

#[tokio::test]
async fn test_commit_against_a_moved_partition_aborts_cleanly() {
    let grid = LocalGrid::new(test_config()).unwrap();
    let a = grid.start_node("a").await.unwrap();
    grid.start_node("b").await.unwrap();

    // Open one pinned transaction per key before the membership change.
    let mut open = Vec::new();
    for i in 0..32 {
        let key = format!("pin-{i}");
        let tx = a.begin(TxMode::Pessimistic, IsolationLevel::Serializable);
        a.tx_write(tx, &key, json!(i)).await.unwrap();
        open.push((tx, key));
    }

    grid.start_node("c").await.unwrap();
    grid.quiesce(Duration::from_secs(3)).await.unwrap();

    // The owner-set check compares the pinned map against the current one;
    // both are pure functions of the membership snapshots.
    let before = PartitionMap::calculate(&snapshot_of(&["a", "b"]), PARTITIONS, 1);
    let after = PartitionMap::calculate(&snapshot_of(&["a", "b", "c"]), PARTITIONS, 1);

    let mut aborted = 0;
    for (tx, key) in open {
        let partition = partition_for_key(&key, PARTITIONS);
        let moved = before.owners(partition) != after.owners(partition);
        let result = a.commit(tx).await;
        if moved {
            let err = result.unwrap_err();
            assert!(
                matches!(err, GridError::RetryTopologyChange { partition: p } if p == partition),
                "pinned commit of {key} should abort, got {err}"
            );
            aborted += 1;
            for node in grid.nodes() {
                assert_eq!(
                    node.get(&key).await.unwrap(),
                    None,
                    "{key} partially committed after abort"
                );
            }
        } else {
            result.unwrap();
            assert_eq!(a.get(&key).await.unwrap(), Some(json!(pinned_value(&key))));
        }
    }
    assert!(aborted > 0, "the join moved no partition used by the test");
    grid.shutdown();
}

fn pinned_value(key: &str) -> i64 {
    key.trim_start_matches("pin-").parse().unwrap()
}
