// ============================================================================
// Partition Map Exchange
// ============================================================================
//
// Drives the cluster through a new topology version on every membership
// change. The partition map itself is never voted on: every node computes
// the same assignment from the same snapshot. The exchange only votes on
// readiness: each node acks the coordinator once it has applied the new
// version, and the coordinator broadcasts the finish when everyone acked.
// A membership change arriving mid-exchange supersedes the pending one, and
// its waiters fail with a retriable error.
//
// ============================================================================

pub mod rebalance;

pub use rebalance::Rebalancer;

use crate::affinity::{AffinityCache, PartitionMap};
use crate::core::{GridError, NodeId, PartitionId, Result, TopologyVersion};
use crate::io::message::{ExchangeAck, MessageBody};
use crate::io::{GridFuture, GridIo};
use crate::store::{PartitionRole, PartitionStore};
use crate::topology::{DiscoveryEvent, FailureReporter, TopologySnapshot};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// Exchange records kept behind the current version for late messages.
const KEPT_RECORDS: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExchangePhase {
    Started,
    ExchangeMessagesSent,
    ExchangeMessagesReceivedFromAll,
    PartitionMapCalculated,
    RebalanceScheduled,
    RebalanceInProgress,
    Ready,
}

impl std::fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExchangePhase::Started => "Started",
            ExchangePhase::ExchangeMessagesSent => "ExchangeMessagesSent",
            ExchangePhase::ExchangeMessagesReceivedFromAll => "ExchangeMessagesReceivedFromAll",
            ExchangePhase::PartitionMapCalculated => "PartitionMapCalculated",
            ExchangePhase::RebalanceScheduled => "RebalanceScheduled",
            ExchangePhase::RebalanceInProgress => "RebalanceInProgress",
            ExchangePhase::Ready => "Ready",
        };
        write!(f, "{}", name)
    }
}

/// What the caller must do after feeding an ack into the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Ignored,
    /// Every live node acked: broadcast the finish to `peers`, then finish
    /// locally.
    AllAcked {
        version: TopologyVersion,
        peers: Vec<NodeId>,
    },
}

#[derive(Debug)]
pub struct ExchangeProgress {
    pub version: TopologyVersion,
    pub outcome: AckOutcome,
}

struct ExchangeRecord {
    snapshot: TopologySnapshot,
    coordinator: NodeId,
    phase: ExchangePhase,
    history: Vec<ExchangePhase>,
    ready: GridFuture<()>,
    acks: HashSet<NodeId>,
    expected: HashSet<NodeId>,
    pending_rebalance: HashSet<PartitionId>,
    superseded: bool,
}

fn advance(record: &mut ExchangeRecord, phase: ExchangePhase) {
    if phase > record.phase {
        record.phase = phase;
        record.history.push(phase);
    }
}

struct ExchangeState {
    snapshot: TopologySnapshot,
    ready_version: TopologyVersion,
    last_map: Option<Arc<PartitionMap>>,
    records: HashMap<TopologyVersion, ExchangeRecord>,
}

pub struct ExchangeManager {
    node_id: NodeId,
    io: Arc<GridIo>,
    affinity: Arc<AffinityCache>,
    store: Arc<PartitionStore>,
    rebalancer: Arc<Rebalancer>,
    reporter: Arc<dyn FailureReporter>,
    ack_timeout: Duration,
    state: Mutex<ExchangeState>,
    exchanges_completed: AtomicU64,
}

impl ExchangeManager {
    pub fn new(
        node_id: impl Into<NodeId>,
        io: Arc<GridIo>,
        affinity: Arc<AffinityCache>,
        store: Arc<PartitionStore>,
        rebalancer: Arc<Rebalancer>,
        reporter: Arc<dyn FailureReporter>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            io,
            affinity,
            store,
            rebalancer,
            reporter,
            ack_timeout,
            state: Mutex::new(ExchangeState {
                snapshot: TopologySnapshot::empty(),
                ready_version: TopologyVersion::ZERO,
                last_map: None,
                records: HashMap::new(),
            }),
            exchanges_completed: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.state.lock().snapshot.clone()
    }

    pub fn current_version(&self) -> TopologyVersion {
        self.state.lock().snapshot.version()
    }

    pub fn ready_version(&self) -> TopologyVersion {
        self.state.lock().ready_version
    }

    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.state
            .lock()
            .snapshot
            .coordinator()
            .map(|n| n.node_id.clone())
    }

    pub fn exchanges_completed(&self) -> u64 {
        self.exchanges_completed.load(Ordering::SeqCst)
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    /// Runs one membership change through the local half of the exchange:
    /// supersede pending versions, install the new map, apply ownership
    /// roles, schedule data movement, ack the coordinator.
    ///
    /// Events must be fed in topology order; the discovery collaborator
    /// delivers them to the coordinator before anyone acks it.
    pub async fn on_discovery_event(
        self: &Arc<Self>,
        event: &DiscoveryEvent,
    ) -> Result<ExchangeProgress> {
        // Apply the change and supersede anything still pending.
        let (version, snapshot, coordinator, prev_map, abandoned) = {
            let mut st = self.state.lock();
            let snapshot = st.snapshot.apply(event)?;
            let version = snapshot.version();
            let coordinator = snapshot
                .coordinator()
                .map(|n| n.node_id.clone())
                .ok_or_else(|| GridError::Internal("topology has no live nodes".to_string()))?;
            let mut abandoned = Vec::new();
            for (v, record) in st.records.iter_mut() {
                if record.phase < ExchangePhase::Ready && !record.superseded {
                    record.superseded = true;
                    abandoned.push((*v, record.ready.clone()));
                }
            }
            let expected: HashSet<NodeId> =
                snapshot.nodes().map(|n| n.node_id.clone()).collect();
            st.records.insert(
                version,
                ExchangeRecord {
                    snapshot: snapshot.clone(),
                    coordinator: coordinator.clone(),
                    phase: ExchangePhase::Started,
                    history: vec![ExchangePhase::Started],
                    ready: GridFuture::new(),
                    acks: HashSet::new(),
                    expected,
                    pending_rebalance: HashSet::new(),
                    superseded: false,
                },
            );
            let floor = version.as_u64().saturating_sub(KEPT_RECORDS);
            st.records.retain(|v, _| v.as_u64() >= floor);
            st.snapshot = snapshot.clone();
            (version, snapshot, coordinator, st.last_map.clone(), abandoned)
        };
        for (stale, fut) in abandoned {
            debug!(
                "'{}' abandons superseded exchange {} for {}",
                self.node_id, stale, version
            );
            fut.fail(GridError::StaleTopology {
                requested: stale,
                current: version,
            });
        }
        event!(
            Level::DEBUG,
            node = %self.node_id,
            version = %version,
            coordinator = %coordinator,
            "exchange started"
        );

        // Same snapshot, same map, on every node.
        let map = self.affinity.install(&snapshot);
        self.apply_roles(&map).await?;
        self.state.lock().last_map = Some(Arc::clone(&map));

        // Local join: confirm this node applied the version.
        let outcome = if coordinator == self.node_id {
            self.record_ack(&self.node_id, version)
        } else {
            let ack = MessageBody::ExchangeAck(ExchangeAck { version });
            if let Err(err) = self.io.send(&coordinator, ack).await {
                warn!(
                    "'{}' could not ack exchange {} to '{}': {}",
                    self.node_id, version, coordinator, err
                );
            }
            AckOutcome::Ignored
        };
        self.with_record(version, |record| {
            advance(record, ExchangePhase::ExchangeMessagesSent)
        });

        // Demand-pull everything this node gained, from previous owners
        // that are still alive.
        let mut scheduled: Vec<(PartitionId, Vec<NodeId>)> = Vec::new();
        if let Some(prev) = prev_map.as_ref() {
            let delta = prev.delta_for(&map, &self.node_id);
            for partition in delta.gained {
                // An empty supplier list still goes through the rebalancer,
                // which marks the partition degraded.
                let suppliers: Vec<NodeId> = prev
                    .owners(partition)
                    .iter()
                    .filter(|n| **n != self.node_id && snapshot.contains(n))
                    .cloned()
                    .collect();
                scheduled.push((partition, suppliers));
            }
        }
        let moving = !scheduled.is_empty();
        self.with_record(version, |record| {
            for (partition, _) in &scheduled {
                record.pending_rebalance.insert(*partition);
            }
            advance(record, ExchangePhase::RebalanceScheduled);
            if moving {
                advance(record, ExchangePhase::RebalanceInProgress);
            }
        });
        for (partition, suppliers) in scheduled {
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                let ok = mgr
                    .rebalancer
                    .demand_partition(partition, version, &suppliers)
                    .await
                    .is_ok();
                mgr.on_partition_rebalanced(version, partition, ok);
            });
        }

        // Only the coordinator enforces the ack deadline.
        if coordinator == self.node_id && snapshot.node_count() > 1 {
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(mgr.ack_timeout).await;
                for node in mgr.missing_acks(version) {
                    warn!(
                        "node '{}' missed the ack deadline for exchange {}",
                        node, version
                    );
                    mgr.reporter.report_failed(&node);
                }
            });
        }

        Ok(ExchangeProgress { version, outcome })
    }

    /// Applies this node's ownership role for every partition of the map.
    async fn apply_roles(&self, map: &PartitionMap) -> Result<()> {
        for partition in 0..map.partitions() {
            let role = if map.is_primary(partition, &self.node_id) {
                PartitionRole::Primary
            } else if map.is_owner(partition, &self.node_id) {
                PartitionRole::Backup
            } else {
                PartitionRole::Unowned
            };
            if role == PartitionRole::Unowned {
                let old = self.store.role(partition).await?;
                if old == PartitionRole::Unowned {
                    // Retained copy from an earlier loss; new owners had a
                    // full exchange to pull it, drop it now.
                    self.store.clear_partition(partition).await?;
                } else {
                    // Keep the data so the new owners can demand it.
                    self.store.set_role(partition, role).await?;
                }
            } else {
                self.store.set_role(partition, role).await?;
            }
        }
        Ok(())
    }

    /// Feeds one `ExchangeAck` into the coordinator's tally.
    pub fn on_exchange_ack(&self, from: &str, version: TopologyVersion) -> AckOutcome {
        self.record_ack(from, version)
    }

    fn record_ack(&self, from: &str, version: TopologyVersion) -> AckOutcome {
        let mut st = self.state.lock();
        let Some(record) = st.records.get_mut(&version) else {
            debug!("ack from '{}' for unknown exchange {}", from, version);
            return AckOutcome::Ignored;
        };
        if record.superseded || record.phase >= ExchangePhase::ExchangeMessagesReceivedFromAll {
            return AckOutcome::Ignored;
        }
        if record.coordinator != self.node_id {
            debug!(
                "'{}' received an ack for {} but '{}' coordinates it",
                self.node_id, version, record.coordinator
            );
            return AckOutcome::Ignored;
        }
        record.acks.insert(from.to_string());
        if !record.acks.is_superset(&record.expected) {
            return AckOutcome::Ignored;
        }
        advance(record, ExchangePhase::ExchangeMessagesReceivedFromAll);
        advance(record, ExchangePhase::PartitionMapCalculated);
        let mut peers: Vec<NodeId> = record
            .expected
            .iter()
            .filter(|n| **n != self.node_id)
            .cloned()
            .collect();
        peers.sort();
        AckOutcome::AllAcked { version, peers }
    }

    /// Marks a version Ready and releases its waiters. Returns the snapshot
    /// when the version newly became ready.
    pub fn finish(&self, version: TopologyVersion) -> Option<TopologySnapshot> {
        let (snapshot, ready) = {
            let mut st = self.state.lock();
            let Some(record) = st.records.get_mut(&version) else {
                warn!("finish for unknown exchange {}", version);
                return None;
            };
            if record.superseded || record.phase >= ExchangePhase::Ready {
                return None;
            }
            advance(record, ExchangePhase::Ready);
            let out = (record.snapshot.clone(), record.ready.clone());
            if version > st.ready_version {
                st.ready_version = version;
            }
            out
        };
        self.exchanges_completed.fetch_add(1, Ordering::SeqCst);
        ready.complete(());
        event!(Level::DEBUG, node = %self.node_id, version = %version, "exchange ready");
        Some(snapshot)
    }

    /// Future that completes when the version is Ready. Versions at or below
    /// the highest ready version complete immediately; superseded or unknown
    /// versions fail with `StaleTopology` so the caller re-routes.
    pub fn await_ready(&self, version: TopologyVersion) -> GridFuture<()> {
        let st = self.state.lock();
        if version <= st.ready_version {
            return GridFuture::completed(());
        }
        match st.records.get(&version) {
            Some(record) if record.superseded => GridFuture::failed(GridError::StaleTopology {
                requested: version,
                current: st.snapshot.version(),
            }),
            Some(record) => record.ready.clone(),
            None => GridFuture::failed(GridError::StaleTopology {
                requested: version,
                current: st.snapshot.version(),
            }),
        }
    }

    pub fn is_ready(&self, version: TopologyVersion) -> bool {
        let st = self.state.lock();
        version <= st.ready_version
    }

    pub fn phase_of(&self, version: TopologyVersion) -> Option<ExchangePhase> {
        self.state.lock().records.get(&version).map(|r| r.phase)
    }

    pub fn phase_history(&self, version: TopologyVersion) -> Vec<ExchangePhase> {
        self.state
            .lock()
            .records
            .get(&version)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Live nodes that have not acked a pending exchange.
    pub fn missing_acks(&self, version: TopologyVersion) -> Vec<NodeId> {
        let st = self.state.lock();
        let Some(record) = st.records.get(&version) else {
            return Vec::new();
        };
        if record.superseded || record.phase >= ExchangePhase::ExchangeMessagesReceivedFromAll {
            return Vec::new();
        }
        let mut missing: Vec<NodeId> = record.expected.difference(&record.acks).cloned().collect();
        missing.sort();
        missing
    }

    fn on_partition_rebalanced(&self, version: TopologyVersion, partition: PartitionId, ok: bool) {
        let mut st = self.state.lock();
        if let Some(record) = st.records.get_mut(&version) {
            record.pending_rebalance.remove(&partition);
            if !ok {
                debug!(
                    "partition {} stays degraded after exchange {}",
                    partition, version
                );
            }
        }
    }

    pub fn pending_rebalance(&self, version: TopologyVersion) -> usize {
        self.state
            .lock()
            .records
            .get(&version)
            .map(|r| r.pending_rebalance.len())
            .unwrap_or(0)
    }

    fn with_record(&self, version: TopologyVersion, f: impl FnOnce(&mut ExchangeRecord)) {
        let mut st = self.state.lock();
        if let Some(record) = st.records.get_mut(&version) {
            f(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LoopbackTransport;
    use crate::topology::NoopFailureReporter;

    fn manager(node: &str) -> Arc<ExchangeManager> {
        let transport = Arc::new(LoopbackTransport::new());
        let io = Arc::new(GridIo::new(node, transport));
        let affinity = Arc::new(AffinityCache::new(8, 1));
        let store = Arc::new(PartitionStore::new(8));
        let rebalancer = Arc::new(Rebalancer::new(
            Arc::clone(&io),
            Arc::clone(&store),
            16,
            Duration::from_millis(200),
        ));
        Arc::new(ExchangeManager::new(
            node,
            io,
            affinity,
            store,
            rebalancer,
            Arc::new(NoopFailureReporter),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn test_single_node_exchange_reaches_ready() {
        let mgr = manager("a");
        let progress = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap();
        let version = progress.version;
        assert_eq!(version, TopologyVersion(1));
        match progress.outcome {
            AckOutcome::AllAcked { peers, .. } => assert!(peers.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(mgr.finish(version).is_some());
        assert!(mgr.is_ready(version));
        assert!(mgr.await_ready(version).is_done());

        let history = mgr.phase_history(version);
        assert_eq!(history.first(), Some(&ExchangePhase::Started));
        assert_eq!(history.last(), Some(&ExchangePhase::Ready));
        let mut sorted = history.clone();
        sorted.sort();
        assert_eq!(history, sorted);
    }

    #[tokio::test]
    async fn test_coordinator_collects_acks_before_finishing() {
        let mgr = manager("a");
        let v1 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap()
            .version;
        mgr.finish(v1);

        // b joins; the coordinator needs both its own ack and b's.
        let progress = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("b".to_string()))
            .await
            .unwrap();
        let v2 = progress.version;
        assert_eq!(progress.outcome, AckOutcome::Ignored);
        assert_eq!(mgr.missing_acks(v2), vec!["b".to_string()]);
        assert!(!mgr.is_ready(v2));

        match mgr.on_exchange_ack("b", v2) {
            AckOutcome::AllAcked { version, peers } => {
                assert_eq!(version, v2);
                assert_eq!(peers, vec!["b".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(mgr.finish(v2).is_some());
        assert!(mgr.is_ready(v2));
    }

    #[tokio::test]
    async fn test_duplicate_ack_does_not_refire() {
        let mgr = manager("a");
        let v1 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap()
            .version;
        mgr.finish(v1);
        let v2 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("b".to_string()))
            .await
            .unwrap()
            .version;
        assert!(matches!(
            mgr.on_exchange_ack("b", v2),
            AckOutcome::AllAcked { .. }
        ));
        assert_eq!(mgr.on_exchange_ack("b", v2), AckOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_new_event_supersedes_pending_exchange() {
        let mgr = manager("a");
        let v1 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap()
            .version;
        mgr.finish(v1);

        // b joins but never acks; its failure supersedes the exchange.
        let v2 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("b".to_string()))
            .await
            .unwrap()
            .version;
        let waiter = mgr.await_ready(v2);
        assert!(!waiter.is_done());

        let progress = mgr
            .on_discovery_event(&DiscoveryEvent::NodeFailed("b".to_string()))
            .await
            .unwrap();
        let v3 = progress.version;

        match waiter.result().unwrap() {
            Err(GridError::StaleTopology { requested, current }) => {
                assert_eq!(requested, v2);
                assert_eq!(current, v3);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The superseded version never becomes ready; the new one does.
        assert!(mgr.finish(v2).is_none());
        assert!(matches!(
            mgr.on_exchange_ack("a", v3),
            AckOutcome::AllAcked { .. } | AckOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn test_await_ready_for_unknown_version_fails_fast() {
        let mgr = manager("a");
        let fut = mgr.await_ready(TopologyVersion(9));
        assert!(matches!(
            fut.result().unwrap(),
            Err(GridError::StaleTopology { .. })
        ));
    }

    #[tokio::test]
    async fn test_roles_follow_the_map_on_single_node() {
        let mgr = manager("a");
        let v1 = mgr
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap()
            .version;
        mgr.finish(v1);
        for partition in 0..8 {
            assert_eq!(
                mgr.store.role(partition).await.unwrap(),
                PartitionRole::Primary
            );
        }
    }
}
