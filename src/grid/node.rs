// ============================================================================
// Grid Node
// ============================================================================
//
// Wires one node's subsystems together and dispatches its inbound traffic.
// Replies and apply-class messages are handled inline on the link task so
// their per-link order is preserved; request handlers that may wait (on
// locks, on readiness, on other nodes) run on their own tasks so a stalled
// transaction cannot stall the link.
//
// ============================================================================

use super::config::GridConfig;
use super::stats::GridStats;
use crate::affinity::AffinityCache;
use crate::core::{GridError, NodeId, Result, TopologyVersion, Value, VersionClock};
use crate::exchange::{AckOutcome, ExchangeManager, Rebalancer};
use crate::io::message::{
    ExchangeFinished, GetRequest, GetResponse, PartitionSupplyChunk, PartitionSupplyRequest,
};
use crate::io::{CacheMessage, ClusterTransport, GridIo, MessageBody, MessageHandler};
use crate::store::{LockTable, LruEvictionPolicy, PartitionStore};
use crate::topology::{DiscoveryEvent, FailureReporter};
use crate::tx::{IsolationLevel, TxId, TxManager, TxMode};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{event, Level};

pub struct GridNode {
    node_id: NodeId,
    config: GridConfig,
    io: Arc<GridIo>,
    store: Arc<PartitionStore>,
    locks: Arc<LockTable>,
    affinity: Arc<AffinityCache>,
    clock: Arc<VersionClock>,
    exchange: Arc<ExchangeManager>,
    tx: Arc<TxManager>,
    self_ref: Weak<GridNode>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl GridNode {
    pub fn new(
        node_id: impl Into<NodeId>,
        config: GridConfig,
        transport: Arc<dyn ClusterTransport>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(GridError::InvalidConfig(
                "node_id must not be empty".to_string(),
            ));
        }

        let io = Arc::new(GridIo::new(node_id.clone(), transport));
        let affinity = Arc::new(AffinityCache::new(config.partitions, config.backups));
        let mut store = PartitionStore::new(config.partitions);
        if let Some(capacity) = config.eviction_capacity {
            store = store.with_eviction(Arc::new(LruEvictionPolicy::new(capacity)));
        }
        let store = Arc::new(store);
        let locks = Arc::new(LockTable::new());
        // The real node order is learned from the first completed exchange.
        let clock = Arc::new(VersionClock::new(0));
        let rebalancer = Arc::new(Rebalancer::new(
            Arc::clone(&io),
            Arc::clone(&store),
            config.rebalance_batch,
            config.lock_timeout,
        ));
        let exchange = Arc::new(ExchangeManager::new(
            node_id.clone(),
            Arc::clone(&io),
            Arc::clone(&affinity),
            Arc::clone(&store),
            rebalancer,
            reporter,
            config.exchange_ack_timeout,
        ));
        let tx = Arc::new(TxManager::new(
            node_id.clone(),
            Arc::clone(&io),
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&affinity),
            Arc::clone(&exchange),
            Arc::clone(&clock),
            config.tx_timeout,
            config.lock_timeout,
        ));

        Ok(Arc::new_cyclic(|weak| Self {
            node_id,
            config,
            io,
            store,
            locks,
            affinity,
            clock,
            exchange,
            tx,
            self_ref: weak.clone(),
            maintenance: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<ExchangeManager> {
        &self.exchange
    }

    pub fn affinity(&self) -> &Arc<AffinityCache> {
        &self.affinity
    }

    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    pub fn transactions(&self) -> &Arc<TxManager> {
        &self.tx
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts the background sweep for expired entries, capacity overruns
    /// and timed-out transactions.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.maintenance_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(node) = weak.upgrade() else { break };
                if node.is_stopped() {
                    break;
                }
                node.maintenance_pass().await;
            }
        });
        *self.maintenance.lock() = Some(handle);
        event!(Level::INFO, node = %self.node_id, "node started");
    }

    /// Stops the node. In-flight requests waiting on remote replies fail
    /// with `NodeStopped` instead of hanging.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.io.shutdown();
        event!(Level::INFO, node = %self.node_id, "node stopped");
    }

    pub async fn maintenance_pass(&self) {
        if let Err(err) = self.store.sweep_expired().await {
            warn!("'{}' expiry sweep failed: {}", self.node_id, err);
        }
        if let Err(err) = self.store.enforce_capacity().await {
            warn!("'{}' capacity enforcement failed: {}", self.node_id, err);
        }
        self.tx.expire_timed_out().await;
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Feeds one membership change into the local exchange. When this node
    /// coordinates the new version and every expected ack is already in
    /// (single-node clusters), the finish is driven immediately.
    pub async fn on_discovery(&self, event: &DiscoveryEvent) -> Result<TopologyVersion> {
        let progress = self.exchange.on_discovery_event(event).await?;
        if let AckOutcome::AllAcked { version, peers } = progress.outcome {
            self.broadcast_finish(version, &peers).await;
            self.complete_exchange(version);
        }
        Ok(progress.version)
    }

    async fn broadcast_finish(&self, version: TopologyVersion, peers: &[NodeId]) {
        for peer in peers {
            let body = MessageBody::ExchangeFinished(ExchangeFinished { version });
            if let Err(err) = self.io.send(peer, body).await {
                warn!(
                    "'{}' could not deliver exchange finish {} to '{}': {}",
                    self.node_id, version, peer, err
                );
            }
        }
    }

    /// Marks the version ready, adopts this node's join order for version
    /// stamps and lets the transaction layer drop staging whose coordinator
    /// is gone.
    fn complete_exchange(&self, version: TopologyVersion) {
        let Some(snapshot) = self.exchange.finish(version) else {
            return;
        };
        if let Some(order) = snapshot.node_order(&self.node_id) {
            self.clock.set_node_order(order);
        }
        self.tx.on_topology_ready(&snapshot);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&self, mode: TxMode, isolation: IsolationLevel) -> TxId {
        self.tx.begin(mode, isolation)
    }

    pub async fn tx_read(&self, tx: TxId, key: &str) -> Result<Option<Value>> {
        self.tx.read(tx, key).await
    }

    pub async fn tx_write(&self, tx: TxId, key: &str, value: Value) -> Result<()> {
        self.tx.write(tx, key, value, self.config.ttl_default).await
    }

    pub async fn tx_write_with_ttl(
        &self,
        tx: TxId,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<()> {
        self.tx.write(tx, key, value, Some(ttl)).await
    }

    pub async fn tx_remove(&self, tx: TxId, key: &str) -> Result<()> {
        self.tx.remove(tx, key).await
    }

    pub async fn commit(&self, tx: TxId) -> Result<()> {
        self.tx.commit(tx).await
    }

    pub async fn rollback(&self, tx: TxId) -> Result<()> {
        self.tx.rollback(tx).await
    }

    // ------------------------------------------------------------------
    // Single-key operations
    // ------------------------------------------------------------------
    //
    // Each runs as a one-shot transaction. Topology races surface inside as
    // retriable errors and are retried here against the fresh mapping, up to
    // the configured bound.

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_retries(|tx| async move { self.tx.read(tx, key).await })
            .await
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        let ttl = self.config.ttl_default;
        self.with_retries(|tx| {
            let value = value.clone();
            async move { self.tx.write(tx, key, value, ttl).await }
        })
        .await
    }

    pub async fn put_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.with_retries(|tx| {
            let value = value.clone();
            async move { self.tx.write(tx, key, value, Some(ttl)).await }
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.with_retries(|tx| async move { self.tx.remove(tx, key).await })
            .await
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(TxId) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let tx = self
                .tx
                .begin(TxMode::Pessimistic, IsolationLevel::ReadCommitted);
            let outcome = match op(tx).await {
                Ok(value) => self.tx.commit(tx).await.map(|_| value),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.config.topology_retries => {
                    debug!(
                        "'{}' retrying single-key operation after {} (attempt {})",
                        self.node_id,
                        err,
                        attempt + 1
                    );
                    self.tx.rollback(tx).await?;
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(err) => {
                    self.tx.rollback(tx).await?;
                    return Err(err);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    /// Folds every version stamp travelling in the message into the local
    /// clock, keeping issued versions ahead of everything witnessed.
    fn observe_versions(&self, body: &MessageBody) {
        match body {
            MessageBody::Prepared(resp) => self.clock.observe(resp.high_version),
            MessageBody::Finish(req) => {
                if let Some(version) = req.commit_version {
                    self.clock.observe(version);
                }
            }
            MessageBody::GetResponse(resp) => {
                if let Some(version) = resp.version {
                    self.clock.observe(version);
                }
            }
            MessageBody::BackupApply(apply) => {
                for entry in &apply.entries {
                    self.clock.observe(entry.version);
                }
            }
            MessageBody::SupplyChunk(chunk) => {
                for entry in &chunk.entries {
                    self.clock.observe(entry.version);
                }
            }
            _ => {}
        }
    }

    async fn apply_inline(&self, message: CacheMessage) {
        match message.body {
            MessageBody::BackupApply(apply) => {
                let partition = apply.partition;
                for entry in apply.entries {
                    if let Err(err) = self.store.apply_replicated(partition, entry).await {
                        warn!(
                            "'{}' backup apply on partition {} failed: {}",
                            self.node_id, partition, err
                        );
                    }
                }
            }
            MessageBody::ExchangeAck(ack) => {
                let outcome = self.exchange.on_exchange_ack(&message.from, ack.version);
                if let AckOutcome::AllAcked { version, peers } = outcome {
                    self.broadcast_finish(version, &peers).await;
                    self.complete_exchange(version);
                }
            }
            MessageBody::ExchangeFinished(finished) => {
                self.complete_exchange(finished.version);
            }
            other => {
                debug!(
                    "'{}' dropping unexpected inline {} from '{}'",
                    self.node_id,
                    other.kind(),
                    message.from
                );
            }
        }
    }

    async fn process_request(&self, message: CacheMessage) {
        let from = message.from;
        let id = message.id;
        let outcome: Result<MessageBody> = match message.body {
            MessageBody::Prepare(req) => {
                self.tx.handle_prepare(req).await.map(MessageBody::Prepared)
            }
            MessageBody::Finish(req) => {
                self.tx.handle_finish(req).await.map(MessageBody::FinishAck)
            }
            MessageBody::LockRequest(req) => {
                self.tx.handle_lock(req).await.map(MessageBody::LockResponse)
            }
            MessageBody::Get(req) => self.handle_get(req).await.map(MessageBody::GetResponse),
            MessageBody::SupplyRequest(req) => {
                self.handle_supply(req).await.map(MessageBody::SupplyChunk)
            }
            other => {
                debug!(
                    "'{}' ignoring {} request from '{}'",
                    self.node_id,
                    other.kind(),
                    from
                );
                return;
            }
        };
        let body = match outcome {
            Ok(body) => body,
            Err(err) => MessageBody::Failure(err),
        };
        if let Err(err) = self.io.respond(&from, id, body).await {
            warn!("'{}' reply to '{}' not delivered: {}", self.node_id, from, err);
        }
    }

    /// Read served by the primary owner under the requested topology.
    async fn handle_get(&self, req: GetRequest) -> Result<GetResponse> {
        let ready = self.exchange.await_ready(req.topology);
        tokio::time::timeout(self.config.lock_timeout, ready)
            .await
            .map_err(|_| GridError::StaleTopology {
                requested: req.topology,
                current: self.exchange.ready_version(),
            })??;
        let map = self.affinity.map_for(req.topology)?;
        if !map.is_primary(req.partition, &self.node_id) {
            return Err(GridError::RetryTopologyChange {
                partition: req.partition,
            });
        }
        let (value, version) = self.store.get(req.partition, &req.key).await?;
        Ok(GetResponse { value, version })
    }

    /// One supply batch for a rebalancing demander.
    async fn handle_supply(&self, req: PartitionSupplyRequest) -> Result<PartitionSupplyChunk> {
        let (entries, next_index, last) = self
            .store
            .supply_batch(req.partition, req.from_index, self.config.rebalance_batch)
            .await?;
        Ok(PartitionSupplyChunk {
            partition: req.partition,
            topology: req.topology,
            entries,
            next_index,
            last,
        })
    }

    pub fn stats(&self) -> GridStats {
        GridStats {
            node_id: self.node_id.clone(),
            topology: self.exchange.current_version(),
            ready_topology: self.exchange.ready_version(),
            resident_entries: self.store.resident_entries(),
            active_transactions: self.tx.active_transactions(),
            staged_participants: self.tx.staged_participants(),
            held_locks: self.locks.held_total(),
            transactions: self.tx.stats(),
            exchanges_completed: self.exchange.exchanges_completed(),
            entries_pulled: self.exchange.rebalancer().entries_pulled(),
            degraded_partitions: self.exchange.rebalancer().degraded_partitions(),
        }
    }
}

#[async_trait]
impl MessageHandler for GridNode {
    async fn on_message(&self, message: CacheMessage) {
        if self.is_stopped() {
            debug!(
                "'{}' is stopped, dropping {} from '{}'",
                self.node_id,
                message.body.kind(),
                message.from
            );
            return;
        }
        self.observe_versions(&message.body);
        if message.is_reply() {
            self.io.complete_response(message);
            return;
        }
        if message.body.is_apply_class() {
            self.apply_inline(message).await;
            return;
        }
        let Some(node) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            node.process_request(message).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LoopbackTransport;
    use crate::topology::NoopFailureReporter;
    use serde_json::json;

    fn test_config() -> GridConfig {
        GridConfig::new(8, 0)
            .tx_timeout(Duration::from_secs(2))
            .lock_timeout(Duration::from_millis(200))
            .retry_backoff(Duration::from_millis(5))
    }

    async fn started_node(id: &str) -> (Arc<GridNode>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let node = GridNode::new(
            id,
            test_config(),
            Arc::clone(&transport) as Arc<dyn ClusterTransport>,
            Arc::new(NoopFailureReporter),
        )
        .unwrap();
        transport.register_peer(id, node.clone()).unwrap();
        node.start();
        node.on_discovery(&DiscoveryEvent::NodeJoined(id.to_string()))
            .await
            .unwrap();
        (node, transport)
    }

    #[tokio::test]
    async fn test_single_node_put_get_remove() {
        let (node, _transport) = started_node("a").await;

        node.put("answer", json!(42)).await.unwrap();
        assert_eq!(node.get("answer").await.unwrap(), Some(json!(42)));

        node.remove("answer").await.unwrap();
        assert_eq!(node.get("answer").await.unwrap(), None);
        node.stop();
    }

    #[tokio::test]
    async fn test_explicit_transaction_roundtrip() {
        let (node, _transport) = started_node("a").await;

        let tx = node.begin(TxMode::Pessimistic, IsolationLevel::Serializable);
        node.tx_write(tx, "k1", json!("v1")).await.unwrap();
        node.tx_write(tx, "k2", json!("v2")).await.unwrap();
        assert_eq!(node.tx_read(tx, "k1").await.unwrap(), Some(json!("v1")));
        node.commit(tx).await.unwrap();

        assert_eq!(node.get("k1").await.unwrap(), Some(json!("v1")));
        assert_eq!(node.get("k2").await.unwrap(), Some(json!("v2")));
        node.stop();
    }

    #[tokio::test]
    async fn test_rolled_back_writes_never_land() {
        let (node, _transport) = started_node("a").await;

        let tx = node.begin(TxMode::Pessimistic, IsolationLevel::ReadCommitted);
        node.tx_write(tx, "ghost", json!(1)).await.unwrap();
        node.rollback(tx).await.unwrap();

        assert_eq!(node.get("ghost").await.unwrap(), None);
        node.stop();
    }

    #[tokio::test]
    async fn test_operations_before_join_are_rejected() {
        let transport = Arc::new(LoopbackTransport::new());
        let node = GridNode::new(
            "a",
            test_config(),
            Arc::clone(&transport) as Arc<dyn ClusterTransport>,
            Arc::new(NoopFailureReporter),
        )
        .unwrap();
        transport.register_peer("a", node.clone()).unwrap();

        let err = node.get("k").await.unwrap_err();
        assert!(matches!(err, GridError::StaleTopology { .. }));
    }

    #[tokio::test]
    async fn test_stats_reflect_activity() {
        let (node, _transport) = started_node("a").await;

        node.put("k", json!(1)).await.unwrap();
        let stats = node.stats();
        assert_eq!(stats.node_id, "a");
        assert_eq!(stats.resident_entries, 1);
        assert_eq!(stats.active_transactions, 0);
        assert!(stats.transactions.committed >= 1);
        assert_eq!(stats.exchanges_completed, 1);
        node.stop();
    }
}
