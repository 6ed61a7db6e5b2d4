// ============================================================================
// Distributed Transaction Manager
// ============================================================================
//
// Runs both halves of the commit protocol. The near half drives a
// transaction begun on this node: it pins the topology at first access,
// stages writes locally, acquires pessimistic locks at first access, and at
// commit time runs two-phase commit against every participant primary. The
// participant half answers Prepare/Finish/Lock requests for transactions
// coordinated elsewhere, staging writes until the finish arrives.
//
// Prepare and Finish are idempotent per transaction id; finished outcomes
// are kept in a bounded table so replays are answered instead of reapplied.
// Finish is retried, never reversed: once the commit version is chosen the
// transaction only moves forward.
//
// ============================================================================

use super::state::{IsolationLevel, TxId, TxMode, TxState};
use crate::affinity::AffinityCache;
use crate::core::{
    CacheVersion, GridError, Key, NodeId, PartitionId, Result, TopologyVersion, Value, VersionClock,
};
use crate::exchange::ExchangeManager;
use crate::io::message::{
    BackupApply, FinishRequest, FinishResponse, GetRequest, LockRequest, LockResponse,
    PrepareRequest, PrepareResponse, TxRead, TxWrite,
};
use crate::io::{GridIo, MessageBody};
use crate::store::{lock_rank, LockTable, PartitionStore, ReplicatedEntry};
use crate::topology::TopologySnapshot;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Finish rounds attempted before a commit is reported as partial.
const FINISH_ATTEMPTS: usize = 3;

/// Finished transaction outcomes kept for deduplicating replayed
/// prepare/finish messages.
const COMPLETED_CAPACITY: usize = 1024;

/// Staged participant state older than this multiple of the transaction
/// timeout is dropped by the maintenance sweep.
const STALE_STAGING_FACTOR: u32 = 2;

/// A transaction coordinated by this node.
struct NearTx {
    mode: TxMode,
    isolation: IsolationLevel,
    state: TxState,
    /// Pinned at first read or write, after that exchange is ready.
    topology: Option<TopologyVersion>,
    /// Staged writes, last write per key wins.
    writes: HashMap<Key, TxWrite>,
    /// Serializable reads: validation set (optimistic) or lock manifest
    /// (pessimistic).
    reads: Vec<TxRead>,
    read_keys: HashSet<Key>,
    /// Keys this transaction has requested locks for, including requests
    /// that may still be in flight on the primary.
    locked: HashSet<(PartitionId, Key)>,
    deadline: Instant,
}

/// Writes staged here on behalf of a transaction coordinated elsewhere.
#[derive(Clone)]
struct ParticipantTx {
    near_node: NodeId,
    writes: Vec<TxWrite>,
    staged_at: Instant,
}

#[derive(Default)]
struct CompletedTable {
    outcomes: HashMap<TxId, bool>,
    order: VecDeque<TxId>,
}

impl CompletedTable {
    fn record(&mut self, tx: TxId, committed: bool) {
        if self.outcomes.insert(tx, committed).is_none() {
            self.order.push_back(tx);
            while self.order.len() > COMPLETED_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.outcomes.remove(&evicted);
                }
            }
        }
    }

    fn outcome(&self, tx: TxId) -> Option<bool> {
        self.outcomes.get(&tx).copied()
    }
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub conflicts: u64,
    pub lock_timeouts: u64,
}

/// Everything the commit driver needs, captured when the transaction enters
/// `Preparing` so the table lock is not held across the protocol.
struct CommitPlan {
    mode: TxMode,
    isolation: IsolationLevel,
    topology: Option<TopologyVersion>,
    writes: Vec<TxWrite>,
    reads: Vec<TxRead>,
    deadline: Instant,
}

pub struct TxManager {
    node_id: NodeId,
    io: Arc<GridIo>,
    store: Arc<PartitionStore>,
    locks: Arc<LockTable>,
    affinity: Arc<AffinityCache>,
    exchange: Arc<ExchangeManager>,
    clock: Arc<VersionClock>,
    tx_timeout: Duration,
    lock_timeout: Duration,
    transactions: Mutex<HashMap<TxId, NearTx>>,
    participants: Mutex<HashMap<TxId, ParticipantTx>>,
    completed: Mutex<CompletedTable>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    conflicts: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl TxManager {
    pub fn new(
        node_id: impl Into<NodeId>,
        io: Arc<GridIo>,
        store: Arc<PartitionStore>,
        locks: Arc<LockTable>,
        affinity: Arc<AffinityCache>,
        exchange: Arc<ExchangeManager>,
        clock: Arc<VersionClock>,
        tx_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            io,
            store,
            locks,
            affinity,
            exchange,
            clock,
            tx_timeout,
            lock_timeout,
            transactions: Mutex::new(HashMap::new()),
            participants: Mutex::new(HashMap::new()),
            completed: Mutex::new(CompletedTable::default()),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Near side
    // ------------------------------------------------------------------

    pub fn begin(&self, mode: TxMode, isolation: IsolationLevel) -> TxId {
        let id = TxId::new();
        let near = NearTx {
            mode,
            isolation,
            state: TxState::Active,
            topology: None,
            writes: HashMap::new(),
            reads: Vec::new(),
            read_keys: HashSet::new(),
            locked: HashSet::new(),
            deadline: Instant::now() + self.tx_timeout,
        };
        self.transactions.lock().insert(id, near);
        self.begun.fetch_add(1, Ordering::SeqCst);
        debug!("{} began ({}, {})", id, mode, isolation);
        id
    }

    /// Reads a key within the transaction. Staged writes shadow the store;
    /// serializable pessimistic reads lock the key first; serializable reads
    /// of either mode are recorded for the prepare phase.
    pub async fn read(&self, tx: TxId, key: &str) -> Result<Option<Value>> {
        let staged = self.with_active(tx, |near| Ok(near.writes.get(key).map(|w| w.value.clone())))?;
        if let Some(value) = staged {
            return Ok(value);
        }

        let topology = self.pin_topology(tx).await?;
        let map = self.affinity.map_for(topology)?;
        let partition = self.affinity.partition_for_key(key);
        let primary = map
            .primary(partition)
            .cloned()
            .ok_or(GridError::RetryTopologyChange { partition })?;
        let (mode, isolation) = self.with_active(tx, |near| Ok((near.mode, near.isolation)))?;

        if mode == TxMode::Pessimistic && isolation == IsolationLevel::Serializable {
            self.lock_key(tx, topology, partition, key, &primary).await?;
        }

        let (value, version) = if primary == self.node_id {
            self.store.get(partition, key).await?
        } else {
            self.remote_get(tx, topology, partition, key, &primary).await?
        };

        if isolation == IsolationLevel::Serializable {
            self.with_active(tx, |near| {
                if near.read_keys.insert(key.to_string()) {
                    near.reads.push(TxRead {
                        partition,
                        key: key.to_string(),
                        version,
                    });
                }
                Ok(())
            })?;
        }
        Ok(value)
    }

    /// Stages a write. Pessimistic transactions lock the key at this first
    /// access; optimistic ones defer all locking to the prepare phase.
    pub async fn write(
        &self,
        tx: TxId,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.stage_write(tx, key, Some(value), ttl).await
    }

    /// Stages a removal tombstone for the key.
    pub async fn remove(&self, tx: TxId, key: &str) -> Result<()> {
        self.stage_write(tx, key, None, None).await
    }

    async fn stage_write(
        &self,
        tx: TxId,
        key: &str,
        value: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let topology = self.pin_topology(tx).await?;
        let map = self.affinity.map_for(topology)?;
        let partition = self.affinity.partition_for_key(key);
        let primary = map
            .primary(partition)
            .cloned()
            .ok_or(GridError::RetryTopologyChange { partition })?;
        let mode = self.with_active(tx, |near| Ok(near.mode))?;

        if mode == TxMode::Pessimistic {
            self.lock_key(tx, topology, partition, key, &primary).await?;
        }

        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl).map_err(|e| {
                        GridError::InvalidConfig(format!("ttl out of range: {}", e))
                    })?,
            ),
            None => None,
        };
        self.with_active(tx, |near| {
            near.writes.insert(
                key.to_string(),
                TxWrite {
                    partition,
                    key: key.to_string(),
                    value,
                    expires_at,
                },
            );
            Ok(())
        })
    }

    /// Two-phase commit. Prepares every participant primary, re-checks that
    /// the owners of every affected partition are unchanged, then finishes
    /// with a fresh commit version. Any prepare failure rolls the whole
    /// transaction back; a finish that some participants never acknowledge
    /// surfaces as `PartialFailure` on an otherwise committed transaction.
    pub async fn commit(&self, tx: TxId) -> Result<()> {
        let plan = {
            let mut table = self.transactions.lock();
            let near = table
                .get_mut(&tx)
                .ok_or_else(|| GridError::TransactionNotFound(tx.to_string()))?;
            if !near.state.is_active() {
                return Err(GridError::InvalidTransactionState(format!(
                    "{} is {}",
                    tx, near.state
                )));
            }
            if Instant::now() >= near.deadline {
                return Err(GridError::TxTimeout(tx.to_string()));
            }
            near.state.transition_to(TxState::Preparing)?;
            CommitPlan {
                mode: near.mode,
                isolation: near.isolation,
                topology: near.topology,
                writes: near.writes.values().cloned().collect(),
                reads: near.reads.clone(),
                deadline: near.deadline,
            }
        };

        let outcome = self.run_commit(tx, plan).await;
        match &outcome {
            Ok(()) | Err(GridError::PartialFailure(_)) => {
                self.transactions.lock().remove(&tx);
                self.committed.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                debug!("{} rolled back during commit: {}", tx, err);
                // Failures before the prepare phase leave first-access locks
                // behind; a rollback finish to the lock targets clears them.
                // Participants that already finished re-ack from their
                // completed table.
                let (targets, topology) = {
                    let table = self.transactions.lock();
                    match table.get(&tx) {
                        Some(near) => (self.finish_targets(near), near.topology),
                        None => (Vec::new(), None),
                    }
                };
                if !targets.is_empty() {
                    if let Some(topology) = topology {
                        self.finish_participants(tx, &targets, false, None, topology)
                            .await;
                    }
                }
                self.transactions.lock().remove(&tx);
                self.rolled_back.fetch_add(1, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn run_commit(&self, tx: TxId, plan: CommitPlan) -> Result<()> {
        // A transaction that never touched a key commits trivially.
        let Some(topology) = plan.topology else {
            self.set_state(tx, TxState::Prepared)?;
            self.set_state(tx, TxState::Committing)?;
            self.set_state(tx, TxState::Committed)?;
            return Ok(());
        };
        let map = self.affinity.map_for(topology)?;

        let mut writes_by_node: HashMap<NodeId, Vec<TxWrite>> = HashMap::new();
        for write in &plan.writes {
            let primary = map
                .primary(write.partition)
                .cloned()
                .ok_or(GridError::RetryTopologyChange {
                    partition: write.partition,
                })?;
            writes_by_node.entry(primary).or_default().push(write.clone());
        }
        let mut reads_by_node: HashMap<NodeId, Vec<TxRead>> = HashMap::new();
        if plan.isolation == IsolationLevel::Serializable {
            for read in &plan.reads {
                let primary = map
                    .primary(read.partition)
                    .cloned()
                    .ok_or(GridError::RetryTopologyChange {
                        partition: read.partition,
                    })?;
                reads_by_node.entry(primary).or_default().push(read.clone());
            }
        }
        let mut participants: Vec<NodeId> = writes_by_node
            .keys()
            .chain(reads_by_node.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        participants.sort();

        if participants.is_empty() {
            self.set_state(tx, TxState::Prepared)?;
            self.set_state(tx, TxState::Committing)?;
            self.set_state(tx, TxState::Committed)?;
            return Ok(());
        }

        // Phase one: prepare everywhere, bounded by the deadline.
        let remaining = Self::remaining(plan.deadline, tx)?;
        let mut prepare_futs = Vec::with_capacity(participants.len());
        for node in &participants {
            let body = MessageBody::Prepare(PrepareRequest {
                tx,
                near_node: self.node_id.clone(),
                topology,
                mode: plan.mode,
                writes: writes_by_node.remove(node).unwrap_or_default(),
                reads: reads_by_node.remove(node).unwrap_or_default(),
            });
            let target = node.clone();
            prepare_futs.push(self.io.request_timeout(node, body, remaining, move || {
                GridError::PrepareFailed(format!("prepare timed out on '{}'", target))
            }));
        }
        let replies = join_all(prepare_futs).await;
        let mut prepare_err: Option<GridError> = None;
        for (node, reply) in participants.iter().zip(replies) {
            match reply {
                Ok(MessageBody::Prepared(resp)) => {
                    self.clock.observe(resp.high_version);
                }
                Ok(other) => {
                    prepare_err.get_or_insert(GridError::Internal(format!(
                        "unexpected {} from '{}' during prepare",
                        other.kind(),
                        node
                    )));
                }
                Err(err) => {
                    debug!("{} prepare rejected by '{}': {}", tx, node, err);
                    prepare_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = prepare_err {
            if matches!(err, GridError::OptimisticConflict { .. }) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            self.finish_participants(tx, &participants, false, None, topology)
                .await;
            return Err(err);
        }
        self.set_state(tx, TxState::Prepared)?;

        // The topology may have advanced since prepare. Owners of every
        // affected partition must be unchanged, otherwise the staged writes
        // could land on nodes that no longer own the data.
        if let Some(current) = self.affinity.current_map() {
            if current.version() > topology {
                let mut affected: Vec<PartitionId> = plan
                    .writes
                    .iter()
                    .map(|w| w.partition)
                    .chain(plan.reads.iter().map(|r| r.partition))
                    .collect();
                affected.sort_unstable();
                affected.dedup();
                for partition in affected {
                    if map.owners(partition) != current.owners(partition) {
                        warn!(
                            "{} aborting: owners of partition {} changed during commit",
                            tx, partition
                        );
                        self.finish_participants(tx, &participants, false, None, topology)
                            .await;
                        return Err(GridError::RetryTopologyChange { partition });
                    }
                }
            }
        }

        // Phase two: the commit point. From here the transaction only moves
        // forward.
        let commit_version = self.clock.next(topology);
        self.set_state(tx, TxState::Committing)?;
        let unacked = self
            .finish_participants(tx, &participants, true, Some(commit_version), topology)
            .await;
        self.set_state(tx, TxState::Committed)?;
        if !unacked.is_empty() {
            return Err(GridError::PartialFailure(format!(
                "{} committed, but {} of {} participants did not acknowledge: {:?}",
                tx,
                unacked.len(),
                participants.len(),
                unacked
            )));
        }
        Ok(())
    }

    /// Rolls an active transaction back, releasing its locks on every node
    /// that saw a lock request. Rolling back an unknown transaction is a
    /// no-op so cleanup paths can call it unconditionally.
    pub async fn rollback(&self, tx: TxId) -> Result<()> {
        if !self.transactions.lock().contains_key(&tx) {
            debug!("rollback of unknown {} ignored", tx);
            return Ok(());
        }
        self.rollback_active(tx).await
    }

    async fn rollback_active(&self, tx: TxId) -> Result<()> {
        let (targets, topology) = {
            let mut table = self.transactions.lock();
            let near = table
                .get_mut(&tx)
                .ok_or_else(|| GridError::TransactionNotFound(tx.to_string()))?;
            if !near.state.is_active() {
                return Err(GridError::InvalidTransactionState(format!(
                    "{} is {}",
                    tx, near.state
                )));
            }
            near.state.transition_to(TxState::RollingBack)?;
            (self.finish_targets(near), near.topology)
        };
        if !targets.is_empty() {
            if let Some(topology) = topology {
                self.finish_participants(tx, &targets, false, None, topology)
                    .await;
            }
        }
        self.transactions.lock().remove(&tx);
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!("{} rolled back", tx);
        Ok(())
    }

    pub fn state_of(&self, tx: TxId) -> Option<TxState> {
        self.transactions.lock().get(&tx).map(|near| near.state)
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn staged_participants(&self) -> usize {
        self.participants.lock().len()
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            begun: self.begun.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
            conflicts: self.conflicts.load(Ordering::SeqCst),
            lock_timeouts: self.lock_timeouts.load(Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // Near-side internals
    // ------------------------------------------------------------------

    fn with_active<R>(&self, tx: TxId, f: impl FnOnce(&mut NearTx) -> Result<R>) -> Result<R> {
        let mut table = self.transactions.lock();
        let near = table
            .get_mut(&tx)
            .ok_or_else(|| GridError::TransactionNotFound(tx.to_string()))?;
        if !near.state.is_active() {
            return Err(GridError::InvalidTransactionState(format!(
                "{} is {}",
                tx, near.state
            )));
        }
        if Instant::now() >= near.deadline {
            return Err(GridError::TxTimeout(tx.to_string()));
        }
        f(near)
    }

    fn remaining(deadline: Instant, tx: TxId) -> Result<Duration> {
        let now = Instant::now();
        if now >= deadline {
            return Err(GridError::TxTimeout(tx.to_string()));
        }
        Ok(deadline - now)
    }

    /// Pins the transaction to the first ready topology it accesses data
    /// under. Superseded exchanges are waited out; the transaction deadline
    /// bounds the wait.
    async fn pin_topology(&self, tx: TxId) -> Result<TopologyVersion> {
        loop {
            let (pinned, deadline) =
                self.with_active(tx, |near| Ok((near.topology, near.deadline)))?;
            if let Some(version) = pinned {
                return Ok(version);
            }
            let remaining = Self::remaining(deadline, tx)?;
            let version = self.exchange.current_version();
            if version == TopologyVersion::ZERO {
                // No membership yet; retriable once the node has joined.
                return Err(GridError::StaleTopology {
                    requested: version,
                    current: version,
                });
            }
            let ready = self.exchange.await_ready(version);
            match tokio::time::timeout(remaining, ready).await {
                Ok(Ok(())) => {
                    return self.with_active(tx, |near| {
                        let pinned = match near.topology {
                            Some(existing) => existing,
                            None => {
                                near.topology = Some(version);
                                version
                            }
                        };
                        Ok(pinned)
                    });
                }
                Ok(Err(GridError::StaleTopology { .. })) => continue,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(GridError::TxTimeout(tx.to_string())),
            }
        }
    }

    /// First-access lock acquisition on the key's primary, local or remote.
    /// The key enters the lock manifest before the request goes out, so a
    /// rollback reaches every node that may have granted it.
    async fn lock_key(
        &self,
        tx: TxId,
        topology: TopologyVersion,
        partition: PartitionId,
        key: &str,
        primary: &NodeId,
    ) -> Result<()> {
        let newly =
            self.with_active(tx, |near| Ok(near.locked.insert((partition, key.to_string()))))?;
        if !newly {
            return Ok(());
        }
        let granted: Result<()> = if *primary == self.node_id {
            let wait = self.locks.acquire(partition, key, tx);
            match tokio::time::timeout(self.lock_timeout, wait).await {
                Ok(result) => result,
                Err(_) => {
                    self.locks.cancel_wait(partition, key, tx);
                    Err(GridError::LockTimeout {
                        key: key.to_string(),
                    })
                }
            }
        } else {
            let body = MessageBody::LockRequest(LockRequest {
                tx,
                topology,
                partition,
                key: key.to_string(),
            });
            match self
                .io
                .request_timeout(primary, body, self.lock_timeout, || GridError::LockTimeout {
                    key: key.to_string(),
                })
                .await
            {
                Ok(MessageBody::LockResponse(_)) => Ok(()),
                Ok(other) => Err(GridError::Internal(format!(
                    "unexpected {} while locking '{}'",
                    other.kind(),
                    key
                ))),
                Err(err) => Err(err),
            }
        };
        match granted {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, GridError::LockTimeout { .. }) {
                    self.lock_timeouts.fetch_add(1, Ordering::SeqCst);
                }
                // The grant may still arrive after the deadline; rolling the
                // transaction back now releases it wherever it landed.
                Err(self.abort_after_lock_failure(tx, err).await)
            }
        }
    }

    async fn abort_after_lock_failure(&self, tx: TxId, err: GridError) -> GridError {
        let (targets, topology) = {
            let mut table = self.transactions.lock();
            let Some(near) = table.get_mut(&tx) else {
                return err;
            };
            if near.state.transition_to(TxState::RollingBack).is_err() {
                return err;
            }
            (self.finish_targets(near), near.topology)
        };
        if !targets.is_empty() {
            if let Some(topology) = topology {
                self.finish_participants(tx, &targets, false, None, topology)
                    .await;
            }
        }
        self.transactions.lock().remove(&tx);
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!("{} rolled back after lock failure", tx);
        err
    }

    /// Nodes holding locks for the transaction under its pinned map.
    fn finish_targets(&self, near: &NearTx) -> Vec<NodeId> {
        let Some(topology) = near.topology else {
            return Vec::new();
        };
        let Ok(map) = self.affinity.map_for(topology) else {
            return Vec::new();
        };
        let mut nodes: HashSet<NodeId> = HashSet::new();
        for (partition, _) in &near.locked {
            if let Some(primary) = map.primary(*partition) {
                nodes.insert(primary.clone());
            }
        }
        let mut nodes: Vec<NodeId> = nodes.into_iter().collect();
        nodes.sort();
        nodes
    }

    async fn remote_get(
        &self,
        tx: TxId,
        topology: TopologyVersion,
        partition: PartitionId,
        key: &str,
        primary: &NodeId,
    ) -> Result<(Option<Value>, Option<CacheVersion>)> {
        let deadline = self.with_active(tx, |near| Ok(near.deadline))?;
        let remaining = Self::remaining(deadline, tx)?;
        let body = MessageBody::Get(GetRequest {
            topology,
            partition,
            key: key.to_string(),
        });
        let reply = self
            .io
            .request_timeout(primary, body, remaining, || GridError::TxTimeout(tx.to_string()))
            .await?;
        match reply {
            MessageBody::GetResponse(resp) => Ok((resp.value, resp.version)),
            other => Err(GridError::Internal(format!(
                "unexpected {} reading '{}'",
                other.kind(),
                key
            ))),
        }
    }

    fn set_state(&self, tx: TxId, next: TxState) -> Result<()> {
        let mut table = self.transactions.lock();
        let near = table
            .get_mut(&tx)
            .ok_or_else(|| GridError::TransactionNotFound(tx.to_string()))?;
        near.state.transition_to(next)
    }

    /// Drives one finish round per attempt until every participant
    /// acknowledged. Returns the participants that never did.
    async fn finish_participants(
        &self,
        tx: TxId,
        participants: &[NodeId],
        commit: bool,
        commit_version: Option<CacheVersion>,
        topology: TopologyVersion,
    ) -> Vec<NodeId> {
        let mut unacked: Vec<NodeId> = participants.to_vec();
        for attempt in 0..FINISH_ATTEMPTS {
            if unacked.is_empty() {
                break;
            }
            if attempt > 0 {
                debug!(
                    "{} retrying finish (commit={}) for {} participants",
                    tx,
                    commit,
                    unacked.len()
                );
            }
            let mut futs = Vec::with_capacity(unacked.len());
            for node in &unacked {
                let body = MessageBody::Finish(FinishRequest {
                    tx,
                    commit,
                    commit_version,
                    topology,
                });
                let target = node.clone();
                futs.push(self.io.request_timeout(node, body, self.lock_timeout, move || {
                    GridError::Messaging(format!("finish timed out on '{}'", target))
                }));
            }
            let replies = join_all(futs).await;
            let mut still_unacked: Vec<NodeId> = Vec::new();
            for (node, reply) in unacked.iter().zip(replies) {
                match reply {
                    Ok(MessageBody::FinishAck(_)) => {}
                    Ok(other) => {
                        warn!(
                            "{} unexpected {} from '{}' during finish",
                            tx,
                            other.kind(),
                            node
                        );
                    }
                    Err(err) => {
                        warn!(
                            "{} finish (commit={}) not acknowledged by '{}': {}",
                            tx, commit, node, err
                        );
                        still_unacked.push(node.clone());
                    }
                }
            }
            unacked = still_unacked;
        }
        unacked
    }

    // ------------------------------------------------------------------
    // Participant side
    // ------------------------------------------------------------------

    /// Stages the writes of a remotely coordinated transaction. Pessimistic
    /// transactions must already hold every lock they claim; optimistic ones
    /// acquire commit-time locks here and validate their recorded reads
    /// under them.
    pub async fn handle_prepare(&self, req: PrepareRequest) -> Result<PrepareResponse> {
        if let Some(committed) = self.completed.lock().outcome(req.tx) {
            if committed {
                return Ok(PrepareResponse {
                    tx: req.tx,
                    high_version: self.clock.peek(req.topology),
                });
            }
            return Err(GridError::PrepareFailed(format!(
                "{} was already rolled back here",
                req.tx
            )));
        }

        let ready = self.exchange.await_ready(req.topology);
        tokio::time::timeout(self.lock_timeout, ready)
            .await
            .map_err(|_| {
                GridError::PrepareFailed(format!("topology {} is not ready here", req.topology))
            })??;

        let map = self.affinity.map_for(req.topology)?;
        for write in &req.writes {
            if !map.is_primary(write.partition, &self.node_id) {
                return Err(GridError::RetryTopologyChange {
                    partition: write.partition,
                });
            }
        }
        for read in &req.reads {
            if !map.is_primary(read.partition, &self.node_id) {
                return Err(GridError::RetryTopologyChange {
                    partition: read.partition,
                });
            }
        }

        match req.mode {
            TxMode::Pessimistic => {
                let slots = req
                    .writes
                    .iter()
                    .map(|w| (w.partition, w.key.as_str()))
                    .chain(req.reads.iter().map(|r| (r.partition, r.key.as_str())));
                if !self.locks.holds_all(req.tx, slots) {
                    return Err(GridError::PrepareFailed(format!(
                        "{} does not hold its locks here",
                        req.tx
                    )));
                }
            }
            TxMode::Optimistic => {
                self.acquire_commit_locks(&req).await?;
                for read in &req.reads {
                    if !self
                        .store
                        .validate_read(read.partition, &read.key, read.version)
                        .await?
                    {
                        self.locks.release_all(req.tx);
                        return Err(GridError::OptimisticConflict {
                            key: read.key.clone(),
                        });
                    }
                }
            }
        }

        let staged = ParticipantTx {
            near_node: req.near_node.clone(),
            writes: req.writes.clone(),
            staged_at: Instant::now(),
        };
        self.participants.lock().insert(req.tx, staged);
        debug!(
            "{} staged {} writes from '{}'",
            req.tx,
            req.writes.len(),
            req.near_node
        );
        Ok(PrepareResponse {
            tx: req.tx,
            high_version: self.clock.peek(req.topology),
        })
    }

    /// Commit-time locks for an optimistic transaction, taken in the global
    /// lock order with a bounded wait each.
    async fn acquire_commit_locks(&self, req: &PrepareRequest) -> Result<()> {
        let mut slots: Vec<(PartitionId, Key)> = req
            .writes
            .iter()
            .map(|w| (w.partition, w.key.clone()))
            .chain(req.reads.iter().map(|r| (r.partition, r.key.clone())))
            .collect();
        slots.sort_by(|a, b| {
            lock_rank(a.0, &a.1)
                .cmp(&lock_rank(b.0, &b.1))
                .then_with(|| a.1.cmp(&b.1))
        });
        slots.dedup();
        for (partition, key) in &slots {
            let wait = self.locks.acquire(*partition, key, req.tx);
            match tokio::time::timeout(self.lock_timeout, wait).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.locks.release_all(req.tx);
                    return Err(err);
                }
                Err(_) => {
                    // Somebody else is committing this key right now; that
                    // is a conflict, not a deadlock.
                    self.locks.cancel_wait(*partition, key, req.tx);
                    self.locks.release_all(req.tx);
                    return Err(GridError::OptimisticConflict { key: key.clone() });
                }
            }
        }
        Ok(())
    }

    /// Applies or discards staged writes. Idempotent per transaction id via
    /// the completed table; commits of transactions never staged here are
    /// rejected, rollbacks of unknown transactions are acknowledged.
    pub async fn handle_finish(&self, req: FinishRequest) -> Result<FinishResponse> {
        if let Some(prior) = self.completed.lock().outcome(req.tx) {
            if prior == req.commit {
                return Ok(FinishResponse { tx: req.tx });
            }
            return Err(GridError::InvalidTransactionState(format!(
                "{} already finished with commit={}",
                req.tx, prior
            )));
        }

        let staged = self.participants.lock().get(&req.tx).cloned();
        if req.commit {
            let Some(staged) = staged else {
                return Err(GridError::TransactionNotFound(req.tx.to_string()));
            };
            let Some(version) = req.commit_version else {
                return Err(GridError::Internal(format!(
                    "{} commit carries no version",
                    req.tx
                )));
            };
            self.clock.observe(version);
            // Staged state survives an apply failure so a retried finish can
            // run again.
            self.apply_staged(req.tx, &staged, version).await?;
            self.participants.lock().remove(&req.tx);
            self.locks.release_all(req.tx);
            self.completed.lock().record(req.tx, true);
            debug!("{} committed {} writes", req.tx, staged.writes.len());
        } else {
            if staged.is_some() {
                debug!("{} rolled back, staged writes discarded", req.tx);
            }
            self.participants.lock().remove(&req.tx);
            self.locks.release_all(req.tx);
            self.completed.lock().record(req.tx, false);
        }
        Ok(FinishResponse { tx: req.tx })
    }

    /// Applies committed writes on this primary, then ships the resulting
    /// entries to the current backups.
    async fn apply_staged(
        &self,
        tx: TxId,
        staged: &ParticipantTx,
        version: CacheVersion,
    ) -> Result<()> {
        let mut by_partition: HashMap<PartitionId, Vec<ReplicatedEntry>> = HashMap::new();
        for write in &staged.writes {
            self.store
                .apply_primary(
                    write.partition,
                    &write.key,
                    write.value.clone(),
                    version,
                    write.expires_at,
                )
                .await?;
            if let Some(entry) = self.store.replicated_form(write.partition, &write.key).await? {
                by_partition.entry(write.partition).or_default().push(entry);
            }
        }
        let Some(map) = self.affinity.current_map() else {
            return Ok(());
        };
        for (partition, entries) in by_partition {
            for backup in map.backups(partition) {
                if *backup == self.node_id {
                    continue;
                }
                let body = MessageBody::BackupApply(BackupApply {
                    tx,
                    partition,
                    topology: map.version(),
                    entries: entries.clone(),
                });
                if let Err(err) = self.io.send(backup, body).await {
                    warn!(
                        "{} backup apply for partition {} not delivered to '{}': {}",
                        tx, partition, backup, err
                    );
                }
            }
        }
        Ok(())
    }

    /// Grants a first-access lock for a remotely coordinated pessimistic
    /// transaction.
    pub async fn handle_lock(&self, req: LockRequest) -> Result<LockResponse> {
        let ready = self.exchange.await_ready(req.topology);
        tokio::time::timeout(self.lock_timeout, ready)
            .await
            .map_err(|_| GridError::LockTimeout {
                key: req.key.clone(),
            })??;
        let map = self.affinity.map_for(req.topology)?;
        if !map.is_primary(req.partition, &self.node_id) {
            return Err(GridError::RetryTopologyChange {
                partition: req.partition,
            });
        }
        let wait = self.locks.acquire(req.partition, &req.key, req.tx);
        match tokio::time::timeout(self.lock_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                self.locks.cancel_wait(req.partition, &req.key, req.tx);
                return Err(GridError::LockTimeout {
                    key: req.key.clone(),
                });
            }
        }
        Ok(LockResponse {
            tx: req.tx,
            key: req.key,
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Rolls back staged state whose coordinator is gone from the topology.
    /// Such transactions can never receive a finish.
    pub fn on_topology_ready(&self, snapshot: &TopologySnapshot) {
        let abandoned: Vec<TxId> = {
            let participants = self.participants.lock();
            participants
                .iter()
                .filter(|(_, p)| !snapshot.contains(&p.near_node))
                .map(|(tx, _)| *tx)
                .collect()
        };
        for tx in abandoned {
            warn!(
                "{} near node left before finishing, rolling staged state back",
                tx
            );
            self.participants.lock().remove(&tx);
            self.locks.release_all(tx);
            self.completed.lock().record(tx, false);
        }
    }

    /// Aborts active transactions past their deadline and drops staged
    /// participant state abandoned mid-protocol. Returns how many were
    /// rolled back.
    pub async fn expire_timed_out(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<TxId> = {
            let table = self.transactions.lock();
            table
                .iter()
                .filter(|(_, near)| near.state.is_active() && now >= near.deadline)
                .map(|(tx, _)| *tx)
                .collect()
        };
        let mut rolled = 0;
        for tx in expired {
            warn!("{} exceeded its deadline, rolling back", tx);
            match self.rollback_active(tx).await {
                Ok(()) => rolled += 1,
                Err(err) => debug!("{} expiry rollback skipped: {}", tx, err),
            }
        }

        let stale_cut = self.tx_timeout * STALE_STAGING_FACTOR;
        let stale: Vec<TxId> = {
            let participants = self.participants.lock();
            participants
                .iter()
                .filter(|(_, p)| now.duration_since(p.staged_at) > stale_cut)
                .map(|(tx, _)| *tx)
                .collect()
        };
        for tx in stale {
            warn!("{} staged state went stale, rolling back", tx);
            self.participants.lock().remove(&tx);
            self.locks.release_all(tx);
            self.completed.lock().record(tx, false);
            rolled += 1;
        }
        rolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Rebalancer;
    use crate::io::LoopbackTransport;
    use crate::topology::{DiscoveryEvent, NoopFailureReporter};
    use serde_json::json;

    struct Ctx {
        tx: Arc<TxManager>,
        store: Arc<PartitionStore>,
        locks: Arc<LockTable>,
        clock: Arc<VersionClock>,
        affinity: Arc<AffinityCache>,
        topology: TopologyVersion,
    }

    async fn single_node(tx_timeout: Duration) -> Ctx {
        let transport = Arc::new(LoopbackTransport::new());
        let io = Arc::new(GridIo::new("a", transport));
        let affinity = Arc::new(AffinityCache::new(8, 1));
        let store = Arc::new(PartitionStore::new(8));
        let locks = Arc::new(LockTable::new());
        let clock = Arc::new(VersionClock::new(1));
        let rebalancer = Arc::new(Rebalancer::new(
            Arc::clone(&io),
            Arc::clone(&store),
            16,
            Duration::from_millis(200),
        ));
        let exchange = Arc::new(ExchangeManager::new(
            "a",
            Arc::clone(&io),
            Arc::clone(&affinity),
            Arc::clone(&store),
            rebalancer,
            Arc::new(NoopFailureReporter),
            Duration::from_millis(200),
        ));
        let progress = exchange
            .on_discovery_event(&DiscoveryEvent::NodeJoined("a".to_string()))
            .await
            .unwrap();
        let topology = progress.version;
        exchange.finish(topology);

        let manager = Arc::new(TxManager::new(
            "a",
            io,
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&affinity),
            exchange,
            Arc::clone(&clock),
            tx_timeout,
            Duration::from_millis(200),
        ));
        Ctx {
            tx: manager,
            store,
            locks,
            clock,
            affinity,
            topology,
        }
    }

    #[tokio::test]
    async fn test_begin_and_rollback_lifecycle() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let tx = ctx.tx.begin(TxMode::Pessimistic, IsolationLevel::ReadCommitted);
        assert_eq!(ctx.tx.state_of(tx), Some(TxState::Active));
        assert_eq!(ctx.tx.active_transactions(), 1);

        ctx.tx.rollback(tx).await.unwrap();
        assert_eq!(ctx.tx.state_of(tx), None);
        assert_eq!(ctx.tx.active_transactions(), 0);
        // Rolling back again is a no-op.
        ctx.tx.rollback(tx).await.unwrap();
        assert_eq!(ctx.tx.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_read_your_writes_shadows_the_store() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let tx = ctx.tx.begin(TxMode::Pessimistic, IsolationLevel::ReadCommitted);

        ctx.tx.write(tx, "color", json!("red"), None).await.unwrap();
        assert_eq!(ctx.tx.read(tx, "color").await.unwrap(), Some(json!("red")));

        ctx.tx.remove(tx, "color").await.unwrap();
        assert_eq!(ctx.tx.read(tx, "color").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pessimistic_write_takes_the_lock_first() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let tx = ctx.tx.begin(TxMode::Pessimistic, IsolationLevel::ReadCommitted);
        ctx.tx.write(tx, "k", json!(1), None).await.unwrap();

        let partition = ctx.affinity.partition_for_key("k");
        assert_eq!(ctx.locks.owner_of(partition, "k"), Some(tx));
    }

    #[tokio::test]
    async fn test_prepare_rejects_unheld_pessimistic_locks() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let foreign = TxId::new();
        let partition = ctx.affinity.partition_for_key("k");
        let req = PrepareRequest {
            tx: foreign,
            near_node: "b".to_string(),
            topology: ctx.topology,
            mode: TxMode::Pessimistic,
            writes: vec![TxWrite {
                partition,
                key: "k".to_string(),
                value: Some(json!(1)),
                expires_at: None,
            }],
            reads: Vec::new(),
        };
        assert!(matches!(
            ctx.tx.handle_prepare(req).await,
            Err(GridError::PrepareFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_optimistic_validates_reads() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let partition = ctx.affinity.partition_for_key("k");
        let v1 = ctx.clock.next(ctx.topology);
        ctx.store
            .apply_primary(partition, "k", Some(json!("old")), v1, None)
            .await
            .unwrap();

        // A transaction that recorded the right version prepares fine.
        let good = TxId::new();
        let req = PrepareRequest {
            tx: good,
            near_node: "b".to_string(),
            topology: ctx.topology,
            mode: TxMode::Optimistic,
            writes: Vec::new(),
            reads: vec![TxRead {
                partition,
                key: "k".to_string(),
                version: Some(v1),
            }],
        };
        ctx.tx.handle_prepare(req).await.unwrap();
        ctx.tx
            .handle_finish(FinishRequest {
                tx: good,
                commit: false,
                commit_version: None,
                topology: ctx.topology,
            })
            .await
            .unwrap();

        // One that recorded a stale version conflicts, and holds no locks
        // afterwards.
        let conflicted = TxId::new();
        let req = PrepareRequest {
            tx: conflicted,
            near_node: "b".to_string(),
            topology: ctx.topology,
            mode: TxMode::Optimistic,
            writes: Vec::new(),
            reads: vec![TxRead {
                partition,
                key: "k".to_string(),
                version: None,
            }],
        };
        assert!(matches!(
            ctx.tx.handle_prepare(req).await,
            Err(GridError::OptimisticConflict { .. })
        ));
        assert_eq!(ctx.locks.owner_of(partition, "k"), None);
    }

    #[tokio::test]
    async fn test_finish_commit_applies_staged_writes() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let tx = TxId::new();
        let partition = ctx.affinity.partition_for_key("k");
        ctx.locks.acquire(partition, "k", tx).await.unwrap();

        let req = PrepareRequest {
            tx,
            near_node: "b".to_string(),
            topology: ctx.topology,
            mode: TxMode::Pessimistic,
            writes: vec![TxWrite {
                partition,
                key: "k".to_string(),
                value: Some(json!(7)),
                expires_at: None,
            }],
            reads: Vec::new(),
        };
        ctx.tx.handle_prepare(req).await.unwrap();
        assert_eq!(ctx.tx.staged_participants(), 1);

        let commit_version = ctx.clock.next(ctx.topology);
        let finish = FinishRequest {
            tx,
            commit: true,
            commit_version: Some(commit_version),
            topology: ctx.topology,
        };
        ctx.tx.handle_finish(finish.clone()).await.unwrap();
        assert_eq!(
            ctx.store.get(partition, "k").await.unwrap(),
            (Some(json!(7)), Some(commit_version))
        );
        assert_eq!(ctx.locks.owner_of(partition, "k"), None);
        assert_eq!(ctx.tx.staged_participants(), 0);

        // A replayed finish is answered from the completed table.
        ctx.tx.handle_finish(finish).await.unwrap();
        assert_eq!(
            ctx.store.get(partition, "k").await.unwrap().0,
            Some(json!(7))
        );
    }

    #[tokio::test]
    async fn test_finish_of_unknown_transaction() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let unknown = TxId::new();

        // Commit of a transaction never staged here is a protocol error.
        let err = ctx
            .tx
            .handle_finish(FinishRequest {
                tx: unknown,
                commit: true,
                commit_version: Some(ctx.clock.next(ctx.topology)),
                topology: ctx.topology,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::TransactionNotFound(_)));

        // Rollback of one is acknowledged.
        ctx.tx
            .handle_finish(FinishRequest {
                tx: unknown,
                commit: false,
                commit_version: None,
                topology: ctx.topology,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expire_sweeps_timed_out_transactions() {
        let ctx = single_node(Duration::from_millis(5)).await;
        let tx = ctx.tx.begin(TxMode::Optimistic, IsolationLevel::ReadCommitted);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(ctx.tx.expire_timed_out().await, 1);
        assert_eq!(ctx.tx.state_of(tx), None);
        assert_eq!(ctx.tx.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_abandoned_staging_rolled_back_when_near_node_leaves() {
        let ctx = single_node(Duration::from_secs(2)).await;
        let tx = TxId::new();
        let partition = ctx.affinity.partition_for_key("k");
        ctx.locks.acquire(partition, "k", tx).await.unwrap();
        ctx.tx
            .handle_prepare(PrepareRequest {
                tx,
                near_node: "gone".to_string(),
                topology: ctx.topology,
                mode: TxMode::Pessimistic,
                writes: vec![TxWrite {
                    partition,
                    key: "k".to_string(),
                    value: Some(json!(1)),
                    expires_at: None,
                }],
                reads: Vec::new(),
            })
            .await
            .unwrap();

        // Topology that no longer contains the near node.
        let snapshot = TopologySnapshot::empty()
            .apply(&DiscoveryEvent::NodeJoined("a".to_string()))
            .unwrap();
        ctx.tx.on_topology_ready(&snapshot);

        assert_eq!(ctx.tx.staged_participants(), 0);
        assert_eq!(ctx.locks.owner_of(partition, "k"), None);
        assert_eq!(
            ctx.store.get(partition, "k").await.unwrap(),
            (None, None)
        );
    }
}
