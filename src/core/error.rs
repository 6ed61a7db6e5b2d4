use crate::core::types::{PartitionId, TopologyVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy of the consistency engine.
///
/// Errors are `Clone + Serialize` so a failure raised on a remote node can be
/// carried back inside a response message and surfaced to the caller with its
/// exact kind intact.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum GridError {
    /// The operation referenced a topology version that is no longer (or not
    /// yet) current. Safe to retry against the latest ready version.
    #[error("stale topology: requested {requested}, current {current}")]
    StaleTopology {
        requested: TopologyVersion,
        current: TopologyVersion,
    },

    /// A queued operation was superseded by a later topology change and must
    /// be resubmitted against the newer mapping.
    #[error("topology changed for partition {partition}, retry against the new mapping")]
    RetryTopologyChange { partition: PartitionId },

    /// Optimistic commit-time validation found a conflicting write.
    #[error("optimistic conflict on key '{key}'")]
    OptimisticConflict { key: String },

    /// A pessimistic lock was not granted within the configured deadline.
    #[error("lock timeout on key '{key}'")]
    LockTimeout { key: String },

    /// A participant rejected the prepare phase; the transaction rolls back.
    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    /// Rebalancing supply failed and no healthy prior owner is available.
    #[error("partial failure: {0}")]
    PartialFailure(String),

    /// The per-transaction deadline elapsed before the commit point.
    #[error("transaction {0} timed out")]
    TxTimeout(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    /// Message-layer failure: unreachable peer, severed link, encode error in
    /// flight. Always surfaces through the registered future, never dropped.
    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node {0} is stopped")]
    NodeStopped(String),

    /// A future continuation panicked while transforming an upstream result.
    /// Distinct from the upstream failure, which passes through unchanged.
    #[error("continuation failed: {0}")]
    ContinuationFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// True for transient topology errors the transaction manager retries
    /// transparently up to the configured bound.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GridError::StaleTopology { .. } | GridError::RetryTopologyChange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

impl From<rmp_serde::encode::Error> for GridError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GridError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
