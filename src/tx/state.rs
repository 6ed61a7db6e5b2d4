// ============================================================================
// Transaction State Management
// ============================================================================
//
// Implements the State Pattern for the two-phase commit lifecycle. A near
// transaction moves through:
//
//   Active -> Preparing -> Prepared -> Committing -> Committed
//     |           |                        |
//     +-----------+------------------------+--> RollingBack -> RolledBack
//
// Every transition is validated; an out-of-order request (double commit,
// write after prepare) is rejected instead of silently reordered.
//
// ============================================================================

use crate::core::{GridError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a distributed transaction. Random so that ids minted
/// on different nodes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TxId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let full = self.0.simple().to_string();
        write!(f, "tx_{}", &full[..8])
    }
}

/// Concurrency mode chosen when the transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    /// Lock every key on first access; conflicts surface as lock waits.
    Pessimistic,

    /// Run lock-free and validate recorded reads at commit time.
    Optimistic,
}

impl std::fmt::Display for TxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxMode::Pessimistic => write!(f, "PESSIMISTIC"),
            TxMode::Optimistic => write!(f, "OPTIMISTIC"),
        }
    }
}

/// How strictly reads are checked against concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads participate in locking/validation like writes do.
    Serializable,

    /// Reads see the latest committed value and are never re-checked.
    ReadCommitted,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
            IsolationLevel::ReadCommitted => write!(f, "READ_COMMITTED"),
        }
    }
}

/// Transaction state following the State Pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    /// Transaction is active and can read and write
    Active,

    /// First commit phase is in flight
    Preparing,

    /// All participants have staged the writes and hold the locks
    Prepared,

    /// Second commit phase is in flight
    Committing,

    /// Transaction has been successfully committed
    Committed,

    /// Rollback is in flight
    RollingBack,

    /// Transaction has been rolled back
    RolledBack,
}

impl TxState {
    /// Check if the transaction can still execute reads and writes
    pub fn is_active(&self) -> bool {
        matches!(self, TxState::Active)
    }

    /// Check if the transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Active, RollingBack)
                | (Preparing, RollingBack)
                | (Prepared, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Validated transition; the error names both states for diagnostics.
    pub fn transition_to(&mut self, next: TxState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(GridError::InvalidTransactionState(format!(
                "no transition {} -> {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxState::Active => write!(f, "ACTIVE"),
            TxState::Preparing => write!(f, "PREPARING"),
            TxState::Prepared => write!(f, "PREPARED"),
            TxState::Committing => write!(f, "COMMITTING"),
            TxState::Committed => write!(f, "COMMITTED"),
            TxState::RollingBack => write!(f, "ROLLING_BACK"),
            TxState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}
