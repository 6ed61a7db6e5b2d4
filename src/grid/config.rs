use crate::core::{GridError, Result};
use std::time::Duration;

/// Grid node configuration
///
/// Partition count and backup count are cluster-wide settings: every node
/// must be constructed with the same values, since both the key mapping and
/// the ownership calculation depend on them.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Number of partitions the key space is split into. Fixed for the life
    /// of the cluster.
    pub partitions: u32,

    /// Backup copies kept per partition, in addition to the primary.
    pub backups: usize,

    /// Deadline for a whole transaction, from begin to commit point.
    pub tx_timeout: Duration,

    /// Deadline for a single lock acquisition or protocol round trip.
    pub lock_timeout: Duration,

    /// How long an exchange coordinator waits for readiness acks before
    /// reporting the silent nodes as failed.
    pub exchange_ack_timeout: Duration,

    /// How many times a single-key operation is retried when it lands on a
    /// topology that changed under it.
    pub topology_retries: u32,

    /// Pause between those retries.
    pub retry_backoff: Duration,

    /// Entries per rebalance supply batch.
    pub rebalance_batch: usize,

    /// Resident entries per node before the eviction policy starts swapping
    /// or dropping. `None` disables capacity enforcement.
    pub eviction_capacity: Option<usize>,

    /// Time-to-live applied to writes that do not carry their own.
    pub ttl_default: Option<Duration>,

    /// Interval of the background sweep (expiry, capacity, stale
    /// transactions).
    pub maintenance_interval: Duration,
}

impl GridConfig {
    pub fn new(partitions: u32, backups: usize) -> Self {
        Self {
            partitions,
            backups,
            tx_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
            exchange_ack_timeout: Duration::from_secs(10),
            topology_retries: 3,
            retry_backoff: Duration::from_millis(50),
            rebalance_batch: 128,
            eviction_capacity: None,
            ttl_default: None,
            maintenance_interval: Duration::from_secs(1),
        }
    }

    /// Set the transaction deadline
    pub fn tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Set the lock acquisition deadline
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the exchange acknowledgement deadline
    pub fn exchange_ack_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_ack_timeout = timeout;
        self
    }

    /// Set the retry bound for single-key operations
    pub fn topology_retries(mut self, retries: u32) -> Self {
        self.topology_retries = retries;
        self
    }

    /// Set the pause between topology retries
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the rebalance supply batch size
    pub fn rebalance_batch(mut self, batch: usize) -> Self {
        self.rebalance_batch = batch;
        self
    }

    /// Cap resident entries per node
    pub fn eviction_capacity(mut self, capacity: usize) -> Self {
        self.eviction_capacity = Some(capacity);
        self
    }

    /// Set a default time-to-live for writes
    pub fn ttl_default(mut self, ttl: Duration) -> Self {
        self.ttl_default = Some(ttl);
        self
    }

    /// Set the background sweep interval
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(GridError::InvalidConfig(
                "partitions must be > 0".to_string(),
            ));
        }
        if self.rebalance_batch == 0 {
            return Err(GridError::InvalidConfig(
                "rebalance_batch must be > 0".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() || self.tx_timeout.is_zero() {
            return Err(GridError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.lock_timeout > self.tx_timeout {
            return Err(GridError::InvalidConfig(
                "lock_timeout cannot exceed tx_timeout".to_string(),
            ));
        }
        if self.eviction_capacity == Some(0) {
            return Err(GridError::InvalidConfig(
                "eviction_capacity must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self::new(64, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(GridConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = GridConfig::new(32, 2)
            .tx_timeout(Duration::from_secs(10))
            .lock_timeout(Duration::from_secs(1))
            .topology_retries(5)
            .eviction_capacity(10_000);
        assert_eq!(config.partitions, 32);
        assert_eq!(config.backups, 2);
        assert_eq!(config.topology_retries, 5);
        assert_eq!(config.eviction_capacity, Some(10_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(GridConfig::new(0, 1).validate().is_err());
        assert!(GridConfig::default().rebalance_batch(0).validate().is_err());
        assert!(GridConfig::default()
            .lock_timeout(Duration::from_secs(60))
            .validate()
            .is_err());
        let mut config = GridConfig::default();
        config.eviction_capacity = Some(0);
        assert!(config.validate().is_err());
    }
}
