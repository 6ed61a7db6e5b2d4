// ============================================================================
// Eviction / TTL / Swap Seams
// ============================================================================
//
// The store consumes these interfaces but does not define policy. Eviction
// is consulted after a write applies, never inside the version critical
// path, and an evicted entry travels through swap with its last known
// version so a reload cannot go back in time.
//
// ============================================================================

use crate::core::{Key, PartitionId, Result};
use crate::store::entry::{ReplicatedEntry, VersionedEntry};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Ranks eviction victims. Implementations track recency on touch and give
/// back the next candidate when the store is over budget.
pub trait EvictionPolicy: Send + Sync {
    fn on_touch(&self, partition: PartitionId, key: &str);
    fn on_remove(&self, partition: PartitionId, key: &str);
    fn should_evict(&self, entry: &VersionedEntry) -> bool;
    fn next_victim(&self) -> Option<(PartitionId, Key)>;
    fn over_capacity(&self, resident: usize) -> bool;
}

/// Least-recently-used ranking over all partitions of one node.
pub struct LruEvictionPolicy {
    capacity: usize,
    recency: Mutex<LruCache<(PartitionId, Key), ()>>,
}

impl LruEvictionPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            // The store drives removal; the tracker itself never drops keys.
            recency: Mutex::new(LruCache::unbounded()),
        }
    }
}

impl EvictionPolicy for LruEvictionPolicy {
    fn on_touch(&self, partition: PartitionId, key: &str) {
        self.recency
            .lock()
            .push((partition, key.to_string()), ());
    }

    fn on_remove(&self, partition: PartitionId, key: &str) {
        self.recency.lock().pop(&(partition, key.to_string()));
    }

    fn should_evict(&self, _entry: &VersionedEntry) -> bool {
        true
    }

    fn next_victim(&self) -> Option<(PartitionId, Key)> {
        self.recency.lock().peek_lru().map(|(k, _)| k.clone())
    }

    fn over_capacity(&self, resident: usize) -> bool {
        resident > self.capacity
    }
}

/// Policy that never evicts; the default.
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn on_touch(&self, _partition: PartitionId, _key: &str) {}
    fn on_remove(&self, _partition: PartitionId, _key: &str) {}
    fn should_evict(&self, _entry: &VersionedEntry) -> bool {
        false
    }
    fn next_victim(&self) -> Option<(PartitionId, Key)> {
        None
    }
    fn over_capacity(&self, _resident: usize) -> bool {
        false
    }
}

/// Notified when the expiry sweep drops an entry.
pub trait ExpiryObserver: Send + Sync {
    fn on_expire(&self, partition: PartitionId, entry: &ReplicatedEntry);
}

pub struct NoopExpiryObserver;

impl ExpiryObserver for NoopExpiryObserver {
    fn on_expire(&self, _partition: PartitionId, _entry: &ReplicatedEntry) {}
}

/// Overflow and write-through seam. Evicted entries are swapped out before
/// leaving memory and swapped back in on the next read miss.
#[async_trait]
pub trait SwapStorage: Send + Sync {
    async fn swap_out(&self, partition: PartitionId, entry: ReplicatedEntry) -> Result<()>;
    async fn swap_in(&self, partition: PartitionId, key: &str) -> Result<Option<ReplicatedEntry>>;
    async fn remove(&self, partition: PartitionId, key: &str) -> Result<()>;
}

/// Map-backed swap space, enough for tests and single-process overflow.
#[derive(Default)]
pub struct InMemorySwap {
    entries: Mutex<HashMap<(PartitionId, Key), ReplicatedEntry>>,
}

impl InMemorySwap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SwapStorage for InMemorySwap {
    async fn swap_out(&self, partition: PartitionId, entry: ReplicatedEntry) -> Result<()> {
        self.entries
            .lock()
            .insert((partition, entry.key.clone()), entry);
        Ok(())
    }

    async fn swap_in(&self, partition: PartitionId, key: &str) -> Result<Option<ReplicatedEntry>> {
        Ok(self
            .entries
            .lock()
            .remove(&(partition, key.to_string())))
    }

    async fn remove(&self, partition: PartitionId, key: &str) -> Result<()> {
        self.entries.lock().remove(&(partition, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheVersion, TopologyVersion};
    use serde_json::json;

    #[test]
    fn test_lru_victim_is_least_recently_touched() {
        let policy = LruEvictionPolicy::new(2);
        policy.on_touch(0, "a");
        policy.on_touch(0, "b");
        policy.on_touch(1, "c");
        assert!(policy.over_capacity(3));
        assert_eq!(policy.next_victim(), Some((0, "a".to_string())));

        // Touching promotes.
        policy.on_touch(0, "a");
        assert_eq!(policy.next_victim(), Some((0, "b".to_string())));
    }

    #[test]
    fn test_removed_keys_leave_the_ranking() {
        let policy = LruEvictionPolicy::new(1);
        policy.on_touch(0, "a");
        policy.on_touch(0, "b");
        policy.on_remove(0, "a");
        assert_eq!(policy.next_victim(), Some((0, "b".to_string())));
    }

    #[tokio::test]
    async fn test_swap_roundtrip_keeps_version() {
        let swap = InMemorySwap::new();
        let entry = ReplicatedEntry {
            key: "k".to_string(),
            value: Some(json!(1)),
            version: CacheVersion {
                topology: TopologyVersion(2),
                counter: 17,
                node_order: 3,
            },
            expires_at: None,
        };
        swap.swap_out(4, entry.clone()).await.unwrap();
        let back = swap.swap_in(4, "k").await.unwrap().unwrap();
        assert_eq!(back, entry);
        // Swap-in consumes the slot.
        assert!(swap.swap_in(4, "k").await.unwrap().is_none());
    }
}
