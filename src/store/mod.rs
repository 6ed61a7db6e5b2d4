// ============================================================================
// Partition Store
// ============================================================================
//
// Entry storage for every partition a node hosts, one shard per partition
// behind its own async lock so unrelated partitions never contend. Mutation
// paths check the ownership role: primaries take transactional writes,
// backups and rebalance targets take replicated applies, and everything
// applied anywhere is compare-and-skip on the entry version so replays and
// reordered replication converge on the highest version.
//
// ============================================================================

pub mod entry;
pub mod evict;
pub mod lock;

pub use entry::{ReplicatedEntry, VersionedEntry};
pub use evict::{
    EvictionPolicy, ExpiryObserver, InMemorySwap, LruEvictionPolicy, NoEviction,
    NoopExpiryObserver, SwapStorage,
};
pub use lock::{lock_rank, LockTable};

use crate::core::{CacheVersion, GridError, Key, PartitionId, Result, Value};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// How long a removal tombstone stays resident before the expiry sweep may
/// drop it. Long enough for replication and rebalance stragglers to hit the
/// version fence instead of resurrecting the key.
const TOMBSTONE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRole {
    Primary,
    Backup,
    Unowned,
}

impl std::fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionRole::Primary => write!(f, "primary"),
            PartitionRole::Backup => write!(f, "backup"),
            PartitionRole::Unowned => write!(f, "unowned"),
        }
    }
}

struct Shard {
    role: PartitionRole,
    entries: HashMap<Key, VersionedEntry>,
}

pub struct PartitionStore {
    shards: Vec<Arc<RwLock<Shard>>>,
    policy: Arc<dyn EvictionPolicy>,
    swap: Option<Arc<dyn SwapStorage>>,
    expiry: Arc<dyn ExpiryObserver>,
    resident: AtomicUsize,
}

impl PartitionStore {
    pub fn new(partitions: u32) -> Self {
        let shards = (0..partitions)
            .map(|_| {
                Arc::new(RwLock::new(Shard {
                    role: PartitionRole::Unowned,
                    entries: HashMap::new(),
                }))
            })
            .collect();
        Self {
            shards,
            policy: Arc::new(NoEviction),
            swap: None,
            expiry: Arc::new(NoopExpiryObserver),
            resident: AtomicUsize::new(0),
        }
    }

    pub fn with_eviction(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_swap(mut self, swap: Arc<dyn SwapStorage>) -> Self {
        self.swap = Some(swap);
        self
    }

    pub fn with_expiry_observer(mut self, observer: Arc<dyn ExpiryObserver>) -> Self {
        self.expiry = observer;
        self
    }

    pub fn partitions(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn resident_entries(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    fn shard(&self, partition: PartitionId) -> Result<&Arc<RwLock<Shard>>> {
        self.shards.get(partition as usize).ok_or_else(|| {
            GridError::Internal(format!("partition {} out of range", partition))
        })
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    pub async fn set_role(&self, partition: PartitionId, role: PartitionRole) -> Result<()> {
        let shard = self.shard(partition)?;
        shard.write().await.role = role;
        Ok(())
    }

    pub async fn role(&self, partition: PartitionId) -> Result<PartitionRole> {
        Ok(self.shard(partition)?.read().await.role)
    }

    /// Drops every entry of a partition this node no longer owns.
    pub async fn clear_partition(&self, partition: PartitionId) -> Result<usize> {
        let removed: Vec<Key> = {
            let mut shard = self.shard(partition)?.write().await;
            shard.role = PartitionRole::Unowned;
            shard.entries.drain().map(|(k, _)| k).collect()
        };
        self.resident.fetch_sub(removed.len(), Ordering::SeqCst);
        for key in &removed {
            self.policy.on_remove(partition, key);
            if let Some(swap) = &self.swap {
                swap.remove(partition, key).await?;
            }
        }
        Ok(removed.len())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Primary read. Returns the live value and its version; a tombstoned or
    /// expired entry reads as absent but still reports its version so
    /// optimistic validation can detect a later overwrite.
    pub async fn get(
        &self,
        partition: PartitionId,
        key: &str,
    ) -> Result<(Option<Value>, Option<CacheVersion>)> {
        {
            let shard = self.shard(partition)?.read().await;
            if shard.role != PartitionRole::Primary {
                return Err(GridError::RetryTopologyChange { partition });
            }
            if let Some(entry) = shard.entries.get(key) {
                let result = read_entry(entry, Utc::now());
                drop(shard);
                if result.0.is_some() {
                    self.policy.on_touch(partition, key);
                }
                return Ok(result);
            }
        }
        // Miss: give swapped-out entries a chance to come back.
        let Some(swap) = self.swap.clone() else {
            return Ok((None, None));
        };
        let Some(reloaded) = swap.swap_in(partition, key).await? else {
            return Ok((None, None));
        };
        let mut shard = self.shard(partition)?.write().await;
        if shard.role != PartitionRole::Primary {
            return Err(GridError::RetryTopologyChange { partition });
        }
        if let Some(existing) = shard.entries.get_mut(key) {
            // A write raced the reload; merge keeps the highest version.
            existing.apply(reloaded.value, reloaded.version, reloaded.expires_at);
        } else {
            let (key_owned, entry) = VersionedEntry::from_replicated(reloaded);
            shard.entries.insert(key_owned, entry);
            self.resident.fetch_add(1, Ordering::SeqCst);
        }
        let result = shard
            .entries
            .get(key)
            .map(|e| read_entry(e, Utc::now()))
            .unwrap_or((None, None));
        drop(shard);
        if result.0.is_some() {
            self.policy.on_touch(partition, key);
        }
        Ok(result)
    }

    /// Current entry version, including tombstones and expired entries.
    /// `None` means the key has never been written here.
    pub async fn entry_version(
        &self,
        partition: PartitionId,
        key: &str,
    ) -> Result<Option<CacheVersion>> {
        let shard = self.shard(partition)?.read().await;
        Ok(shard.entries.get(key).map(|e| e.version()))
    }

    /// Commit-time check for one recorded read: the entry version must be
    /// exactly what the transaction observed.
    pub async fn validate_read(
        &self,
        partition: PartitionId,
        key: &str,
        recorded: Option<CacheVersion>,
    ) -> Result<bool> {
        Ok(self.entry_version(partition, key).await? == recorded)
    }

    /// Consistent view of one key at a version; takes no write locks.
    pub async fn snapshot_read(
        &self,
        partition: PartitionId,
        key: &str,
        at: CacheVersion,
    ) -> Result<Option<Value>> {
        let shard = self.shard(partition)?.read().await;
        if shard.role == PartitionRole::Unowned {
            return Err(GridError::RetryTopologyChange { partition });
        }
        Ok(shard
            .entries
            .get(key)
            .and_then(|e| e.value_at(at))
            .cloned())
    }

    /// Consistent view of a whole partition at a version, sorted by key.
    pub async fn snapshot_scan(
        &self,
        partition: PartitionId,
        at: CacheVersion,
    ) -> Result<Vec<(Key, Value)>> {
        let shard = self.shard(partition)?.read().await;
        if shard.role == PartitionRole::Unowned {
            return Err(GridError::RetryTopologyChange { partition });
        }
        let mut rows: Vec<(Key, Value)> = shard
            .entries
            .iter()
            .filter_map(|(k, e)| e.value_at(at).map(|v| (k.clone(), v.clone())))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Transactional write on the primary owner. `value: None` writes a
    /// removal tombstone. Returns whether the version actually applied.
    pub async fn apply_primary(
        &self,
        partition: PartitionId,
        key: &str,
        value: Option<Value>,
        version: CacheVersion,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.apply_with_role(partition, key, value, version, expires_at, true)
            .await
    }

    /// Replicated apply on a backup or rebalance target. Skips (with a debug
    /// log) when the node does not own the partition, which happens when a
    /// late message crosses an ownership change.
    pub async fn apply_replicated(
        &self,
        partition: PartitionId,
        entry: ReplicatedEntry,
    ) -> Result<bool> {
        let owned = {
            let shard = self.shard(partition)?.read().await;
            shard.role != PartitionRole::Unowned
        };
        if !owned {
            debug!(
                "skipping replicated apply for unowned partition {} key '{}'",
                partition, entry.key
            );
            return Ok(false);
        }
        let ReplicatedEntry {
            key,
            value,
            version,
            expires_at,
        } = entry;
        self.apply_with_role(partition, &key, value, version, expires_at, false)
            .await
    }

    async fn apply_with_role(
        &self,
        partition: PartitionId,
        key: &str,
        value: Option<Value>,
        version: CacheVersion,
        mut expires_at: Option<DateTime<Utc>>,
        require_primary: bool,
    ) -> Result<bool> {
        if value.is_none() && expires_at.is_none() {
            expires_at = Some(Utc::now() + Duration::seconds(TOMBSTONE_TTL_SECS));
        }
        let applied = {
            let mut shard = self.shard(partition)?.write().await;
            if require_primary && shard.role != PartitionRole::Primary {
                return Err(GridError::RetryTopologyChange { partition });
            }
            match shard.entries.get_mut(key) {
                Some(entry) => entry.apply(value, version, expires_at),
                None => {
                    shard
                        .entries
                        .insert(key.to_string(), VersionedEntry::new(value, version, expires_at));
                    self.resident.fetch_add(1, Ordering::SeqCst);
                    true
                }
            }
        };
        if applied {
            self.policy.on_touch(partition, key);
        }
        Ok(applied)
    }

    /// Wire form of an entry for backup replication, or `None` if the key
    /// vanished between apply and replication.
    pub async fn replicated_form(
        &self,
        partition: PartitionId,
        key: &str,
    ) -> Result<Option<ReplicatedEntry>> {
        let shard = self.shard(partition)?.read().await;
        Ok(shard.entries.get(key).map(|e| e.to_replicated(key)))
    }

    // ------------------------------------------------------------------
    // Rebalance supply
    // ------------------------------------------------------------------

    /// One batch of a partition's entries in stable key order, starting at
    /// `from_index`. Tombstones travel too so removals cannot resurrect.
    pub async fn supply_batch(
        &self,
        partition: PartitionId,
        from_index: u64,
        batch: usize,
    ) -> Result<(Vec<ReplicatedEntry>, u64, bool)> {
        let shard = self.shard(partition)?.read().await;
        if shard.role == PartitionRole::Unowned {
            return Err(GridError::PartialFailure(format!(
                "partition {} is not hosted here",
                partition
            )));
        }
        let mut keys: Vec<&Key> = shard.entries.keys().collect();
        keys.sort();
        let total = keys.len() as u64;
        let entries: Vec<ReplicatedEntry> = keys
            .into_iter()
            .skip(from_index as usize)
            .take(batch)
            .map(|k| shard.entries[k].to_replicated(k))
            .collect();
        let next_index = from_index + entries.len() as u64;
        Ok((entries, next_index, next_index >= total))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drops every expired entry (tombstones included once their fence
    /// window passed). Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed_total = 0;
        for partition in 0..self.partitions() {
            let removed: Vec<ReplicatedEntry> = {
                let mut shard = self.shard(partition)?.write().await;
                let expired: Vec<Key> = shard
                    .entries
                    .iter()
                    .filter(|(_, e)| e.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                expired
                    .iter()
                    .filter_map(|k| shard.entries.remove(k).map(|e| e.to_replicated(k)))
                    .collect()
            };
            self.resident.fetch_sub(removed.len(), Ordering::SeqCst);
            removed_total += removed.len();
            for entry in removed {
                self.policy.on_remove(partition, &entry.key);
                if let Some(swap) = &self.swap {
                    swap.remove(partition, &entry.key).await?;
                }
                if entry.value.is_some() {
                    self.expiry.on_expire(partition, &entry);
                }
            }
        }
        Ok(removed_total)
    }

    /// Evicts until the policy is satisfied or no candidate qualifies.
    /// Evicted entries are swapped out first when swap is configured.
    pub async fn enforce_capacity(&self) -> Result<usize> {
        let mut evicted = 0;
        let budget = self.resident_entries();
        for _ in 0..budget {
            if !self.policy.over_capacity(self.resident_entries()) {
                break;
            }
            let Some((partition, key)) = self.policy.next_victim() else {
                break;
            };
            let victim = {
                let mut shard = self.shard(partition)?.write().await;
                let evictable = match shard.entries.get(&key) {
                    Some(entry) => self.policy.should_evict(entry),
                    None => {
                        drop(shard);
                        self.policy.on_remove(partition, &key);
                        continue;
                    }
                };
                if !evictable {
                    // Re-rank it so the scan can move on.
                    drop(shard);
                    self.policy.on_touch(partition, &key);
                    continue;
                }
                shard.entries.remove(&key).map(|e| e.to_replicated(&key))
            };
            if let Some(entry) = victim {
                self.resident.fetch_sub(1, Ordering::SeqCst);
                self.policy.on_remove(partition, &key);
                if let Some(swap) = &self.swap {
                    swap.swap_out(partition, entry).await?;
                }
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    #[cfg(test)]
    pub async fn keys(&self, partition: PartitionId) -> Vec<Key> {
        let shard = self.shards[partition as usize].read().await;
        let mut keys: Vec<Key> = shard.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn read_entry(
    entry: &VersionedEntry,
    now: DateTime<Utc>,
) -> (Option<Value>, Option<CacheVersion>) {
    if entry.is_tombstone() || entry.is_expired(now) {
        (None, Some(entry.version()))
    } else {
        (entry.value().cloned(), Some(entry.version()))
    }
}
