// ============================================================================
// Affinity
// ============================================================================
//
// Maps keys to partitions and partitions to owning nodes. The key mapping is
// a fixed hash mod partition-count and never changes for the life of the
// grid. The partition-to-node mapping is recomputed per topology version
// with rendezvous hashing, so a membership change only moves the partitions
// that involve the affected node.
//
// ============================================================================

use crate::core::{fnv1a, GridError, NodeId, PartitionId, Result, TopologyVersion};
use crate::topology::TopologySnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Versions kept in the affinity cache behind the current one. Older maps
/// are only needed while in-flight requests stamped with them drain.
const KEPT_VERSIONS: u64 = 8;

/// Returns the partition a key belongs to. Pure and stable: depends only on
/// the key bytes and the configured partition count.
pub fn partition_for_key(key: &str, partitions: u32) -> PartitionId {
    (fnv1a(key.as_bytes()) % partitions as u64) as PartitionId
}

/// Ownership assignment for every partition at one topology version.
///
/// For each partition the owner list holds the primary first, then the
/// backups in deterministic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    version: TopologyVersion,
    owners: Vec<Vec<NodeId>>,
}

impl PartitionMap {
    /// Computes the assignment for a membership snapshot.
    ///
    /// Each partition ranks all live nodes by a rendezvous score and takes
    /// the top `backups + 1` as its owners. A joining or leaving node only
    /// changes the rankings it participates in, so partition movement stays
    /// proportional to the membership change.
    pub fn calculate(snapshot: &TopologySnapshot, partitions: u32, backups: usize) -> Self {
        let node_ids = snapshot.node_ids_sorted();
        let owners_per_partition = (backups + 1).min(node_ids.len().max(1));
        let mut owners = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let mut ranked: Vec<(u64, &NodeId)> = node_ids
                .iter()
                .map(|id| (rendezvous_score(id, partition), id))
                .collect();
            // Highest score first; node id breaks exact score ties.
            ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
            owners.push(
                ranked
                    .into_iter()
                    .take(owners_per_partition)
                    .map(|(_, id)| id.clone())
                    .collect(),
            );
        }
        PartitionMap {
            version: snapshot.version(),
            owners,
        }
    }

    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    pub fn partitions(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Owners of a partition, primary first.
    pub fn owners(&self, partition: PartitionId) -> &[NodeId] {
        self.owners
            .get(partition as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn primary(&self, partition: PartitionId) -> Option<&NodeId> {
        self.owners(partition).first()
    }

    pub fn backups(&self, partition: PartitionId) -> &[NodeId] {
        let owners = self.owners(partition);
        if owners.is_empty() { owners } else { &owners[1..] }
    }

    pub fn is_owner(&self, partition: PartitionId, node_id: &str) -> bool {
        self.owners(partition).iter().any(|n| n == node_id)
    }

    pub fn is_primary(&self, partition: PartitionId, node_id: &str) -> bool {
        self.primary(partition).map(|n| n == node_id).unwrap_or(false)
    }

    /// Partitions a node owns in any role.
    pub fn partitions_of(&self, node_id: &str) -> Vec<PartitionId> {
        (0..self.partitions())
            .filter(|p| self.is_owner(*p, node_id))
            .collect()
    }

    /// Partitions a node owns as primary.
    pub fn primary_partitions_of(&self, node_id: &str) -> Vec<PartitionId> {
        (0..self.partitions())
            .filter(|p| self.is_primary(*p, node_id))
            .collect()
    }

    /// Ownership changes for one node between two maps. Drives rebalancing:
    /// gained partitions must be demanded from their previous owners.
    pub fn delta_for(&self, newer: &PartitionMap, node_id: &str) -> AffinityDelta {
        let gained = (0..newer.partitions())
            .filter(|p| newer.is_owner(*p, node_id) && !self.is_owner(*p, node_id))
            .collect();
        let lost = (0..self.partitions())
            .filter(|p| self.is_owner(*p, node_id) && !newer.is_owner(*p, node_id))
            .collect();
        AffinityDelta { gained, lost }
    }
}

/// Partitions one node gains and loses across a topology change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityDelta {
    pub gained: Vec<PartitionId>,
    pub lost: Vec<PartitionId>,
}

fn rendezvous_score(node_id: &str, partition: PartitionId) -> u64 {
    let mut buf = Vec::with_capacity(node_id.len() + 5);
    buf.extend_from_slice(node_id.as_bytes());
    buf.push(b'/');
    buf.extend_from_slice(&partition.to_le_bytes());
    fnv1a(&buf)
}

/// Per-node cache of partition maps keyed by topology version.
///
/// Requests carry the topology version they were routed under; looking up a
/// version the cache no longer (or does not yet) hold yields `StaleTopology`
/// and the caller re-routes against the current map.
pub struct AffinityCache {
    partitions: u32,
    backups: usize,
    inner: RwLock<CacheInner>,
}

struct CacheInner {
    current: TopologyVersion,
    maps: HashMap<TopologyVersion, Arc<PartitionMap>>,
}

impl AffinityCache {
    pub fn new(partitions: u32, backups: usize) -> Self {
        Self {
            partitions,
            backups,
            inner: RwLock::new(CacheInner {
                current: TopologyVersion::ZERO,
                maps: HashMap::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn backups(&self) -> usize {
        self.backups
    }

    pub fn partition_for_key(&self, key: &str) -> PartitionId {
        partition_for_key(key, self.partitions)
    }

    /// Computes and installs the map for a snapshot, advancing the current
    /// version if the snapshot is newer. Returns the installed map.
    pub fn install(&self, snapshot: &TopologySnapshot) -> Arc<PartitionMap> {
        let map = Arc::new(PartitionMap::calculate(snapshot, self.partitions, self.backups));
        let mut inner = self.inner.write();
        inner.maps.insert(map.version(), Arc::clone(&map));
        if map.version() > inner.current {
            inner.current = map.version();
        }
        let floor = inner.current.as_u64().saturating_sub(KEPT_VERSIONS);
        inner.maps.retain(|v, _| v.as_u64() >= floor);
        map
    }

    pub fn current_version(&self) -> TopologyVersion {
        self.inner.read().current
    }

    /// The map for the current topology version, if any has been installed.
    pub fn current_map(&self) -> Option<Arc<PartitionMap>> {
        let inner = self.inner.read();
        inner.maps.get(&inner.current).cloned()
    }

    /// The map for a specific topology version.
    ///
    /// A miss means the requester routed against a topology this node has
    /// already moved past (or has not reached yet); either way the request
    /// must be retried against the current version.
    pub fn map_for(&self, version: TopologyVersion) -> Result<Arc<PartitionMap>> {
        let inner = self.inner.read();
        inner
            .maps
            .get(&version)
            .cloned()
            .ok_or(GridError::StaleTopology {
                requested: version,
                current: inner.current,
            })
    }
}
