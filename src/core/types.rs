use serde::{Deserialize, Serialize};

/// Cache keys are plain strings; values are arbitrary JSON documents.
pub type Key = String;
pub type Value = serde_json::Value;

/// Identifier of a fixed logical shard of the keyspace.
pub type PartitionId = u32;

/// Identifier of a cluster node.
pub type NodeId = String;

/// Monotonic counter for cluster membership snapshots.
///
/// Incremented exactly once per membership change (join, leave, crash
/// detection). All nodes agree on the partition map for a version once the
/// exchange for that version has reached `Ready`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TopologyVersion(pub u64);

impl TopologyVersion {
    pub const ZERO: TopologyVersion = TopologyVersion(0);

    pub fn next(self) -> Self {
        TopologyVersion(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "topo_{}", self.0)
    }
}

/// FNV-1a hash, the stable key hash used for partition resolution and the
/// global lock-acquisition order.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 14695981039346656037u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}
