// ============================================================================
// MVCC Version Stamp
// ============================================================================
//
// Every committed write carries a CacheVersion. Versions form a total order
// used to serialize concurrent writers: when a backup or a rebalancing stream
// applies an entry, the highest version wins regardless of arrival order.
//
// ============================================================================

use crate::core::types::TopologyVersion;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Globally comparable write version.
///
/// Ordered lexicographically by (topology version, per-node counter,
/// originating node order), so versions issued under a later topology always
/// win, and versions issued under the same topology are ordered by a
/// Lamport-style counter with the stable node order as the final tiebreak.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CacheVersion {
    pub topology: TopologyVersion,
    pub counter: u64,
    pub node_order: u64,
}

impl CacheVersion {
    pub fn new(topology: TopologyVersion, counter: u64, node_order: u64) -> Self {
        Self {
            topology,
            counter,
            node_order,
        }
    }
}

impl std::fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.topology.0, self.counter, self.node_order)
    }
}

/// Per-node source of `CacheVersion` stamps.
///
/// The counter only moves forward. `observe` folds in every version seen in
/// inbound messages, so a node that has witnessed version v can never issue a
/// version ordered below v under the same topology. This is what keeps commit
/// versions comparable cluster-wide even though each node stamps its own.
#[derive(Debug)]
pub struct VersionClock {
    node_order: AtomicU64,
    counter: AtomicU64,
}

impl VersionClock {
    pub fn new(node_order: u64) -> Self {
        Self {
            node_order: AtomicU64::new(node_order),
            counter: AtomicU64::new(0),
        }
    }

    pub fn node_order(&self) -> u64 {
        self.node_order.load(Ordering::SeqCst)
    }

    /// Sets the stable join order once the node learns it from the first
    /// topology it appears in.
    pub fn set_node_order(&self, order: u64) {
        self.node_order.store(order, Ordering::SeqCst);
    }

    /// Issues the next version under the given topology.
    pub fn next(&self, topology: TopologyVersion) -> CacheVersion {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        CacheVersion::new(topology, counter, self.node_order())
    }

    /// The highest version this node could have issued so far, without
    /// advancing the counter. Participants report it at prepare time so the
    /// commit version is stamped above everything they have seen.
    pub fn peek(&self, topology: TopologyVersion) -> CacheVersion {
        CacheVersion::new(topology, self.counter.load(Ordering::SeqCst), self.node_order())
    }

    /// Advances the local counter past a version received from another node.
    pub fn observe(&self, seen: CacheVersion) {
        let mut current = self.counter.load(Ordering::SeqCst);
        while current < seen.counter {
            match self.counter.compare_exchange(
                current,
                seen.counter,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_total_order() {
        let t1 = TopologyVersion(1);
        let t2 = TopologyVersion(2);

        // Later topology always wins.
        assert!(CacheVersion::new(t2, 1, 0) > CacheVersion::new(t1, 99, 5));
        // Same topology: counter decides.
        assert!(CacheVersion::new(t1, 7, 0) > CacheVersion::new(t1, 5, 9));
        // Same counter: node order is the tiebreak.
        assert!(CacheVersion::new(t1, 7, 2) > CacheVersion::new(t1, 7, 1));
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = VersionClock::new(3);
        let a = clock.next(TopologyVersion(1));
        let b = clock.next(TopologyVersion(1));
        assert!(b > a);
        assert_eq!(a.node_order, 3);
    }

    #[test]
    fn test_clock_observe_advances_counter() {
        let clock = VersionClock::new(1);
        clock.observe(CacheVersion::new(TopologyVersion(1), 40, 2));
        let next = clock.next(TopologyVersion(1));
        assert!(next.counter > 40);
    }

    #[test]
    fn test_clock_observe_never_rewinds() {
        let clock = VersionClock::new(1);
        clock.observe(CacheVersion::new(TopologyVersion(1), 40, 2));
        clock.observe(CacheVersion::new(TopologyVersion(1), 10, 2));
        let next = clock.next(TopologyVersion(1));
        assert!(next.counter > 40);
    }
}
