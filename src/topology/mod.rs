// ============================================================================
// Cluster Topology
// ============================================================================
//
// Membership snapshots are immutable: applying a discovery event produces a
// new snapshot with the next topology version. Coordinator selection is a
// pure function over a snapshot (lowest join order among live nodes), so
// every node computes the same answer without shared mutable state.
//
// ============================================================================

use crate::core::{GridError, NodeId, Result, TopologyVersion};
use serde::{Deserialize, Serialize};

/// Membership change reported by the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
    NodeFailed(NodeId),
}

impl DiscoveryEvent {
    pub fn node_id(&self) -> &str {
        match self {
            DiscoveryEvent::NodeJoined(id)
            | DiscoveryEvent::NodeLeft(id)
            | DiscoveryEvent::NodeFailed(id) => id,
        }
    }
}

/// A live node together with its stable join order.
///
/// The join order is assigned once, when the node enters the cluster, and
/// never reused. It drives both coordinator selection ("oldest live node")
/// and the node-order component of `CacheVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub order: u64,
}

/// Immutable membership snapshot at one topology version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    version: TopologyVersion,
    /// Live nodes in join order (oldest first).
    nodes: im::Vector<NodeInfo>,
    /// Highest join order ever assigned, including departed nodes.
    max_order: u64,
}

impl TopologySnapshot {
    /// Empty cluster at version zero. The first join produces version one.
    pub fn empty() -> Self {
        Self {
            version: TopologyVersion::ZERO,
            nodes: im::Vector::new(),
            max_order: 0,
        }
    }

    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Live nodes in join order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    /// Node ids sorted lexicographically, for deterministic iteration.
    pub fn node_ids_sorted(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.node_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Stable join order of a live node.
    pub fn node_order(&self, node_id: &str) -> Option<u64> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .map(|n| n.order)
    }

    /// The exchange coordinator for this version: the oldest live node.
    ///
    /// Using join order keeps the rule stable under churn: the answer only
    /// changes when the current oldest node itself leaves.
    pub fn coordinator(&self) -> Option<&NodeInfo> {
        self.nodes.iter().min_by_key(|n| n.order)
    }

    /// Applies a membership change, producing the snapshot for the next
    /// topology version.
    pub fn apply(&self, event: &DiscoveryEvent) -> Result<TopologySnapshot> {
        let mut nodes = self.nodes.clone();
        let mut max_order = self.max_order;
        match event {
            DiscoveryEvent::NodeJoined(id) => {
                if id.trim().is_empty() {
                    return Err(GridError::InvalidConfig(
                        "node_id must not be empty".to_string(),
                    ));
                }
                if self.contains(id) {
                    return Err(GridError::Internal(format!(
                        "node '{}' is already part of the topology",
                        id
                    )));
                }
                max_order += 1;
                nodes.push_back(NodeInfo {
                    node_id: id.clone(),
                    order: max_order,
                });
            }
            DiscoveryEvent::NodeLeft(id) | DiscoveryEvent::NodeFailed(id) => {
                let before = nodes.len();
                nodes.retain(|n| n.node_id != *id);
                if nodes.len() == before {
                    return Err(GridError::Internal(format!(
                        "node '{}' is not part of the topology",
                        id
                    )));
                }
            }
        }
        Ok(TopologySnapshot {
            version: self.version.next(),
            nodes,
            max_order,
        })
    }
}

/// Callback used to declare nodes failed when they miss a protocol deadline
/// (e.g. an exchange acknowledgement). Implemented by the discovery layer.
pub trait FailureReporter: Send + Sync {
    fn report_failed(&self, node_id: &str);
}

/// Reporter that drops failure reports on the floor; used where failure
/// detection is driven externally.
pub struct NoopFailureReporter;

impl FailureReporter for NoopFailureReporter {
    fn report_failed(&self, _node_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> TopologySnapshot {
        let mut snap = TopologySnapshot::empty();
        for id in ["a", "b", "c"] {
            snap = snap.apply(&DiscoveryEvent::NodeJoined(id.to_string())).unwrap();
        }
        snap
    }

    #[test]
    fn test_versions_increment_once_per_change() {
        let snap = three_nodes();
        assert_eq!(snap.version(), TopologyVersion(3));
        assert_eq!(snap.node_count(), 3);
    }

    #[test]
    fn test_join_orders_are_stable_and_unique() {
        let snap = three_nodes();
        assert_eq!(snap.node_order("a"), Some(1));
        assert_eq!(snap.node_order("c"), Some(3));

        // Orders are never reused after a departure.
        let snap = snap.apply(&DiscoveryEvent::NodeFailed("b".to_string())).unwrap();
        let snap = snap.apply(&DiscoveryEvent::NodeJoined("d".to_string())).unwrap();
        assert_eq!(snap.node_order("d"), Some(4));
    }

    #[test]
    fn test_coordinator_is_oldest_live_node() {
        let snap = three_nodes();
        assert_eq!(snap.coordinator().unwrap().node_id, "a");

        let snap = snap.apply(&DiscoveryEvent::NodeLeft("a".to_string())).unwrap();
        assert_eq!(snap.coordinator().unwrap().node_id, "b");
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let snap = three_nodes();
        assert!(snap.apply(&DiscoveryEvent::NodeJoined("a".to_string())).is_err());
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let snap = three_nodes();
        let _later = snap.apply(&DiscoveryEvent::NodeLeft("c".to_string())).unwrap();
        // The original snapshot still sees node c.
        assert!(snap.contains("c"));
    }
}
