use crate::core::{NodeId, PartitionId, TopologyVersion};
use crate::tx::TxStats;

/// Point-in-time gauges and counters for one node.
#[derive(Debug, Clone)]
pub struct GridStats {
    pub node_id: NodeId,
    /// Latest topology version this node has seen.
    pub topology: TopologyVersion,
    /// Latest topology version this node has finished exchanging.
    pub ready_topology: TopologyVersion,
    pub resident_entries: usize,
    pub active_transactions: usize,
    pub staged_participants: usize,
    pub held_locks: usize,
    pub transactions: TxStats,
    pub exchanges_completed: u64,
    pub entries_pulled: u64,
    /// Partitions whose last rebalance found no healthy supplier.
    pub degraded_partitions: Vec<PartitionId>,
}

impl GridStats {
    pub fn is_ready(&self) -> bool {
        self.topology == self.ready_topology && self.topology != TopologyVersion::ZERO
    }
}

impl std::fmt::Display for GridStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{}' at {} (ready {}): {} entries, {} active tx, {} staged, {} locks, \
             {} committed, {} rolled back, {} conflicts",
            self.node_id,
            self.topology,
            self.ready_topology,
            self.resident_entries,
            self.active_transactions,
            self.staged_participants,
            self.held_locks,
            self.transactions.committed,
            self.transactions.rolled_back,
            self.transactions.conflicts
        )
    }
}
