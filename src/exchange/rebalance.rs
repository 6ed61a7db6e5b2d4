// ============================================================================
// Rebalancer
// ============================================================================
//
// Demand-pull data movement. A node that gained a partition asks a previous
// owner for its entries in batches; requesting the next batch acknowledges
// the previous one. Every received entry goes through the store's
// compare-and-skip apply, so chunks arriving after newer transactional
// writes never win. Transactions do not wait for this: ownership is already
// confirmed, data trickles in behind them.
//
// ============================================================================

use crate::core::{GridError, NodeId, PartitionId, Result, TopologyVersion};
use crate::io::message::{MessageBody, PartitionSupplyRequest};
use crate::io::GridIo;
use crate::store::PartitionStore;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Rebalancer {
    io: Arc<GridIo>,
    store: Arc<PartitionStore>,
    batch: usize,
    supply_timeout: Duration,
    degraded: Mutex<HashSet<PartitionId>>,
    entries_pulled: AtomicU64,
}

impl Rebalancer {
    pub fn new(
        io: Arc<GridIo>,
        store: Arc<PartitionStore>,
        batch: usize,
        supply_timeout: Duration,
    ) -> Self {
        Self {
            io,
            store,
            batch,
            supply_timeout,
            degraded: Mutex::new(HashSet::new()),
            entries_pulled: AtomicU64::new(0),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Partitions whose last rebalance found no healthy supplier.
    pub fn degraded_partitions(&self) -> Vec<PartitionId> {
        let mut list: Vec<PartitionId> = self.degraded.lock().iter().copied().collect();
        list.sort();
        list
    }

    pub fn entries_pulled(&self) -> u64 {
        self.entries_pulled.load(Ordering::SeqCst)
    }

    /// Pulls one partition from the first supplier that answers. Suppliers
    /// are tried in order; when none can serve, the partition is marked
    /// degraded and the failure surfaces.
    pub async fn demand_partition(
        &self,
        partition: PartitionId,
        topology: TopologyVersion,
        suppliers: &[NodeId],
    ) -> Result<u64> {
        for supplier in suppliers {
            match self.pull_from(supplier, partition, topology).await {
                Ok(pulled) => {
                    self.degraded.lock().remove(&partition);
                    debug!(
                        "rebalanced partition {} from '{}': {} entries at {}",
                        partition, supplier, pulled, topology
                    );
                    return Ok(pulled);
                }
                Err(err) => {
                    warn!(
                        "supply of partition {} from '{}' failed: {}",
                        partition, supplier, err
                    );
                }
            }
        }
        self.degraded.lock().insert(partition);
        Err(GridError::PartialFailure(format!(
            "partition {} has no healthy supplier at {}",
            partition, topology
        )))
    }

    async fn pull_from(
        &self,
        supplier: &str,
        partition: PartitionId,
        topology: TopologyVersion,
    ) -> Result<u64> {
        let mut from_index = 0u64;
        let mut pulled = 0u64;
        loop {
            let request = MessageBody::SupplyRequest(PartitionSupplyRequest {
                partition,
                topology,
                from_index,
            });
            let body = self
                .io
                .request_timeout(supplier, request, self.supply_timeout, || {
                    GridError::PartialFailure(format!(
                        "supply of partition {} from '{}' timed out",
                        partition, supplier
                    ))
                })
                .await?;
            let chunk = match body {
                MessageBody::SupplyChunk(chunk) => chunk,
                other => {
                    return Err(GridError::Internal(format!(
                        "unexpected {} while rebalancing partition {}",
                        other.kind(),
                        partition
                    )));
                }
            };
            for entry in chunk.entries {
                self.store.apply_replicated(partition, entry).await?;
                pulled += 1;
            }
            from_index = chunk.next_index;
            if chunk.last {
                self.entries_pulled.fetch_add(pulled, Ordering::SeqCst);
                return Ok(pulled);
            }
        }
    }
}
