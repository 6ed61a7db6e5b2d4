// ============================================================================
// Local Grid
// ============================================================================
//
// An in-process cluster: every node shares one loopback transport and this
// driver plays the discovery collaborator. Membership events are delivered
// to live nodes in join order, which puts the exchange coordinator first,
// and the full event history is kept so a joining node can replay it and
// converge on the same membership snapshot as everyone else.
//
// ============================================================================

use super::config::GridConfig;
use super::node::GridNode;
use super::stats::GridStats;
use crate::core::{GridError, Result, TopologyVersion};
use crate::io::{ClusterTransport, LoopbackTransport};
use crate::topology::{DiscoveryEvent, FailureReporter};
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct LocalGrid {
    inner: Arc<GridInner>,
}

struct GridInner {
    config: GridConfig,
    transport: Arc<LoopbackTransport>,
    /// Live nodes in join order; index zero is the oldest.
    nodes: Mutex<Vec<Arc<GridNode>>>,
    /// Every membership event ever applied, for replay into joiners.
    events: Mutex<Vec<DiscoveryEvent>>,
}

/// Routes missed-deadline reports from any node's exchange back into the
/// discovery layer as a node failure.
struct GridFailureReporter {
    grid: Weak<GridInner>,
}

impl FailureReporter for GridFailureReporter {
    fn report_failed(&self, node_id: &str) {
        let Some(inner) = self.grid.upgrade() else {
            return;
        };
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = inner.remove(&node_id, true).await {
                warn!("failure report for '{}' not applied: {}", node_id, err);
            }
        });
    }
}

impl GridInner {
    fn node(&self, node_id: &str) -> Option<Arc<GridNode>> {
        self.nodes
            .lock()
            .iter()
            .find(|n| n.node_id() == node_id)
            .cloned()
    }

    /// Delivers one event to every live node in join order, then to the
    /// joining node. All nodes derive the same version from it.
    async fn deliver(
        &self,
        event: &DiscoveryEvent,
        joiner: Option<&Arc<GridNode>>,
    ) -> Result<TopologyVersion> {
        let nodes: Vec<Arc<GridNode>> = self.nodes.lock().clone();
        let mut version = None;
        for node in nodes.iter().chain(joiner) {
            let v = node.on_discovery(event).await?;
            version.get_or_insert(v);
        }
        version.ok_or_else(|| {
            GridError::Internal("no live nodes to deliver the event to".to_string())
        })
    }

    /// Waits until every live node has finished exchanging the version.
    async fn await_ready(&self, version: TopologyVersion) -> Result<()> {
        let nodes: Vec<Arc<GridNode>> = self.nodes.lock().clone();
        let waits = nodes.iter().map(|n| n.exchange().await_ready(version));
        match tokio::time::timeout(self.config.exchange_ack_timeout, join_all(waits)).await {
            Ok(results) => {
                for result in results {
                    result?;
                }
                Ok(())
            }
            Err(_) => Err(GridError::Internal(format!(
                "exchange {} did not become ready in time",
                version
            ))),
        }
    }

    /// Takes a node out of the cluster. `failed` distinguishes a detected
    /// crash from a graceful leave; the membership event differs, the
    /// mechanics do not.
    async fn remove(&self, node_id: &str, failed: bool) -> Result<()> {
        let node = {
            let mut nodes = self.nodes.lock();
            let Some(index) = nodes.iter().position(|n| n.node_id() == node_id) else {
                return Err(GridError::InvalidConfig(format!(
                    "node '{}' is not part of this grid",
                    node_id
                )));
            };
            nodes.remove(index)
        };
        self.transport.unregister_peer(node_id);
        node.stop();

        let event = if failed {
            DiscoveryEvent::NodeFailed(node_id.to_string())
        } else {
            DiscoveryEvent::NodeLeft(node_id.to_string())
        };
        if self.nodes.lock().is_empty() {
            self.events.lock().push(event);
            debug!("last node '{}' removed, grid is empty", node_id);
            return Ok(());
        }
        let version = self.deliver(&event, None).await?;
        self.events.lock().push(event);
        self.await_ready(version).await
    }
}

impl LocalGrid {
    pub fn new(config: GridConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(GridInner {
                config,
                transport: Arc::new(LoopbackTransport::new()),
                nodes: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Boots a node and joins it to the cluster: replay the membership
    /// history, deliver the join to everyone, wait until the exchange is
    /// ready on all nodes.
    pub async fn start_node(&self, node_id: &str) -> Result<Arc<GridNode>> {
        if self.inner.node(node_id).is_some() {
            return Err(GridError::InvalidConfig(format!(
                "node '{}' is already part of this grid",
                node_id
            )));
        }
        let reporter = Arc::new(GridFailureReporter {
            grid: Arc::downgrade(&self.inner),
        });
        let node = GridNode::new(
            node_id,
            self.inner.config.clone(),
            Arc::clone(&self.inner.transport) as Arc<dyn ClusterTransport>,
            reporter,
        )?;
        self.inner.transport.register_peer(node_id, node.clone())?;
        node.start();

        let history: Vec<DiscoveryEvent> = self.inner.events.lock().clone();
        for event in &history {
            node.on_discovery(event).await?;
        }

        let event = DiscoveryEvent::NodeJoined(node_id.to_string());
        let version = self.inner.deliver(&event, Some(&node)).await?;
        self.inner.events.lock().push(event);
        self.inner.nodes.lock().push(node.clone());
        self.inner.await_ready(version).await?;
        debug!("node '{}' joined at {}", node_id, version);
        Ok(node)
    }

    /// Graceful leave: the node stops and the survivors take over its
    /// partitions, pulling data from the remaining owners.
    pub async fn stop_node(&self, node_id: &str) -> Result<()> {
        self.inner.remove(node_id, false).await
    }

    /// Simulated crash: the node disappears without handover and the
    /// survivors recover from backup copies.
    pub async fn fail_node(&self, node_id: &str) -> Result<()> {
        self.inner.remove(node_id, true).await
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<GridNode>> {
        self.inner.node(node_id)
    }

    pub fn nodes(&self) -> Vec<Arc<GridNode>> {
        self.inner.nodes.lock().clone()
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    /// The shared transport, for severing and healing links in tests.
    pub fn transport(&self) -> &Arc<LoopbackTransport> {
        &self.inner.transport
    }

    pub fn stats(&self) -> Vec<GridStats> {
        self.inner
            .nodes
            .lock()
            .iter()
            .map(|n| n.stats())
            .collect()
    }

    /// Waits until every node is ready on its current topology with no
    /// rebalance pulls outstanding. Readiness itself never waits for data
    /// movement; call this when a test needs the data settled too.
    pub async fn quiesce(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.inner.nodes.lock().iter().all(|n| {
                let exchange = n.exchange();
                let version = exchange.current_version();
                exchange.is_ready(version) && exchange.pending_rebalance(version) == 0
            });
            if settled {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GridError::Internal(format!(
                    "grid did not quiesce within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stops every node without membership events. Tear-down only.
    pub fn shutdown(&self) {
        for node in self.inner.nodes.lock().drain(..) {
            node.stop();
        }
    }
}
