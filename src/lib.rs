// ============================================================================
// GridMemDB Library
// ============================================================================

pub mod core;
pub mod affinity;
pub mod topology;
pub mod io;
pub mod store;
pub mod exchange;
pub mod tx;
pub mod grid;

// Re-export main types for convenience
pub use crate::core::{
    CacheVersion, GridError, Key, NodeId, PartitionId, Result, TopologyVersion, Value,
};
pub use grid::{GridConfig, GridNode, GridStats, LocalGrid};
pub use topology::DiscoveryEvent;
pub use tx::{IsolationLevel, TxId, TxMode, TxState};

use std::sync::Arc;

// ============================================================================
// High-level Client API
// ============================================================================

/// Key-value client fronting one grid node.
///
/// This is the recommended way to use GridMemDB in applications. Single-key
/// calls run as one-shot transactions with transparent topology retries;
/// [`GridClient::begin_tx`] opens an explicit multi-key transaction.
///
/// # Examples
///
/// ```
/// use gridmemdb::GridClient;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let client = GridClient::standalone().await.unwrap();
///
/// client.put("user:1", json!({"name": "Alice"})).await.unwrap();
/// assert_eq!(
///     client.get("user:1").await.unwrap(),
///     Some(json!({"name": "Alice"})),
/// );
/// client.shutdown();
/// # });
/// ```
pub struct GridClient {
    node: Arc<GridNode>,
    /// Present when this client bootstrapped its own single-node grid.
    grid: Option<LocalGrid>,
}

impl GridClient {
    /// Boots a single-node grid with default configuration and connects to
    /// it. The grid lives as long as the client.
    pub async fn standalone() -> Result<Self> {
        Self::standalone_with_config(GridConfig::default()).await
    }

    /// Boots a single-node grid with custom configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gridmemdb::{GridClient, GridConfig};
    /// # tokio_test::block_on(async {
    /// let config = GridConfig::new(16, 0)
    ///     .tx_timeout(std::time::Duration::from_secs(5));
    ///
    /// let client = GridClient::standalone_with_config(config).await.unwrap();
    /// client.shutdown();
    /// # });
    /// ```
    pub async fn standalone_with_config(config: GridConfig) -> Result<Self> {
        let grid = LocalGrid::new(config)?;
        let node = grid.start_node("local").await?;
        Ok(Self {
            node,
            grid: Some(grid),
        })
    }

    /// Connects to an already running node of a cluster.
    pub fn attach(node: Arc<GridNode>) -> Self {
        Self { node, grid: None }
    }

    /// Reads a key from its current primary owner.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.node.get(key).await
    }

    /// Writes a key, replacing any previous value.
    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.node.put(key, value).await
    }

    /// Writes a key that expires after `ttl`.
    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: std::time::Duration,
    ) -> Result<()> {
        self.node.put_with_ttl(key, value, ttl).await
    }

    /// Removes a key everywhere it is replicated.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.node.remove(key).await
    }

    /// Opens a pessimistic serializable transaction.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gridmemdb::GridClient;
    /// # use serde_json::json;
    /// # tokio_test::block_on(async {
    /// # let client = GridClient::standalone().await.unwrap();
    /// let tx = client.begin_tx();
    /// tx.put("account:a", json!(90)).await.unwrap();
    /// tx.put("account:b", json!(110)).await.unwrap();
    /// tx.commit().await.unwrap();
    /// # client.shutdown();
    /// # });
    /// ```
    pub fn begin_tx(&self) -> TxHandle {
        self.begin_tx_with(TxMode::Pessimistic, IsolationLevel::Serializable)
    }

    /// Opens a transaction with explicit concurrency mode and isolation.
    pub fn begin_tx_with(&self, mode: TxMode, isolation: IsolationLevel) -> TxHandle {
        TxHandle {
            node: self.node.clone(),
            id: self.node.begin(mode, isolation),
        }
    }

    /// The node this client fronts.
    pub fn node(&self) -> &Arc<GridNode> {
        &self.node
    }

    pub fn stats(&self) -> GridStats {
        self.node.stats()
    }

    /// Stops the self-hosted grid, if this client bootstrapped one.
    /// Attached clients leave their cluster running.
    pub fn shutdown(&self) {
        if let Some(grid) = &self.grid {
            grid.shutdown();
        }
    }
}

/// One open transaction.
///
/// Consumed by [`TxHandle::commit`] or [`TxHandle::rollback`]. A handle
/// dropped without either is rolled back by the node's maintenance sweep
/// once its deadline passes.
pub struct TxHandle {
    node: Arc<GridNode>,
    id: TxId,
}

impl TxHandle {
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Transactional read; sees this transaction's own writes.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.node.tx_read(self.id, key).await
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.node.tx_write(self.id, key, value).await
    }

    pub async fn put_with_ttl(
        &self,
        key: &str,
        value: Value,
        ttl: std::time::Duration,
    ) -> Result<()> {
        self.node.tx_write_with_ttl(self.id, key, value, ttl).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.node.tx_remove(self.id, key).await
    }

    /// Runs two-phase commit across every participant primary. On failure
    /// the transaction is already rolled back when the error returns.
    pub async fn commit(self) -> Result<()> {
        self.node.commit(self.id).await
    }

    pub async fn rollback(self) -> Result<()> {
        self.node.rollback(self.id).await
    }
}
