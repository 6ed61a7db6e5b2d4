// ============================================================================
// GridMemDB Demo
// ============================================================================
//
// Boots a three-node in-process grid, moves value between two keys in one
// transaction, then stops a node and shows the data surviving the handover.
//
// ============================================================================

use anyhow::Result;
use gridmemdb::{GridClient, GridConfig, LocalGrid};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let grid = LocalGrid::new(GridConfig::new(32, 1))?;
    let a = grid.start_node("a").await?;
    grid.start_node("b").await?;
    grid.start_node("c").await?;
    println!(
        "grid up: {} nodes, {} partitions",
        grid.node_count(),
        grid.config().partitions
    );

    let client = GridClient::attach(a);
    client.put("account:alice", json!(100)).await?;
    client.put("account:bob", json!(100)).await?;

    let tx = client.begin_tx();
    let alice = tx.get("account:alice").await?.and_then(|v| v.as_i64()).unwrap_or(0);
    let bob = tx.get("account:bob").await?.and_then(|v| v.as_i64()).unwrap_or(0);
    tx.put("account:alice", json!(alice - 40)).await?;
    tx.put("account:bob", json!(bob + 40)).await?;
    tx.commit().await?;
    println!(
        "transfer committed: alice={:?} bob={:?}",
        client.get("account:alice").await?,
        client.get("account:bob").await?
    );

    grid.stop_node("b").await?;
    println!(
        "node b left, account:bob now served by a surviving owner: {:?}",
        client.get("account:bob").await?
    );

    for stats in grid.stats() {
        println!("{stats}");
    }
    grid.shutdown();
    Ok(())
}
