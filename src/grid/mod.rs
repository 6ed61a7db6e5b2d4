//! Node assembly and cluster drivers.
//!
//! [`GridNode`] wires the store, affinity, exchange, and transaction layers
//! of one node together behind the message handler; [`LocalGrid`] runs a
//! whole cluster of them in one process over the loopback transport.

pub mod config;
pub mod local;
pub mod node;
pub mod stats;

pub use config::GridConfig;
pub use local::LocalGrid;
pub use node::GridNode;
pub use stats::GridStats;
