pub mod manager;
pub mod state;

pub use manager::{TxManager, TxStats};
pub use state::{IsolationLevel, TxId, TxMode, TxState};
