pub mod error;
pub mod types;
pub mod version;

pub use error::{GridError, Result};
pub use types::{Key, NodeId, PartitionId, TopologyVersion, Value, fnv1a};
pub use version::{CacheVersion, VersionClock};
