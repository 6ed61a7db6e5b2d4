// ============================================================================
// Versioned Entries
// ============================================================================

use crate::core::{CacheVersion, Key, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Prior versions kept per entry so snapshot reads can resolve a value at an
/// older version without write locks.
pub const MAX_HISTORY: usize = 8;

/// One key's state inside a partition. `value: None` is a tombstone: the key
/// was removed, and the version records when, so a slower replica or a late
/// rebalance chunk cannot resurrect it.
#[derive(Debug, Clone)]
pub struct VersionedEntry {
    value: Option<Value>,
    version: CacheVersion,
    expires_at: Option<DateTime<Utc>>,
    history: VecDeque<(CacheVersion, Option<Value>)>,
}

impl VersionedEntry {
    pub fn new(value: Option<Value>, version: CacheVersion, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            version,
            expires_at,
            history: VecDeque::new(),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn version(&self) -> CacheVersion {
        self.version
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Applies a newer version, pushing the current one into the bounded
    /// history. Returns false (and changes nothing) when `version` is not
    /// strictly newer than the stored one, so replays and reordered
    /// replication converge on the highest version.
    pub fn apply(
        &mut self,
        value: Option<Value>,
        version: CacheVersion,
        expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        if version <= self.version {
            return false;
        }
        self.history.push_front((self.version, self.value.take()));
        self.history.truncate(MAX_HISTORY);
        self.value = value;
        self.version = version;
        self.expires_at = expires_at;
        true
    }

    /// The value as of `at`: the newest version not exceeding it. `None`
    /// means the key did not exist (or its version fell out of history) at
    /// that point.
    pub fn value_at(&self, at: CacheVersion) -> Option<&Value> {
        if self.version <= at {
            return self.value.as_ref();
        }
        self.history
            .iter()
            .find(|(v, _)| *v <= at)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn to_replicated(&self, key: &str) -> ReplicatedEntry {
        ReplicatedEntry {
            key: key.to_string(),
            value: self.value.clone(),
            version: self.version,
            expires_at: self.expires_at,
        }
    }

    pub fn from_replicated(entry: ReplicatedEntry) -> (Key, Self) {
        (
            entry.key,
            Self::new(entry.value, entry.version, entry.expires_at),
        )
    }
}

/// Wire form of an entry, carried by backup application and rebalance
/// supply. Keeps the version so the receiver's compare-and-skip works and a
/// swapped-out entry reloads with its last known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    pub key: Key,
    pub value: Option<Value>,
    pub version: CacheVersion,
    pub expires_at: Option<DateTime<Utc>>,
}
