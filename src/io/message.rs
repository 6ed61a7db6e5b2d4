// ============================================================================
// Wire Messages
// ============================================================================
//
// Every message travels in a `CacheMessage` envelope carrying the sender, a
// sender-unique correlation id and, for replies, the id being answered.
// Bodies are plain serde types; the transport owns the byte encoding.
//
// ============================================================================

use crate::core::{CacheVersion, GridError, Key, NodeId, PartitionId, TopologyVersion, Value};
use crate::store::entry::ReplicatedEntry;
use crate::tx::state::{TxId, TxMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMessage {
    pub from: NodeId,
    pub id: u64,
    pub in_reply_to: Option<u64>,
    pub body: MessageBody,
}

impl CacheMessage {
    pub fn request(from: impl Into<NodeId>, id: u64, body: MessageBody) -> Self {
        Self {
            from: from.into(),
            id,
            in_reply_to: None,
            body,
        }
    }

    pub fn reply(from: impl Into<NodeId>, id: u64, in_reply_to: u64, body: MessageBody) -> Self {
        Self {
            from: from.into(),
            id,
            in_reply_to: Some(in_reply_to),
            body,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    // Commit protocol.
    Prepare(PrepareRequest),
    Prepared(PrepareResponse),
    Finish(FinishRequest),
    FinishAck(FinishResponse),
    // Pessimistic locking.
    LockRequest(LockRequest),
    LockResponse(LockResponse),
    // Reads from the primary owner.
    Get(GetRequest),
    GetResponse(GetResponse),
    // Primary to backup replication.
    BackupApply(BackupApply),
    // Rebalancing.
    SupplyRequest(PartitionSupplyRequest),
    SupplyChunk(PartitionSupplyChunk),
    // Exchange protocol.
    ExchangeAck(ExchangeAck),
    ExchangeFinished(ExchangeFinished),
    // Typed failure reply; completes the requester's future with the error.
    Failure(GridError),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Prepare(_) => "Prepare",
            MessageBody::Prepared(_) => "Prepared",
            MessageBody::Finish(_) => "Finish",
            MessageBody::FinishAck(_) => "FinishAck",
            MessageBody::LockRequest(_) => "LockRequest",
            MessageBody::LockResponse(_) => "LockResponse",
            MessageBody::Get(_) => "Get",
            MessageBody::GetResponse(_) => "GetResponse",
            MessageBody::BackupApply(_) => "BackupApply",
            MessageBody::SupplyRequest(_) => "SupplyRequest",
            MessageBody::SupplyChunk(_) => "SupplyChunk",
            MessageBody::ExchangeAck(_) => "ExchangeAck",
            MessageBody::ExchangeFinished(_) => "ExchangeFinished",
            MessageBody::Failure(_) => "Failure",
        }
    }

    /// Apply-class messages are processed inline on the link task to keep
    /// their per-link order; anything that may wait on locks or remote state
    /// is offloaded by the dispatcher.
    pub fn is_apply_class(&self) -> bool {
        matches!(
            self,
            MessageBody::BackupApply(_)
                | MessageBody::SupplyChunk(_)
                | MessageBody::ExchangeAck(_)
                | MessageBody::ExchangeFinished(_)
        )
    }
}

/// One write staged by a transaction. `value: None` removes the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxWrite {
    pub partition: PartitionId,
    pub key: Key,
    pub value: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One read recorded by a serializable transaction, with the entry version
/// observed at read time (`None` when the key was absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRead {
    pub partition: PartitionId,
    pub key: Key,
    pub version: Option<CacheVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub tx: TxId,
    pub near_node: NodeId,
    pub topology: TopologyVersion,
    pub mode: TxMode,
    /// Writes owned by the receiving primary.
    pub writes: Vec<TxWrite>,
    /// Serializable reads owned by the receiving primary: validated under
    /// commit locks in optimistic mode, lock-checked in pessimistic mode.
    pub reads: Vec<TxRead>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub tx: TxId,
    /// Highest version the participant has stamped or applied; the
    /// coordinator observes it before choosing the commit version so commit
    /// versions stay comparable cluster-wide.
    pub high_version: CacheVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub tx: TxId,
    pub commit: bool,
    /// Present exactly when `commit` is true.
    pub commit_version: Option<CacheVersion>,
    pub topology: TopologyVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishResponse {
    pub tx: TxId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub tx: TxId,
    pub topology: TopologyVersion,
    pub partition: PartitionId,
    pub key: Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub tx: TxId,
    pub key: Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub topology: TopologyVersion,
    pub partition: PartitionId,
    pub key: Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<Value>,
    pub version: Option<CacheVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupApply {
    pub tx: TxId,
    pub partition: PartitionId,
    pub topology: TopologyVersion,
    pub entries: Vec<ReplicatedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSupplyRequest {
    pub partition: PartitionId,
    pub topology: TopologyVersion,
    /// Index of the first entry wanted; requesting index n acknowledges all
    /// entries before n.
    pub from_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSupplyChunk {
    pub partition: PartitionId,
    pub topology: TopologyVersion,
    pub entries: Vec<ReplicatedEntry>,
    pub next_index: u64,
    pub last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAck {
    pub version: TopologyVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeFinished {
    pub version: TopologyVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_carries_correlation() {
        let req = CacheMessage::request(
            "a",
            7,
            MessageBody::Get(GetRequest {
                topology: TopologyVersion(1),
                partition: 3,
                key: "k".to_string(),
            }),
        );
        assert!(!req.is_reply());

        let reply = CacheMessage::reply(
            "b",
            12,
            req.id,
            MessageBody::GetResponse(GetResponse {
                value: None,
                version: None,
            }),
        );
        assert_eq!(reply.in_reply_to, Some(7));
        assert!(reply.is_reply());
    }

    #[test]
    fn test_envelope_survives_msgpack() {
        let msg = CacheMessage::request(
            "node-1",
            42,
            MessageBody::ExchangeAck(ExchangeAck {
                version: TopologyVersion(5),
            }),
        );
        let bytes = rmp_serde::to_vec(&msg).unwrap();
        let back: CacheMessage = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.from, "node-1");
        assert_eq!(back.id, 42);
        match back.body {
            MessageBody::ExchangeAck(ack) => assert_eq!(ack.version, TopologyVersion(5)),
            other => panic!("unexpected body: {}", other.kind()),
        }
    }

    #[test]
    fn test_apply_class_split() {
        let apply = MessageBody::ExchangeFinished(ExchangeFinished {
            version: TopologyVersion(1),
        });
        assert!(apply.is_apply_class());

        let waits = MessageBody::LockRequest(LockRequest {
            tx: TxId::new(),
            topology: TopologyVersion(1),
            partition: 0,
            key: "k".to_string(),
        });
        assert!(!waits.is_apply_class());
    }
}
