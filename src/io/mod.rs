// ============================================================================
// Cache IO
// ============================================================================
//
// Correlated request/response plumbing on top of the cluster transport. A
// future is registered under a fresh correlation id before the request is
// sent; the matching reply completes it exactly once. Late or duplicate
// replies find no registration and are dropped. This layer never retries;
// retry policy belongs to the transaction manager.
//
// ============================================================================

pub mod future;
pub mod message;
pub mod transport;

pub use future::GridFuture;
pub use message::{CacheMessage, MessageBody};
pub use transport::{ClusterTransport, LoopbackTransport, MessageHandler};

use crate::core::{GridError, NodeId, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-node IO endpoint: owns the correlation id counter and the table of
/// in-flight requests.
pub struct GridIo {
    node_id: NodeId,
    transport: Arc<dyn ClusterTransport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, GridFuture<MessageBody>>>,
}

impl GridIo {
    pub fn new(node_id: impl Into<NodeId>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends a request and returns the future its reply will complete. A
    /// send failure completes the future immediately; it is never silently
    /// dropped.
    pub async fn request(&self, target: &str, body: MessageBody) -> GridFuture<MessageBody> {
        let id = self.allocate_id();
        let fut = GridFuture::new();
        self.pending.lock().insert(id, fut.clone());
        let message = CacheMessage::request(self.node_id.clone(), id, body);
        if let Err(err) = self.transport.send(target, message).await {
            self.pending.lock().remove(&id);
            fut.fail(err);
        }
        fut
    }

    /// Request with a deadline. On expiry the registration is withdrawn so a
    /// late reply is dropped rather than completing a future nobody holds.
    pub async fn request_timeout(
        &self,
        target: &str,
        body: MessageBody,
        timeout: Duration,
        on_timeout: impl FnOnce() -> GridError,
    ) -> Result<MessageBody> {
        let id = self.allocate_id();
        let fut = GridFuture::new();
        self.pending.lock().insert(id, fut.clone());
        let message = CacheMessage::request(self.node_id.clone(), id, body);
        if let Err(err) = self.transport.send(target, message).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(on_timeout())
            }
        }
    }

    /// One-way message, no reply expected.
    pub async fn send(&self, target: &str, body: MessageBody) -> Result<()> {
        let message = CacheMessage::request(self.node_id.clone(), self.allocate_id(), body);
        self.transport.send(target, message).await
    }

    /// Replies to a received request.
    pub async fn respond(&self, target: &str, in_reply_to: u64, body: MessageBody) -> Result<()> {
        let message =
            CacheMessage::reply(self.node_id.clone(), self.allocate_id(), in_reply_to, body);
        self.transport.send(target, message).await
    }

    /// Routes an inbound reply to its registered future. `Failure` bodies
    /// fail the future with the carried error; anything else completes it.
    pub fn complete_response(&self, message: CacheMessage) {
        let Some(reply_id) = message.in_reply_to else {
            return;
        };
        let Some(fut) = self.pending.lock().remove(&reply_id) else {
            debug!(
                "no pending request {} on '{}', dropping late {} from '{}'",
                reply_id,
                self.node_id,
                message.body.kind(),
                message.from
            );
            return;
        };
        match message.body {
            MessageBody::Failure(err) => {
                fut.fail(err);
            }
            body => {
                fut.complete(body);
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fails every in-flight request. Called when the node stops so waiters
    /// observe `NodeStopped` instead of hanging.
    pub fn shutdown(&self) {
        let drained: Vec<(u64, GridFuture<MessageBody>)> =
            self.pending.lock().drain().collect();
        for (_, fut) in drained {
            fut.fail(GridError::NodeStopped(self.node_id.clone()));
        }
    }
}
