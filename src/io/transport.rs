// ============================================================================
// Cluster Transport
// ============================================================================
//
// `LoopbackTransport` is the in-process transport: peers register a message
// handler, every send is msgpack-encoded and queued on a per-link FIFO
// channel, and one dispatch task per link decodes and hands messages to the
// receiving peer in send order. Severed links black-hole traffic so tests
// can force the timeout paths.
//
// ============================================================================

use crate::core::{GridError, NodeId, Result};
use crate::io::message::CacheMessage;
use async_trait::async_trait;
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiving side of the transport, implemented by the grid node.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: CacheMessage);
}

/// Sending side of the transport.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send(&self, target: &str, message: CacheMessage) -> Result<()>;
}

type Link = mpsc::UnboundedSender<Vec<u8>>;

#[derive(Default)]
struct TransportState {
    peers: HashMap<NodeId, Arc<dyn MessageHandler>>,
    links: HashMap<(NodeId, NodeId), Link>,
    severed: HashSet<(NodeId, NodeId)>,
}

/// In-process transport connecting every registered peer.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<TransportState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer node, enabling it to receive messages.
    pub fn register_peer(
        &self,
        node_id: impl Into<NodeId>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(GridError::InvalidConfig(
                "node_id must not be empty".to_string(),
            ));
        }
        self.state.lock().peers.insert(node_id, handler);
        Ok(())
    }

    /// Removes a peer. In-flight links to and from it are torn down and
    /// later sends fail with `Messaging`.
    pub fn unregister_peer(&self, node_id: &str) {
        let mut state = self.state.lock();
        state.peers.remove(node_id);
        state
            .links
            .retain(|(from, to), _| from != node_id && to != node_id);
    }

    /// Silently drops all traffic on the directed link `from -> to` until
    /// healed. Simulates a network partition.
    pub fn sever(&self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.state.lock().severed.insert((from.into(), to.into()));
    }

    pub fn heal(&self, from: &str, to: &str) {
        self.state
            .lock()
            .severed
            .remove(&(from.to_string(), to.to_string()));
    }

    fn link_for(&self, from: &str, to: &str) -> Result<Option<Link>> {
        let mut state = self.state.lock();
        if state.severed.contains(&(from.to_string(), to.to_string())) {
            return Ok(None);
        }
        let key = (from.to_string(), to.to_string());
        if let Some(link) = state.links.get(&key) {
            return Ok(Some(link.clone()));
        }
        let handler = state
            .peers
            .get(to)
            .cloned()
            .ok_or_else(|| GridError::Messaging(format!("node '{}' is not registered", to)))?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
        state.links.insert(key, sender.clone());
        drop(state);

        let link_from = from.to_string();
        let link_to = to.to_string();
        tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                match rmp_serde::from_slice::<CacheMessage>(&bytes) {
                    Ok(message) => handler.on_message(message).await,
                    Err(err) => {
                        error!(
                            "dropping undecodable message on link {}->{}: {}",
                            link_from, link_to, err
                        );
                    }
                }
            }
        });
        Ok(Some(sender))
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn send(&self, target: &str, message: CacheMessage) -> Result<()> {
        let Some(link) = self.link_for(&message.from, target)? else {
            debug!(
                "link {}->{} severed, dropping {}",
                message.from,
                target,
                message.body.kind()
            );
            return Ok(());
        };
        let bytes = rmp_serde::to_vec(&message)?;
        link.send(bytes)
            .map_err(|_| GridError::Messaging(format!("node '{}' is not reachable", target)))
    }
}
