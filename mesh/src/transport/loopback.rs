//! In-memory loopback transport.
//!
//! Wires any number of nodes together inside one process: frames go
//! straight into the destination's event channel. Used by the integration
//! tests (where link topology matters — the hub can sever pairs to build
//! lines and partitions) and by single-host demo runs.
//!
//! Registers as the LAN class so pools and scoring treat it like a fast
//! local link.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::identity::NodeId;

use super::{Connection, Transport, TransportError, TransportEvent, TransportKind};

#[derive(Debug)]
struct HubInner {
    /// Event channel of every attached node.
    nodes: DashMap<NodeId, mpsc::Sender<TransportEvent>>,
    /// Severed links, stored as ordered pairs.
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl HubInner {
    fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn is_severed(&self, a: &NodeId, b: &NodeId) -> bool {
        self.severed.read().contains(&Self::link_key(a, b))
    }
}

/// The shared in-memory "network".
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                nodes: DashMap::new(),
                severed: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// A transport driver attaching `node` to this hub.
    pub fn transport_for(&self, node: &NodeId) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            hub: Arc::clone(&self.inner),
            me: node.clone(),
        })
    }

    /// Cuts the link between two nodes (both directions).
    pub fn sever(&self, a: &NodeId, b: &NodeId) {
        self.inner.severed.write().insert(HubInner::link_key(a, b));
    }

    /// Restores a severed link.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.inner.severed.write().remove(&HubInner::link_key(a, b));
    }

    /// Nodes currently attached.
    pub fn attached(&self) -> usize {
        self.inner.nodes.len()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

struct LoopbackTransport {
    hub: Arc<HubInner>,
    me: NodeId,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        self.hub.nodes.insert(self.me.clone(), events);
        Ok(())
    }

    async fn connect(&self, peer: &NodeId) -> Result<Arc<dyn Connection>, TransportError> {
        if !self.hub.nodes.contains_key(peer) {
            return Err(TransportError::PeerUnreachable(peer.short().to_string()));
        }
        Ok(Arc::new(LoopbackConnection {
            hub: Arc::clone(&self.hub),
            me: self.me.clone(),
            peer: peer.clone(),
        }))
    }

    async fn shutdown(&self) {
        self.hub.nodes.remove(&self.me);
    }
}

#[derive(Debug)]
struct LoopbackConnection {
    hub: Arc<HubInner>,
    me: NodeId,
    peer: NodeId,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.hub.is_severed(&self.me, &self.peer) {
            return Err(TransportError::SendFailed("link severed".into()));
        }
        let Some(events) = self.hub.nodes.get(&self.peer).map(|e| e.value().clone()) else {
            return Err(TransportError::Closed);
        };
        // Probe frames are accounted by the receiving manager and must not
        // reach the gossip layer; the loopback filters them like the real
        // drivers do.
        if bytes.starts_with(super::PROBE_MARKER) {
            return Ok(());
        }
        events
            .send(TransportEvent::Inbound {
                peer: self.me.clone(),
                kind: TransportKind::Lan,
                bytes: bytes.to_vec(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.hub.nodes.contains_key(&self.peer) && !self.hub.is_severed(&self.me, &self.peer)
    }

    async fn close(&self) {}
}
