//! # Transport Manager
//!
//! The fabric's front door: registered transport drivers, one
//! [`ConnectionPool`] per peer, probe and offline-detection loops, and the
//! peer-block list enforced on revocation.
//!
//! Everything above this layer (gossip, executor) sends bytes to node ids
//! and never sees connections, framing, or transport classes.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::clock::monotonic_ms;
use crate::config::{TransportScoreWeights, PEER_OFFLINE_SECS, PROBE_INTERVAL};
use crate::identity::NodeId;

use super::pool::ConnectionPool;
use super::{Transport, TransportError, TransportEvent, TransportKind, PROBE_MARKER};

/// Operational counters, exported through the node's metrics endpoint.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub sends_ok: AtomicU64,
    pub sends_failed: AtomicU64,
    pub probes_ok: AtomicU64,
    pub probes_failed: AtomicU64,
}

struct PeerState {
    pool: Arc<Mutex<ConnectionPool>>,
    offline: std::sync::atomic::AtomicBool,
}

/// Owns the per-peer pools and the registered transport drivers.
pub struct TransportManager {
    local_node: NodeId,
    weights: TransportScoreWeights,
    transports: RwLock<BTreeMap<TransportKind, Arc<dyn Transport>>>,
    peers: DashMap<NodeId, Arc<PeerState>>,
    blocked: RwLock<HashSet<NodeId>>,
    events_tx: mpsc::Sender<TransportEvent>,
    pub counters: TransportCounters,
}

impl TransportManager {
    /// `events_tx` receives inbound frames, discovery, and reachability
    /// transitions; the node loop consumes it.
    pub fn new(
        local_node: NodeId,
        weights: TransportScoreWeights,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            local_node,
            weights,
            transports: RwLock::new(BTreeMap::new()),
            peers: DashMap::new(),
            blocked: RwLock::new(HashSet::new()),
            events_tx,
            counters: TransportCounters::default(),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Registers a transport driver. Drivers for the same class replace
    /// each other; platform radio drivers register alongside the built-in
    /// LAN and relay ones.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let kind = transport.kind();
        self.transports.write().insert(kind, transport);
        info!(transport = %kind, "transport registered");
    }

    /// Starts every registered driver (listeners + discovery).
    pub async fn start(&self) -> Result<(), TransportError> {
        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().values().cloned().collect();
        for transport in transports {
            transport.start(self.events_tx.clone()).await?;
        }
        Ok(())
    }

    /// Closes all pools and drivers, highest-priority transports last
    /// (relay goes first so stragglers still have a LAN path).
    pub async fn shutdown(&self) {
        for entry in self.peers.iter() {
            entry.value().pool.lock().await.close_all().await;
        }
        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().values().rev().cloned().collect();
        for transport in transports {
            transport.shutdown().await;
        }
        info!("transport manager shut down");
    }

    // -- Peer bookkeeping -------------------------------------------------

    /// Ensures a pool exists for a peer (idempotent). Called on discovery
    /// and on first inbound contact.
    pub fn note_peer(&self, peer: &NodeId) {
        if peer == &self.local_node || self.is_blocked(peer) {
            return;
        }
        self.peers.entry(peer.clone()).or_insert_with(|| {
            debug!(peer = %peer.short(), "peer added to fabric");
            Arc::new(PeerState {
                pool: Arc::new(Mutex::new(ConnectionPool::new(
                    peer.clone(),
                    self.weights,
                ))),
                offline: std::sync::atomic::AtomicBool::new(false),
            })
        });
    }

    /// Currently known, unblocked peers.
    pub fn peers(&self) -> Vec<NodeId> {
        let blocked = self.blocked.read();
        self.peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| !blocked.contains(p))
            .collect()
    }

    /// Peers that are known and not currently marked offline.
    pub fn online_peers(&self) -> Vec<NodeId> {
        let blocked = self.blocked.read();
        self.peers
            .iter()
            .filter(|e| !e.value().offline.load(Ordering::Relaxed))
            .map(|e| e.key().clone())
            .filter(|p| !blocked.contains(p))
            .collect()
    }

    /// Forgets a peer entirely (NodeLeave).
    pub async fn drop_peer(&self, peer: &NodeId) {
        if let Some((_, state)) = self.peers.remove(peer) {
            state.pool.lock().await.close_all().await;
            debug!(peer = %peer.short(), "peer dropped from fabric");
        }
    }

    /// Blocks a peer (token revocation): closes its pool and refuses
    /// future sends and pools.
    pub async fn block_peer(&self, peer: &NodeId) {
        self.blocked.write().insert(peer.clone());
        self.drop_peer(peer).await;
        warn!(peer = %peer.short(), "peer blocked");
    }

    pub fn is_blocked(&self, peer: &NodeId) -> bool {
        self.blocked.read().contains(peer)
    }

    // -- Sending ----------------------------------------------------------

    /// Sends one frame to one peer through its pool.
    pub async fn send(&self, peer: &NodeId, bytes: &[u8]) -> Result<TransportKind, TransportError> {
        if self.is_blocked(peer) {
            return Err(TransportError::PeerBlocked);
        }
        self.note_peer(peer);
        let state = self
            .peers
            .get(peer)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TransportError::PeerUnreachable(peer.short().to_string()))?;

        let transports = self.transports.read().clone();
        let now = monotonic_ms() as f64 / 1000.0;
        let result = state.pool.lock().await.send(&transports, bytes, now).await;

        match &result {
            Ok(kind) => {
                self.counters.sends_ok.fetch_add(1, Ordering::Relaxed);
                trace!(peer = %peer.short(), transport = %kind, bytes = bytes.len(), "frame sent");
                if state.offline.swap(false, Ordering::Relaxed) {
                    let _ = self
                        .events_tx
                        .send(TransportEvent::PeerOnline { peer: peer.clone() })
                        .await;
                }
            }
            Err(_) => {
                self.counters.sends_failed.fetch_add(1, Ordering::Relaxed);
                self.check_offline(peer, &state, now).await;
            }
        }
        result
    }

    /// Parallel send to every known peer. Independent failures; returns
    /// how many deliveries succeeded.
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let peers = self.peers();
        let sends = peers.iter().map(|peer| self.send(peer, bytes));
        join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    // -- Probing & liveness -----------------------------------------------

    /// Background loop: every probe interval, exercise non-preferred
    /// transports for every peer and sweep for offline pools.
    pub async fn run_probe_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_round().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("probe loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One probe round across all peers.
    pub async fn probe_round(&self) {
        let transports = self.transports.read().clone();
        let now = monotonic_ms() as f64 / 1000.0;

        for entry in self.peers.iter() {
            let peer = entry.key().clone();
            let state = Arc::clone(entry.value());
            let mut pool = state.pool.lock().await;

            for kind in pool.probe_targets() {
                let Some(transport) = transports.get(&kind) else {
                    continue;
                };
                let started = std::time::Instant::now();
                let outcome = match transport.connect(&peer).await {
                    Ok(conn) => conn.send(PROBE_MARKER).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => {
                        let latency = started.elapsed().as_secs_f64() * 1000.0;
                        pool.record_probe(kind, Ok(latency));
                        pool.note_delivery(now);
                        self.counters.probes_ok.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        pool.record_probe(kind, Err(()));
                        self.counters.probes_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            drop(pool);
            self.check_offline(&peer, &state, now).await;
        }
    }

    /// Marks a peer offline after the no-delivery window and emits the
    /// transition event exactly once.
    async fn check_offline(&self, peer: &NodeId, state: &PeerState, now: f64) {
        let silent = state
            .pool
            .lock()
            .await
            .seconds_since_delivery(now)
            .unwrap_or(0.0);
        if silent > PEER_OFFLINE_SECS && !state.offline.swap(true, Ordering::Relaxed) {
            warn!(peer = %peer.short(), silent_secs = silent, "peer marked offline");
            let _ = self
                .events_tx
                .send(TransportEvent::PeerOffline { peer: peer.clone() })
                .await;
        }
    }

    /// Link metrics for diagnostics and the operator API.
    pub async fn peer_metrics(&self, peer: &NodeId) -> Vec<super::metrics::LinkMetrics> {
        match self.peers.get(peer) {
            Some(state) => state.pool.lock().await.metrics_snapshot(),
            None => Vec::new(),
        }
    }
}
