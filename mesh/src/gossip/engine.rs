//! # Gossip Engine
//!
//! Drives the epidemic exchange: periodic announcements and heartbeats out,
//! replay-protected ingestion and fan-out forwarding in.
//!
//! ## Ingestion pipeline
//!
//! Every inbound frame walks the same gauntlet, in order: parse →
//! revocation check → signature check → clock-skew check → nonce check →
//! per-originator ordering check → kind-specific handling → forward (for
//! gossiped kinds with TTL left). A message that fails any step is dropped
//! with a counter bump and no state change.
//!
//! ## What the engine owns
//!
//! Gossip *semantics*. Bytes move through the transport manager;
//! invocations and trigger events are handed to the executor and the node
//! loop through channels — the engine never executes anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::auth::MeshAuth;
use crate::capability::registry::CapabilityRegistry;
use crate::capability::CapabilityId;
use crate::clock::now_secs;
use crate::config::{
    Limits, HEARTBEAT_STALE_SECS, HOP_LATENCY_MS, MAX_CAPS_PER_ANNOUNCEMENT, PRUNE_INTERVAL,
    STALE_REMOVAL_SECS,
};
use crate::crypto::MeshKeypair;
use crate::identity::NodeId;
use crate::routing::{GradientTable, RouteAdvert, SemanticRouter};
use crate::transport::TransportManager;

use super::message::{
    AnnouncementPayload, Envelope, HeartbeatPayload, MessageKind, NodeJoinPayload,
    NodeLeavePayload, RemovedPayload, ResourceSnapshot, RouteUpdatePayload, TriggerEventPayload,
    UpdatePayload,
};
use super::nonce::NonceCache;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Source of the resource snapshot attached to announcements. The node
/// binary supplies a procfs-backed sampler; tests and minimal embeddings
/// use [`NoopSampler`].
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Option<ResourceSnapshot>;
}

/// A sampler that reports nothing.
pub struct NoopSampler;

impl ResourceSampler for NoopSampler {
    fn sample(&self) -> Option<ResourceSnapshot> {
        None
    }
}

/// Operational counters, exported through the node's metrics endpoint.
#[derive(Debug, Default)]
pub struct GossipCounters {
    pub announcements_sent: AtomicU64,
    pub announcements_received: AtomicU64,
    pub heartbeats_received: AtomicU64,
    /// Incremented on every replayed nonce (`gossip_duplicate_drop`).
    pub duplicate_drops: AtomicU64,
    pub skew_rejections: AtomicU64,
    pub signature_rejections: AtomicU64,
    pub malformed_drops: AtomicU64,
    pub stale_origin_drops: AtomicU64,
    pub forwards: AtomicU64,
    pub revocations_applied: AtomicU64,
}

/// What happened to one inbound frame. Returned for tests and metrics;
/// the engine has already applied all effects by the time this is handed
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A gossiped kind was accepted.
    Processed {
        gradient_updates: usize,
        forwarded_to: usize,
    },
    /// Replayed nonce; silently dropped.
    DuplicateNonce,
    /// Timestamp outside the skew window.
    SkewRejected,
    /// Signature did not verify against the claimed sender.
    BadSignature,
    /// Not parseable as an envelope (or payload shape mismatch).
    Malformed,
    /// Sender or originator is revoked.
    RevokedSender,
    /// Older than an already-processed message from the same originator.
    StaleOrigin,
    /// A trigger event was queued for routing.
    TriggerQueued,
    /// An invocation frame was queued for the executor.
    InvokeQueued,
    /// Valid but nothing to do (e.g. heartbeat for unknown ids).
    Ignored,
}

/// Liveness record for a known node.
#[derive(Debug, Clone, Copy, Default)]
struct PeerRecord {
    last_seen: f64,
    /// Timestamp of the newest message processed from this originator.
    /// Older arrivals are dropped to keep per-originator order.
    last_origin_timestamp: f64,
    load: f64,
    queue_depth: u32,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The epidemic gossip engine. See the module docs for the pipeline.
pub struct GossipEngine {
    node_id: NodeId,
    keypair: MeshKeypair,
    registry: Arc<CapabilityRegistry>,
    table: Arc<GradientTable>,
    router: Arc<SemanticRouter>,
    transport: Arc<TransportManager>,
    auth: MeshAuth,
    nonces: Arc<NonceCache>,
    peers: DashMap<NodeId, PeerRecord>,
    sampler: Arc<dyn ResourceSampler>,
    limits: Limits,
    pub counters: Arc<GossipCounters>,
    running: AtomicBool,
    /// Inbound trigger events, consumed by the node loop (routed once).
    trigger_tx: Mutex<Option<mpsc::Sender<TriggerEventPayload>>>,
    /// Inbound invoke request/response envelopes, consumed by the executor.
    invoke_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    /// Freshly enforced revocations, consumed by the node loop so the
    /// executor can cancel in-flight invocations through the peer.
    revoked_tx: Mutex<Option<mpsc::Sender<NodeId>>>,
}

impl GossipEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: MeshKeypair,
        registry: Arc<CapabilityRegistry>,
        table: Arc<GradientTable>,
        router: Arc<SemanticRouter>,
        transport: Arc<TransportManager>,
        auth: MeshAuth,
        sampler: Arc<dyn ResourceSampler>,
        limits: Limits,
    ) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        Self {
            node_id,
            keypair,
            registry,
            table,
            router,
            transport,
            auth,
            nonces: Arc::new(NonceCache::new()),
            peers: DashMap::new(),
            sampler,
            limits,
            counters: Arc::new(GossipCounters::default()),
            running: AtomicBool::new(false),
            trigger_tx: Mutex::new(None),
            invoke_tx: Mutex::new(None),
            revoked_tx: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wires the channel carrying inbound trigger events to the node loop.
    pub fn set_trigger_sink(&self, tx: mpsc::Sender<TriggerEventPayload>) {
        *self.trigger_tx.lock() = Some(tx);
    }

    /// Wires the channel carrying invocation envelopes to the executor.
    pub fn set_invoke_sink(&self, tx: mpsc::Sender<Envelope>) {
        *self.invoke_tx.lock() = Some(tx);
    }

    /// Wires the channel that reports enforced revocations upward.
    pub fn set_revoked_sink(&self, tx: mpsc::Sender<NodeId>) {
        *self.revoked_tx.lock() = Some(tx);
    }

    /// Last known load of a node, if it ever reported one.
    pub fn peer_load(&self, node: &NodeId) -> Option<f64> {
        self.peers.get(node).map(|r| r.load)
    }

    /// Known nodes and their last-seen timestamps.
    pub fn known_peers(&self) -> Vec<(NodeId, f64)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen))
            .collect()
    }

    // -- Outbound ---------------------------------------------------------

    /// Assembles this node's announcement: up to the per-message cap of
    /// fresh local projections plus a resource snapshot.
    pub fn build_announcement(&self) -> AnnouncementPayload {
        let mut capabilities = self.registry.projections();
        // Stale capabilities (no provider heartbeat) drop out of the
        // announcement; the removal sweep handles them separately.
        capabilities.retain(|info| {
            self.registry
                .seconds_since_heartbeat(&info.id)
                .map(|age| age < HEARTBEAT_STALE_SECS)
                .unwrap_or(false)
        });
        capabilities.truncate(MAX_CAPS_PER_ANNOUNCEMENT);

        AnnouncementPayload {
            from_node: self.node_id.clone(),
            capabilities,
            resources: self.sampler.sample(),
        }
    }

    /// Broadcasts one announcement round. Returns delivered peer count.
    pub async fn announce(&self) -> usize {
        let payload = self.build_announcement();
        let cap_count = payload.capabilities.len();
        let Ok(envelope) = Envelope::build(
            MessageKind::Announce,
            &self.keypair,
            None,
            &payload,
            crate::config::ANNOUNCE_TTL,
        ) else {
            return 0;
        };

        let delivered = self.transport.broadcast(&envelope.to_bytes()).await;
        self.counters
            .announcements_sent
            .fetch_add(1, Ordering::Relaxed);
        debug!(capabilities = cap_count, delivered, "announcement sent");
        delivered
    }

    /// Broadcasts a heartbeat: local capability ids plus load figures.
    pub async fn heartbeat(&self) -> usize {
        let snapshot = self.sampler.sample().unwrap_or_default();
        let payload = HeartbeatPayload {
            from_node: self.node_id.clone(),
            capability_ids: self.registry.list(),
            load: snapshot.load(),
            queue_depth: 0,
        };
        let Ok(envelope) = Envelope::build(
            MessageKind::Heartbeat,
            &self.keypair,
            None,
            &payload,
            crate::config::ANNOUNCE_TTL,
        ) else {
            return 0;
        };
        self.transport.broadcast(&envelope.to_bytes()).await
    }

    /// Gossips the removal of a local capability.
    pub async fn gossip_removed(&self, capability_id: &CapabilityId) {
        let payload = RemovedPayload {
            from_node: self.node_id.clone(),
            capability_id: capability_id.clone(),
        };
        if let Ok(envelope) = Envelope::build(
            MessageKind::Removed,
            &self.keypair,
            None,
            &payload,
            crate::config::ANNOUNCE_TTL,
        ) {
            self.transport.broadcast(&envelope.to_bytes()).await;
        }
    }

    /// Gossips this node's departure.
    pub async fn gossip_leave(&self) {
        let payload = NodeLeavePayload {
            node_id: self.node_id.clone(),
            reason: Some("shutdown".into()),
        };
        if let Ok(envelope) = Envelope::build(
            MessageKind::NodeLeave,
            &self.keypair,
            None,
            &payload,
            crate::config::ANNOUNCE_TTL,
        ) {
            self.transport.broadcast(&envelope.to_bytes()).await;
        }
    }

    // -- Inbound ----------------------------------------------------------

    /// Processes one inbound frame from a directly connected peer.
    pub async fn handle_message(&self, bytes: &[u8], from_peer: &NodeId) -> HandleOutcome {
        self.handle_message_at(bytes, from_peer, now_secs()).await
    }

    /// Ingestion with an explicit clock, for tests.
    pub async fn handle_message_at(
        &self,
        bytes: &[u8],
        from_peer: &NodeId,
        now: f64,
    ) -> HandleOutcome {
        // 1. Parse.
        let Ok(envelope) = Envelope::from_bytes(bytes) else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };

        // 2. Revoked senders get nothing, not even an error.
        if self.auth.is_revoked(&envelope.from) || self.auth.is_revoked(from_peer) {
            return HandleOutcome::RevokedSender;
        }

        // 3. Signature under the claimed sender's key.
        if !envelope.verify_signature() {
            self.counters
                .signature_rejections
                .fetch_add(1, Ordering::Relaxed);
            warn!(from = %envelope.from.short(), kind = ?envelope.kind, "invalid signature, dropped");
            return HandleOutcome::BadSignature;
        }

        // 4. Clock-skew bound.
        if (now - envelope.timestamp).abs() > self.limits.timestamp_skew_sec {
            self.counters.skew_rejections.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::SkewRejected;
        }

        // 5. Replay protection.
        if !self
            .nonces
            .check_and_insert_at(&envelope.nonce, envelope.timestamp, now)
        {
            self.counters.duplicate_drops.fetch_add(1, Ordering::Relaxed);
            trace!(nonce = %envelope.nonce, "duplicate nonce, dropped");
            return HandleOutcome::DuplicateNonce;
        }

        // 6. The direct sender is alive.
        self.touch_peer(from_peer, now);
        self.transport.note_peer(from_peer);

        // 7. Kind-specific handling.
        let outcome = match envelope.kind {
            MessageKind::Announce => self.handle_announce(&envelope, from_peer, now).await,
            MessageKind::Heartbeat => self.handle_heartbeat(&envelope, now),
            MessageKind::Removed => self.handle_removed(&envelope, now),
            MessageKind::Update => self.handle_update(&envelope),
            MessageKind::RouteUpdate => self.handle_route_update(&envelope, from_peer, now),
            MessageKind::TriggerEvent => self.handle_trigger_event(&envelope).await,
            MessageKind::NodeJoin => self.handle_node_join(&envelope, now),
            MessageKind::NodeLeave => self.handle_node_leave(&envelope).await,
            MessageKind::TokenRevoked => self.handle_token_revoked(&envelope).await,
            MessageKind::InvokeRequest | MessageKind::InvokeResponse => {
                self.handle_invoke(&envelope).await
            }
        };

        // 8. Epidemic forwarding for gossiped kinds.
        match outcome {
            HandleOutcome::Processed {
                gradient_updates, ..
            } if envelope.kind.is_gossiped() => {
                let forwarded_to = self.forward(&envelope, from_peer).await;
                HandleOutcome::Processed {
                    gradient_updates,
                    forwarded_to,
                }
            }
            other => other,
        }
    }

    async fn handle_announce(
        &self,
        envelope: &Envelope,
        from_peer: &NodeId,
        now: f64,
    ) -> HandleOutcome {
        // Capabilities are parsed one by one: a single unusable entry
        // (bad vector, wrong shape) is dropped and logged without taking
        // the rest of the announcement with it.
        #[derive(serde::Deserialize)]
        struct LenientAnnouncement {
            from_node: NodeId,
            #[serde(default)]
            capabilities: Vec<serde_json::Value>,
            #[serde(default)]
            resources: Option<ResourceSnapshot>,
        }
        let Ok(lenient) = envelope.payload_as::<LenientAnnouncement>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        let capabilities: Vec<crate::capability::CapabilityInfo> = lenient
            .capabilities
            .into_iter()
            .filter_map(|raw| match serde_json::from_value(raw) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(origin = %lenient.from_node.short(), "capability entry dropped: {e}");
                    None
                }
            })
            .collect();
        let payload = AnnouncementPayload {
            from_node: lenient.from_node,
            capabilities,
            resources: lenient.resources,
        };
        self.counters
            .announcements_received
            .fetch_add(1, Ordering::Relaxed);

        let origin = payload.from_node.clone();
        if origin == self.node_id {
            // Our own announcement came back around the mesh.
            return HandleOutcome::Ignored;
        }
        if self.auth.is_revoked(&origin) {
            return HandleOutcome::RevokedSender;
        }
        if !self.check_origin_order(&origin, envelope.timestamp) {
            self.counters
                .stale_origin_drops
                .fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::StaleOrigin;
        }
        self.touch_peer(&origin, now);

        if let Some(resources) = &payload.resources {
            let record_load = resources.load();
            self.set_peer_load(&origin, record_load, 0);
            self.router.set_node_load(origin.clone(), record_load);
        }

        // Turn projections into route adverts and apply them as one batch.
        let adverts: Vec<RouteAdvert> = payload
            .capabilities
            .iter()
            .take(MAX_CAPS_PER_ANNOUNCEMENT)
            .filter(|info| {
                // Never learn routes to our own capabilities, and never
                // through a revoked originator.
                info.id.node_id() != self.node_id.as_str()
                    && !info
                        .via
                        .as_ref()
                        .map(|v| self.auth.is_revoked(v))
                        .unwrap_or(false)
            })
            .map(|info| {
                let hops = if info.local {
                    1
                } else {
                    info.hops.saturating_add(1)
                };
                RouteAdvert {
                    capability_id: info.id.clone(),
                    label: info.label.clone(),
                    vector: info.vector.clone(),
                    hops,
                    next_hop: from_peer.clone(),
                    via: info.via.clone().unwrap_or_else(|| origin.clone()),
                    est_latency_ms: Some(info.est_latency_ms + HOP_LATENCY_MS),
                    constraints: info.constraints.clone(),
                }
            })
            .collect();

        let gradient_updates = self.table.update_many_at(adverts, now);
        trace!(
            origin = %origin.short(),
            updates = gradient_updates,
            "announcement applied"
        );
        HandleOutcome::Processed {
            gradient_updates,
            forwarded_to: 0,
        }
    }

    fn handle_heartbeat(&self, envelope: &Envelope, now: f64) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<HeartbeatPayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        self.counters
            .heartbeats_received
            .fetch_add(1, Ordering::Relaxed);

        let origin = payload.from_node.clone();
        if !self.check_origin_order(&origin, envelope.timestamp) {
            self.counters
                .stale_origin_drops
                .fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::StaleOrigin;
        }
        self.touch_peer(&origin, now);
        self.set_peer_load(&origin, payload.load, payload.queue_depth);
        self.router.set_node_load(origin, payload.load);

        // Refresh only; heartbeats never create entries. The refresh is
        // monotonic in the message timestamp.
        let mut refreshed = 0usize;
        for id in &payload.capability_ids {
            if self.table.refresh_at(id, envelope.timestamp) {
                refreshed += 1;
            }
        }
        if refreshed == 0 {
            return HandleOutcome::Ignored;
        }
        HandleOutcome::Processed {
            gradient_updates: refreshed,
            forwarded_to: 0,
        }
    }

    fn handle_removed(&self, envelope: &Envelope, now: f64) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<RemovedPayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        let removed = self.table.remove_at(&payload.capability_id, now);
        debug!(capability = %payload.capability_id, removed, "removal processed");
        HandleOutcome::Processed {
            gradient_updates: usize::from(removed),
            forwarded_to: 0,
        }
    }

    fn handle_update(&self, envelope: &Envelope) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<UpdatePayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        // Metadata only; an update for an unknown id creates nothing.
        let changed =
            self.table
                .update_meta(&payload.capability_id, payload.label, payload.est_latency_ms);
        if changed {
            HandleOutcome::Processed {
                gradient_updates: 1,
                forwarded_to: 0,
            }
        } else {
            HandleOutcome::Ignored
        }
    }

    fn handle_route_update(
        &self,
        envelope: &Envelope,
        from_peer: &NodeId,
        now: f64,
    ) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<RouteUpdatePayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        // Only refines routes to capabilities we already know; acceptance
        // stays hop-strict via the table's rules.
        let Some(existing) = self.table.get(&payload.capability_id) else {
            return HandleOutcome::Ignored;
        };
        let accepted = self.table.update_at(
            payload.capability_id,
            existing.label,
            existing.vector,
            payload.hops.saturating_add(1),
            from_peer.clone(),
            existing.via,
            Some(payload.est_latency_ms + HOP_LATENCY_MS),
            existing.constraints,
            now,
        );
        if accepted {
            HandleOutcome::Processed {
                gradient_updates: 1,
                forwarded_to: 0,
            }
        } else {
            HandleOutcome::Ignored
        }
    }

    async fn handle_trigger_event(&self, envelope: &Envelope) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<TriggerEventPayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        let sink = self.trigger_tx.lock().clone();
        match sink {
            Some(tx) => {
                if tx.send(payload).await.is_err() {
                    return HandleOutcome::Ignored;
                }
                HandleOutcome::TriggerQueued
            }
            None => HandleOutcome::Ignored,
        }
    }

    fn handle_node_join(&self, envelope: &Envelope, now: f64) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<NodeJoinPayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        if payload.node_id == self.node_id {
            return HandleOutcome::Ignored;
        }
        info!(node = %payload.node_id.short(), name = %payload.node_name, "node joined");
        self.touch_peer(&payload.node_id, now);
        self.transport.note_peer(&payload.node_id);
        HandleOutcome::Processed {
            gradient_updates: 0,
            forwarded_to: 0,
        }
    }

    async fn handle_node_leave(&self, envelope: &Envelope) -> HandleOutcome {
        let Ok(payload) = envelope.payload_as::<NodeLeavePayload>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        if payload.node_id == self.node_id {
            return HandleOutcome::Ignored;
        }
        info!(node = %payload.node_id.short(), reason = ?payload.reason, "node left");
        let purged = self.table.purge_node(&payload.node_id);
        self.transport.drop_peer(&payload.node_id).await;
        self.peers.remove(&payload.node_id);
        HandleOutcome::Processed {
            gradient_updates: purged,
            forwarded_to: 0,
        }
    }

    async fn handle_token_revoked(&self, envelope: &Envelope) -> HandleOutcome {
        let Ok(revocation) = envelope.payload_as::<crate::auth::SignedRevocation>() else {
            self.counters.malformed_drops.fetch_add(1, Ordering::Relaxed);
            return HandleOutcome::Malformed;
        };
        match self.auth.apply_revocation(&revocation) {
            Ok(true) => {
                self.counters
                    .revocations_applied
                    .fetch_add(1, Ordering::Relaxed);
                let revoked = revocation.revoked_node.clone();
                let purged = self.table.purge_node(&revoked);
                self.transport.block_peer(&revoked).await;
                self.peers.remove(&revoked);
                let sink = self.revoked_tx.lock().clone();
                if let Some(tx) = sink {
                    let _ = tx.send(revoked.clone()).await;
                }
                warn!(node = %revoked.short(), purged, "revocation enforced");
                HandleOutcome::Processed {
                    gradient_updates: purged,
                    forwarded_to: 0,
                }
            }
            // Already known: still a valid gossiped fact, worth forwarding.
            Ok(false) => HandleOutcome::Processed {
                gradient_updates: 0,
                forwarded_to: 0,
            },
            Err(e) => {
                self.counters
                    .signature_rejections
                    .fetch_add(1, Ordering::Relaxed);
                warn!("invalid revocation dropped: {e}");
                HandleOutcome::BadSignature
            }
        }
    }

    async fn handle_invoke(&self, envelope: &Envelope) -> HandleOutcome {
        let sink = self.invoke_tx.lock().clone();
        match sink {
            Some(tx) => {
                if tx.send(envelope.clone()).await.is_err() {
                    return HandleOutcome::Ignored;
                }
                HandleOutcome::InvokeQueued
            }
            None => HandleOutcome::Ignored,
        }
    }

    /// Forwards a gossiped envelope to up to `fanout` random peers,
    /// excluding the direct sender and the originator.
    ///
    /// Announcements and route updates are rewritten to this node's hop
    /// view before forwarding; everything else is relayed verbatim.
    async fn forward(&self, envelope: &Envelope, from_peer: &NodeId) -> usize {
        let forwarded = match envelope.kind {
            MessageKind::Announce => self.rewrite_announce(envelope),
            MessageKind::RouteUpdate => self.rewrite_route_update(envelope),
            _ => envelope.forwarded_by(&self.keypair),
        };
        let Some(forwarded) = forwarded else {
            return 0; // TTL spent or nothing left to say.
        };
        let origin = origin_of(envelope);

        let mut candidates: Vec<NodeId> = self
            .transport
            .online_peers()
            .into_iter()
            .filter(|p| p != from_peer && Some(p) != origin.as_ref() && p != &self.node_id)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.limits.fanout);

        let bytes = forwarded.to_bytes();
        let mut delivered = 0usize;
        for peer in &candidates {
            if self.transport.send(peer, &bytes).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered > 0 {
            self.counters
                .forwards
                .fetch_add(delivered as u64, Ordering::Relaxed);
            trace!(kind = ?envelope.kind, delivered, ttl = forwarded.ttl, "forwarded");
        }
        delivered
    }

    /// Rewrites an announcement's capability list to this node's hop
    /// view: one more hop, `local` cleared, latency aged, originator
    /// pinned as `via`.
    fn rewrite_announce(&self, envelope: &Envelope) -> Option<Envelope> {
        let payload: AnnouncementPayload = envelope.payload_as().ok()?;
        let origin = payload.from_node.clone();
        let capabilities = payload
            .capabilities
            .into_iter()
            .map(|mut info| {
                info.hops = if info.local {
                    1
                } else {
                    info.hops.saturating_add(1)
                };
                info.local = false;
                info.via = Some(info.via.unwrap_or_else(|| origin.clone()));
                info.est_latency_ms += HOP_LATENCY_MS;
                info
            })
            .collect();
        let rewritten = AnnouncementPayload {
            from_node: payload.from_node,
            capabilities,
            resources: payload.resources,
        };
        envelope.forwarded_with(&self.keypair, &rewritten)
    }

    /// Rewrites a route update's metric to this node's view.
    fn rewrite_route_update(&self, envelope: &Envelope) -> Option<Envelope> {
        let mut payload: RouteUpdatePayload = envelope.payload_as().ok()?;
        // Only forward metrics for routes we actually hold.
        self.table.get(&payload.capability_id)?;
        payload.hops = payload.hops.saturating_add(1);
        payload.est_latency_ms += HOP_LATENCY_MS;
        envelope.forwarded_with(&self.keypair, &payload)
    }

    // -- Background loops -------------------------------------------------

    /// The announce loop: alternating announcements and heartbeats, half
    /// the configured interval apart.
    pub async fn run_announce_loop(&self, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        let half = std::time::Duration::from_secs(
            (self.limits.announce_interval_sec / 2).max(1),
        );
        let mut ticker = tokio::time::interval(half);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut announce_turn = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if announce_turn {
                        self.announce().await;
                    } else {
                        self.heartbeat().await;
                    }
                    announce_turn = !announce_turn;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.running.store(false, Ordering::SeqCst);
                        debug!("announce loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// The prune loop: expired gradient entries, aged nonces, and the
    /// stale-capability sweep (no provider heartbeat for 15 minutes ⇒
    /// deregister + gossip removal).
    pub async fn run_prune_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.prune_round().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("prune loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One maintenance sweep.
    pub async fn prune_round(&self) {
        let expired = self.table.prune_expired();
        let nonces = self.nonces.prune();
        if expired > 0 || nonces > 0 {
            debug!(expired, nonces, "prune sweep");
        }

        // Local capabilities whose provider went silent.
        for id in self.registry.list() {
            let Some(stale_secs) = self.registry.seconds_since_heartbeat(&id) else {
                continue;
            };
            if stale_secs > STALE_REMOVAL_SECS {
                warn!(capability = %id, stale_secs, "provider silent, removing capability");
                self.registry.deregister(&id);
                self.table.remove(&id);
                self.gossip_removed(&id).await;
            }
        }
    }

    // -- Internals --------------------------------------------------------

    fn touch_peer(&self, node: &NodeId, now: f64) {
        if node == &self.node_id {
            return;
        }
        let mut record = self.peers.entry(node.clone()).or_default();
        if now > record.last_seen {
            record.last_seen = now;
        }
    }

    fn set_peer_load(&self, node: &NodeId, load: f64, queue_depth: u32) {
        let mut record = self.peers.entry(node.clone()).or_default();
        record.load = load;
        record.queue_depth = queue_depth;
    }

    /// Enforces per-originator timestamp order. Returns `false` when the
    /// message is older than one already processed from this originator.
    fn check_origin_order(&self, origin: &NodeId, timestamp: f64) -> bool {
        let mut record = self.peers.entry(origin.clone()).or_default();
        if timestamp < record.last_origin_timestamp {
            return false;
        }
        record.last_origin_timestamp = timestamp;
        true
    }
}

fn origin_of(envelope: &Envelope) -> Option<NodeId> {
    // Gossiped payloads carry their originator under `from_node` (or
    // `node_id` for membership messages).
    envelope
        .payload
        .get("from_node")
        .or_else(|| envelope.payload.get("node_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| NodeId::parse(s).ok())
}
