//! # Node Orchestrator
//!
//! [`MeshNode`] assembles the whole stack and drives its lifecycle.
//!
//! Startup order matters and follows the dependency chain: identity →
//! configuration → transport fabric + discovery → gradient table and prune
//! loop → gossip engine → local capabilities → first announcement.
//! Shutdown runs the mirror image: removals for every local capability, a
//! leave message, a bounded drain of in-flight executions, then transports
//! close in reverse priority order.
//!
//! All background work hangs off one `watch` shutdown channel; every loop
//! observes it at its next suspension point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::MeshAuth;
use crate::capability::registry::CapabilityRegistry;
use crate::capability::{Capability, CapabilityId};
use crate::config::{NodeConfig, HOP_LATENCY_MS, SHUTDOWN_DRAIN_DEADLINE};
use crate::crypto::MeshKeypair;
use crate::embed::{CachedEmbedder, EmbeddingProvider, HashedEmbedder};
use crate::error::MeshError;
use crate::exec::{Executor, ToolHandler};
use crate::gossip::engine::{GossipEngine, ResourceSampler};
use crate::gossip::message::{Envelope, MessageKind, NodeJoinPayload};
use crate::identity::NodeId;
use crate::provider::{CapabilityProvider, ProviderHandler};
use crate::routing::{GradientTable, Intent, RouteContext, RouteDecision, SemanticRouter};
use crate::transport::{Transport, TransportEvent, TransportManager};
use crate::trigger::TriggerPipeline;

/// Lifecycle state of a mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// The assembled node: every subsystem plus the loops that animate them.
pub struct MeshNode {
    config: NodeConfig,
    keypair: MeshKeypair,
    node_id: NodeId,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<CapabilityRegistry>,
    table: Arc<GradientTable>,
    router: Arc<SemanticRouter>,
    transport: Arc<TransportManager>,
    engine: Arc<GossipEngine>,
    executor: Arc<Executor>,
    pipeline: Arc<TriggerPipeline>,
    auth: MeshAuth,
    status: RwLock<NodeStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Channel receivers handed to loops at start.
    wiring: Mutex<Option<Wiring>>,
    /// Capabilities owned by each provider (heartbeated only while that
    /// provider's health checks pass); everything else is heartbeated by
    /// the node itself.
    provider_caps: Mutex<HashMap<String, HashSet<CapabilityId>>>,
    providers: Mutex<Vec<Arc<dyn CapabilityProvider>>>,
}

/// Receivers wired at construction, consumed once at start.
struct Wiring {
    transport_events: mpsc::Receiver<TransportEvent>,
    trigger_fires: mpsc::Receiver<crate::capability::registry::TriggerFire>,
    remote_triggers: mpsc::Receiver<crate::gossip::message::TriggerEventPayload>,
    invokes: mpsc::Receiver<Envelope>,
    revoked: mpsc::Receiver<NodeId>,
}

impl MeshNode {
    /// Assembles a node from its configuration and identity keypair.
    ///
    /// `auth` carries the mesh id, founder key, and revocation list;
    /// `sampler` feeds resource snapshots into announcements (pass
    /// [`NoopSampler`] when none is available).
    pub fn new(
        config: NodeConfig,
        keypair: MeshKeypair,
        auth: MeshAuth,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(CachedEmbedder::new(Arc::new(HashedEmbedder::new())));

        let registry = Arc::new(CapabilityRegistry::new(
            node_id.clone(),
            Arc::clone(&embedder),
        ));
        let table = Arc::new(GradientTable::with_limits(
            node_id.clone(),
            config.limits.gradient_table_max,
            config.limits.expire_sec,
        ));
        let router = Arc::new(SemanticRouter::new(
            node_id.clone(),
            Arc::clone(&table),
            Arc::clone(&embedder),
        ));

        let (events_tx, transport_events) = mpsc::channel(crate::config::RECV_QUEUE_CAP);
        let transport = Arc::new(TransportManager::new(
            node_id.clone(),
            config.score_weights(),
            events_tx,
        ));

        // The mesh-level gossip interval wins over the generic limit.
        let mut limits = config.limits.clone();
        limits.announce_interval_sec = config.mesh.gossip_interval_sec.max(1);
        let engine = Arc::new(GossipEngine::new(
            keypair.clone(),
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&router),
            Arc::clone(&transport),
            auth.clone(),
            sampler,
            limits,
        ));
        let executor = Arc::new(Executor::new(
            keypair.clone(),
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&transport),
        ));
        let pipeline = Arc::new(TriggerPipeline::new(
            keypair.clone(),
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&router),
            Arc::clone(&executor),
            Arc::clone(&transport),
        ));

        // Wire the channels between subsystems.
        let (fires_tx, trigger_fires) = mpsc::channel(64);
        registry.set_trigger_sink(fires_tx);
        let (remote_tx, remote_triggers) = mpsc::channel(64);
        engine.set_trigger_sink(remote_tx);
        let (invoke_tx, invokes) = mpsc::channel(crate::config::RECV_QUEUE_CAP);
        engine.set_invoke_sink(invoke_tx);
        let (revoked_tx, revoked) = mpsc::channel(16);
        engine.set_revoked_sink(revoked_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            keypair,
            node_id,
            embedder,
            registry,
            table,
            router,
            transport,
            engine,
            executor,
            pipeline,
            auth,
            status: RwLock::new(NodeStatus::Stopped),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
            wiring: Mutex::new(Some(Wiring {
                transport_events,
                trigger_fires,
                remote_triggers,
                invokes,
                revoked,
            })),
            provider_caps: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
        }
    }

    // -- Accessors --------------------------------------------------------

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<GradientTable> {
        &self.table
    }

    pub fn router(&self) -> &Arc<SemanticRouter> {
        &self.router
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    pub fn engine(&self) -> &Arc<GossipEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn auth(&self) -> &MeshAuth {
        &self.auth
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Registers an additional transport driver (platform radios, test
    /// loopbacks). Call before `start`.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.transport.register_transport(transport);
    }

    // -- Lifecycle --------------------------------------------------------

    /// Runs the startup sequence and spawns all background loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        {
            let mut status = self.status.write();
            if *status != NodeStatus::Stopped {
                return Ok(());
            }
            *status = NodeStatus::Starting;
        }
        info!(node = %self.node_id.short(), name = %self.config.node_name, "starting mesh node");

        let Some(wiring) = self.wiring.lock().take() else {
            return Err(MeshError::routing_failed("node already started once"));
        };

        // Transport fabric + discovery.
        self.transport.start().await.map_err(|e| {
            MeshError::new(
                crate::error::ErrorCode::CapabilityOffline,
                format!("no usable transport: {e}"),
            )
        })?;

        // Background loops.
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_event_loop(wiring.transport_events));
        tasks.push(self.spawn_invoke_loop(wiring.invokes));
        tasks.push(self.spawn_remote_trigger_loop(wiring.remote_triggers));
        tasks.push(self.spawn_revocation_loop(wiring.revoked));
        tasks.push({
            let node = Arc::clone(self);
            let fires = wiring.trigger_fires;
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                node.pipeline.run(fires, shutdown).await;
            })
        });
        tasks.push({
            let node = Arc::clone(self);
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                node.engine.run_announce_loop(shutdown).await;
            })
        });
        tasks.push({
            let node = Arc::clone(self);
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                node.engine.run_prune_loop(shutdown).await;
            })
        });
        tasks.push({
            let node = Arc::clone(self);
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                node.transport.run_probe_loop(shutdown).await;
            })
        });
        tasks.push(self.spawn_heartbeat_loop());
        drop(tasks);

        // Announce ourselves: membership first, capabilities second.
        self.gossip_join().await;
        self.engine.announce().await;

        *self.status.write() = NodeStatus::Running;
        info!(node = %self.node_id.short(), "mesh node running");
        Ok(())
    }

    /// Graceful shutdown: removals, leave, bounded drain, transports down
    /// in reverse priority order.
    pub async fn shutdown(&self) {
        {
            let mut status = self.status.write();
            if *status != NodeStatus::Running {
                return;
            }
            *status = NodeStatus::ShuttingDown;
        }
        info!(node = %self.node_id.short(), "shutting down");

        // 1. Retract every local capability.
        for id in self.registry.list() {
            self.engine.gossip_removed(&id).await;
        }

        // 2. Say goodbye.
        self.engine.gossip_leave().await;

        // 3. Drain in-flight executions, bounded.
        let drain_started = std::time::Instant::now();
        while self.executor.in_flight() > 0 && drain_started.elapsed() < SHUTDOWN_DRAIN_DEADLINE {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if self.executor.in_flight() > 0 {
            warn!(
                remaining = self.executor.in_flight(),
                "drain deadline reached with executions in flight"
            );
        }

        // 4. Stop loops, then close transports (reverse priority order
        //    inside the manager).
        let _ = self.shutdown_tx.send(true);
        let providers: Vec<Arc<dyn CapabilityProvider>> = self.providers.lock().clone();
        for provider in providers {
            provider.disconnect().await;
        }
        self.transport.shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        *self.status.write() = NodeStatus::Stopped;
        info!(node = %self.node_id.short(), "mesh node stopped");
    }

    // -- Capabilities -----------------------------------------------------

    /// Registers a capability owned directly by this process, with the
    /// handler that executes its tools. The node heartbeats it as long as
    /// the process lives.
    pub async fn register_capability(
        &self,
        capability: Capability,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<CapabilityId, MeshError> {
        let id = self
            .registry
            .register(capability)
            .await
            .map_err(|e| MeshError::routing_failed(&format!("registration failed: {e}")))?;

        if let Some(vector) = self.registry.vector(&id) {
            let label = self
                .registry
                .get(&id)
                .map(|c| c.label)
                .unwrap_or_else(|| id.name().to_string());
            self.table.insert_local(id.clone(), label, vector, HOP_LATENCY_MS);
        }
        self.executor.register_handler(id.clone(), handler);
        Ok(id)
    }

    /// Removes a local capability and gossips the removal.
    pub async fn deregister_capability(&self, id: &CapabilityId) -> bool {
        let existed = self.registry.deregister(id);
        if existed {
            self.table.remove(id);
            self.engine.gossip_removed(id).await;
        }
        existed
    }

    /// Attaches a backend provider: discover → connect → register its
    /// capabilities with a provider-backed handler. Health checks drive
    /// their heartbeats.
    pub async fn add_provider(
        &self,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<Vec<CapabilityId>, MeshError> {
        if !provider.discover().await {
            return Err(MeshError::new(
                crate::error::ErrorCode::CapabilityOffline,
                format!("provider {} is not reachable", provider.name()),
            ));
        }
        let capabilities = provider.connect().await?;
        let handler = Arc::new(ProviderHandler::new(Arc::clone(&provider)));

        let mut ids = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let id = self
                .register_capability(capability, handler.clone())
                .await?;
            self.provider_caps
                .lock()
                .entry(provider.name().to_string())
                .or_default()
                .insert(id.clone());
            ids.push(id);
        }
        self.providers.lock().push(provider);
        Ok(ids)
    }

    // -- Routing & execution ----------------------------------------------

    /// Resolves an intent to a route decision (dry run; nothing executes).
    pub async fn route(
        &self,
        intent: Intent,
        ctx: &RouteContext,
    ) -> Result<RouteDecision, MeshError> {
        self.router.route(intent, ctx).await
    }

    /// Routes an intent and executes the named tool on the winner.
    pub async fn dispatch(
        &self,
        intent: Intent,
        tool_name: &str,
        params: serde_json::Value,
        context: serde_json::Value,
        ctx: &RouteContext,
    ) -> Result<serde_json::Value, MeshError> {
        let decision = self.router.route(intent, ctx).await?;
        let policy = self
            .registry
            .get_tool(&decision.capability_id, tool_name)
            .map(|t| t.policy)
            .unwrap_or_default();
        self.executor
            .execute(&decision, tool_name, params, context, &policy)
            .await
    }

    // -- Internal loops ---------------------------------------------------

    fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(TransportEvent::Inbound { peer, bytes, .. }) => {
                            node.engine.handle_message(&bytes, &peer).await;
                        }
                        Some(TransportEvent::PeerDiscovered { peer, kind }) => {
                            debug!(peer = %peer.short(), transport = %kind, "peer discovered");
                            node.transport.note_peer(&peer);
                        }
                        Some(TransportEvent::PeerOffline { peer }) => {
                            node.table.set_peer_offline(&peer, true);
                        }
                        Some(TransportEvent::PeerOnline { peer }) => {
                            node.table.set_peer_offline(&peer, false);
                        }
                        None => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_invoke_loop(self: &Arc<Self>, mut invokes: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = invokes.recv() => match envelope {
                        Some(envelope) => node.executor.handle_inbound(envelope).await,
                        None => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_remote_trigger_loop(
        self: &Arc<Self>,
        mut triggers: mpsc::Receiver<crate::gossip::message::TriggerEventPayload>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = triggers.recv() => match payload {
                        Some(payload) => node.pipeline.handle_remote_event(payload).await,
                        None => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    fn spawn_revocation_loop(self: &Arc<Self>, mut revoked: mpsc::Receiver<NodeId>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    peer = revoked.recv() => match peer {
                        // In-flight invocations through the revoked peer
                        // complete with auth_failed.
                        Some(peer) => node.executor.cancel_for_peer(&peer),
                        None => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Heartbeats process-owned capabilities and runs provider health
    /// checks. Provider-backed capabilities are heartbeated only while
    /// their provider reports healthy.
    fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let provider_caps = node.provider_caps.lock().clone();
                        let provider_owned: HashSet<&CapabilityId> =
                            provider_caps.values().flatten().collect();
                        for id in node.registry.list() {
                            if !provider_owned.contains(&id) {
                                node.registry.heartbeat(&id);
                            }
                        }
                        let providers: Vec<Arc<dyn CapabilityProvider>> =
                            node.providers.lock().clone();
                        for provider in providers {
                            let health = provider.health_check().await;
                            if health.healthy {
                                if let Some(ids) = provider_caps.get(provider.name()) {
                                    for id in ids {
                                        node.registry.heartbeat(id);
                                    }
                                }
                            } else {
                                debug!(provider = provider.name(), "provider unhealthy, heartbeats withheld");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn gossip_join(&self) {
        let payload = NodeJoinPayload {
            node_id: self.node_id.clone(),
            node_name: self.config.node_name.clone(),
            transports: enabled_transport_names(&self.config),
        };
        if let Ok(envelope) = Envelope::build(
            MessageKind::NodeJoin,
            &self.keypair,
            None,
            &payload,
            crate::config::ANNOUNCE_TTL,
        ) {
            self.transport.broadcast(&envelope.to_bytes()).await;
        }
    }
}

fn enabled_transport_names(config: &NodeConfig) -> Vec<String> {
    let t = &config.transports;
    [
        ("lan", t.lan.enabled),
        ("p2p_direct", t.p2p_direct.enabled),
        ("ble_mesh", t.ble_mesh.enabled),
        ("smart_home", t.smart_home.enabled),
        ("relay", t.relay.enabled),
    ]
    .iter()
    .filter(|(_, enabled)| *enabled)
    .map(|(name, _)| name.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RevocationList;
    use crate::gossip::engine::NoopSampler;
    use crate::capability::Tool;
    use crate::transport::loopback::LoopbackHub;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        async fn handle(
            &self,
            _tool: &Tool,
            params: serde_json::Value,
            _context: serde_json::Value,
        ) -> Result<serde_json::Value, MeshError> {
            Ok(params)
        }
    }

    fn test_node(hub: &LoopbackHub, seed: u8) -> Arc<MeshNode> {
        let keypair = MeshKeypair::from_seed(&[seed; 32]);
        let mut config = NodeConfig::default();
        config.node_id = keypair.public_key().to_hex();
        config.node_name = format!("node-{seed}");
        config.mesh.mesh_id = "testmesh".into();
        // Only the loopback transport in tests.
        config.transports.lan.enabled = true;
        config.transports.relay.enabled = false;

        let auth = MeshAuth::new("testmesh", None, Arc::new(RevocationList::in_memory()));
        let node = Arc::new(MeshNode::new(
            config,
            keypair,
            auth,
            Arc::new(NoopSampler),
        ));
        node.register_transport(hub.transport_for(node.node_id()));
        node
    }

    fn chat_capability() -> Capability {
        Capability {
            cap_type: "llm".into(),
            name: "chat".into(),
            label: "Chat".into(),
            description: "chat completion with a language model".into(),
            tools: vec![Tool::new("complete", "complete", json!({}))],
            triggers: vec![],
            metadata: serde_json::Map::new(),
            constraints: Default::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_start_and_shutdown() {
        let hub = LoopbackHub::new();
        let node = test_node(&hub, 1);
        assert_eq!(node.status(), NodeStatus::Stopped);

        node.start().await.expect("starts");
        assert_eq!(node.status(), NodeStatus::Running);
        assert!(node.engine().is_running());

        node.shutdown().await;
        assert_eq!(node.status(), NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn register_capability_pins_local_route() {
        let hub = LoopbackHub::new();
        let node = test_node(&hub, 1);
        node.start().await.unwrap();

        let id = node
            .register_capability(chat_capability(), Arc::new(Echo))
            .await
            .expect("registers");

        let entry = node.table().get(&id).expect("pinned");
        assert_eq!(entry.hops, 0);
        assert_eq!(&entry.next_hop, node.node_id());

        // Routable and executable end to end on the local node.
        let result = node
            .dispatch(
                Intent::text("chat completion with a language model"),
                "complete",
                json!({"prompt": "hello"}),
                json!({}),
                &RouteContext::default(),
            )
            .await
            .expect("dispatches");
        assert_eq!(result["prompt"], "hello");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn deregister_retracts_the_route() {
        let hub = LoopbackHub::new();
        let node = test_node(&hub, 1);
        node.start().await.unwrap();

        let id = node
            .register_capability(chat_capability(), Arc::new(Echo))
            .await
            .unwrap();
        assert!(node.deregister_capability(&id).await);
        assert!(node.table().get(&id).is_none());
        assert!(node.registry().get(&id).is_none());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn double_start_is_idempotent() {
        let hub = LoopbackHub::new();
        let node = test_node(&hub, 1);
        node.start().await.unwrap();
        node.start().await.unwrap();
        node.shutdown().await;
    }
}
