//! # Trigger Pipeline
//!
//! Turns capability-originated events into routed intents:
//!
//! 1. Look up the trigger definition.
//! 2. Throttle gate — a per-(capability, event) *monotonic* clock gate,
//!    not a sliding window, so an idle period cannot bank a burst.
//!    `critical` priority bypasses the gate.
//! 3. Render the intent template against payload + capability metadata.
//! 4. Route: a `route_hint` (capability-id glob or type prefix) is tried
//!    against the gradient table first; semantic routing is the fallback.
//! 5. Deliver: execute locally when this node wins the route, otherwise
//!    send a `trigger_event` to the chosen peer — fire and forget.
//!
//! A received trigger event is handled locally or dropped; the sender
//! already routed it once, and routing it onward again would reintroduce
//! the broadcast storms the routed-once rule exists to prevent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::capability::registry::{CapabilityRegistry, TriggerFire};
use crate::capability::{CapabilityId, TriggerPriority};
use crate::clock::{monotonic_ms, now_secs};
use crate::config::MIN_ROUTE_SCORE;
use crate::crypto::MeshKeypair;
use crate::exec::Executor;
use crate::gossip::message::{Envelope, MessageKind, TriggerEventPayload};
use crate::identity::NodeId;
use crate::routing::{GradientTable, Intent, RouteConstraints, RouteContext, SemanticRouter};
use crate::transport::TransportManager;

/// Pipeline counters for the metrics endpoint.
#[derive(Debug, Default)]
pub struct TriggerCounters {
    pub fired: AtomicU64,
    pub throttled: AtomicU64,
    pub routed_by_hint: AtomicU64,
    pub routed_semantically: AtomicU64,
    pub unroutable: AtomicU64,
    pub executed_locally: AtomicU64,
    pub sent_to_peer: AtomicU64,
}

/// Throttled emission of capability events as routed intents.
pub struct TriggerPipeline {
    node_id: NodeId,
    keypair: MeshKeypair,
    registry: Arc<CapabilityRegistry>,
    table: Arc<GradientTable>,
    router: Arc<SemanticRouter>,
    executor: Arc<Executor>,
    transport: Arc<TransportManager>,
    /// Last emission per (capability, event), in monotonic milliseconds.
    gates: Mutex<HashMap<(CapabilityId, String), u64>>,
    pub counters: TriggerCounters,
}

impl TriggerPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: MeshKeypair,
        registry: Arc<CapabilityRegistry>,
        table: Arc<GradientTable>,
        router: Arc<SemanticRouter>,
        executor: Arc<Executor>,
        transport: Arc<TransportManager>,
    ) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        Self {
            node_id,
            keypair,
            registry,
            table,
            router,
            executor,
            transport,
            gates: Mutex::new(HashMap::new()),
            counters: TriggerCounters::default(),
        }
    }

    /// Consumes fired events until shutdown.
    pub async fn run(
        &self,
        mut fires: mpsc::Receiver<TriggerFire>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                fire = fires.recv() => match fire {
                    Some(fire) => self.process(fire).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("trigger pipeline stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Full pipeline for one fired event.
    pub async fn process(&self, fire: TriggerFire) {
        let Some(trigger) = self.registry.get_trigger(&fire.capability_id, &fire.event) else {
            trace!(capability = %fire.capability_id, event = %fire.event, "unknown trigger, dropped");
            return;
        };
        let Some(capability) = self.registry.get(&fire.capability_id) else {
            return;
        };
        self.counters.fired.fetch_add(1, Ordering::Relaxed);

        // Throttle gate. Critical events go straight through.
        if trigger.priority != TriggerPriority::Critical
            && !self.gate_passes(
                &fire.capability_id,
                &fire.event,
                trigger.throttle_ms,
                monotonic_ms(),
            )
        {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            trace!(capability = %fire.capability_id, event = %fire.event, "throttled");
            return;
        }

        let text = render_template(&trigger.intent_template, &fire.payload, &capability.metadata);
        let payload = TriggerEventPayload {
            intent_type: format!("trigger/{}/{}", capability.cap_type, fire.event),
            text: text.clone(),
            source: fire.capability_id.clone(),
            data: fire.payload.clone(),
            priority: trigger.priority,
            route_hint: trigger.route_hint.clone(),
        };

        // Route-hint fast path, then semantic fallback.
        let target = match &trigger.route_hint {
            Some(hint) => match self.best_by_hint(hint) {
                Some(target) => {
                    self.counters.routed_by_hint.fetch_add(1, Ordering::Relaxed);
                    Some(target)
                }
                None => self.route_semantically(&text).await,
            },
            None => self.route_semantically(&text).await,
        };

        let Some((target_node, target_capability, next_hop)) = target else {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(intent = %text, "trigger event unroutable, dropped");
            return;
        };

        if target_node == self.node_id {
            self.execute_locally(&target_capability, &payload).await;
        } else {
            self.send_to_peer(&next_hop, &target_node, payload).await;
        }
    }

    /// Handles a trigger event received from another node: local
    /// candidates only, never re-routed onward.
    pub async fn handle_remote_event(&self, payload: TriggerEventPayload) {
        let ctx = RouteContext {
            constraints: RouteConstraints {
                data_stays_local: true,
            },
            ..Default::default()
        };
        match self
            .router
            .route(Intent::text(payload.text.clone()), &ctx)
            .await
        {
            Ok(decision) => {
                self.execute_locally(&decision.capability_id, &payload).await;
            }
            Err(e) => {
                trace!(intent = %payload.text, "remote trigger event has no local handler: {e}");
            }
        }
    }

    // -- Internals --------------------------------------------------------

    /// The monotonic throttle gate. Returns whether emission may proceed,
    /// recording the emission time when it does.
    fn gate_passes(
        &self,
        capability_id: &CapabilityId,
        event: &str,
        throttle_ms: u64,
        now_ms: u64,
    ) -> bool {
        if throttle_ms == 0 {
            return true;
        }
        let mut gates = self.gates.lock();
        let key = (capability_id.clone(), event.to_string());
        match gates.get(&key) {
            Some(&last) if now_ms.saturating_sub(last) < throttle_ms => false,
            _ => {
                gates.insert(key, now_ms);
                true
            }
        }
    }

    /// Best gradient entry matching a route hint: fewest hops, then id.
    fn best_by_hint(&self, hint: &str) -> Option<(NodeId, CapabilityId, NodeId)> {
        let mut matches = self.table.find_by_hint(hint, now_secs());
        matches.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then(a.capability_id.cmp(&b.capability_id))
        });
        matches
            .first()
            .map(|e| (e.via.clone(), e.capability_id.clone(), e.next_hop.clone()))
    }

    async fn route_semantically(&self, text: &str) -> Option<(NodeId, CapabilityId, NodeId)> {
        match self
            .router
            .route(Intent::text(text), &RouteContext::default())
            .await
        {
            Ok(decision) if decision.score >= MIN_ROUTE_SCORE => {
                self.counters
                    .routed_semantically
                    .fetch_add(1, Ordering::Relaxed);
                Some((decision.node_id, decision.capability_id, decision.next_hop))
            }
            _ => None,
        }
    }

    /// Executes the routed capability's first tool with the event data.
    /// Fire-and-forget: failures are logged, never propagated.
    async fn execute_locally(&self, capability_id: &CapabilityId, payload: &TriggerEventPayload) {
        let Some(capability) = self.registry.get(capability_id) else {
            return;
        };
        let Some(tool) = capability.tools.first() else {
            trace!(capability = %capability_id, "trigger target has no tools");
            return;
        };
        self.counters.executed_locally.fetch_add(1, Ordering::Relaxed);
        let context = serde_json::json!({
            "trigger": { "type": payload.intent_type, "source": payload.source },
        });
        if let Err(e) = self
            .executor
            .execute_local(capability_id, &tool.name, payload.data.clone(), context)
            .await
        {
            warn!(capability = %capability_id, tool = %tool.name, "trigger execution failed: {e}");
        }
    }

    /// Sends the event to the chosen peer as a routed-once message.
    async fn send_to_peer(
        &self,
        next_hop: &NodeId,
        target: &NodeId,
        payload: TriggerEventPayload,
    ) {
        let Ok(envelope) = Envelope::build(
            MessageKind::TriggerEvent,
            &self.keypair,
            Some(target.clone()),
            &payload,
            1,
        ) else {
            return;
        };
        match self.transport.send(next_hop, &envelope.to_bytes()).await {
            Ok(_) => {
                self.counters.sent_to_peer.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Fire and forget: the event is lost, and that is allowed.
                debug!(peer = %next_hop.short(), "trigger event delivery failed: {e}");
            }
        }
    }
}

/// Renders `{key}` placeholders from the payload first, capability
/// metadata second. Unknown keys stay as written.
fn render_template(
    template: &str,
    payload: &Value,
    metadata: &serde_json::Map<String, Value>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end_off) => {
                let key = &rest[start + 1..start + end_off];
                let value = payload
                    .get(key)
                    .or_else(|| metadata.get(key))
                    .map(value_to_text);
                match value {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &rest[start + end_off + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
