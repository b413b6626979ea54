//! The owner-side capability store.
//!
//! The registry is authoritative for this node's capabilities. It computes
//! the description embedding once at registration (not per announcement),
//! stamps tool bindings, tracks per-capability heartbeats, and hands fired
//! trigger events to the trigger pipeline through a bounded channel.
//!
//! Writers are the local owner only; reads are concurrent. The embedding is
//! computed *before* the write lock is taken — a slow embedding backend
//! must never stall readers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::now_secs;
use crate::config::HOP_LATENCY_MS;
use crate::embed::{EmbedError, Embedding, EmbeddingProvider};
use crate::identity::NodeId;

use super::types::{Capability, CapabilityId, CapabilityInfo, Tool, Trigger};

/// A trigger firing, as handed to the trigger pipeline.
#[derive(Debug, Clone)]
pub struct TriggerFire {
    pub capability_id: CapabilityId,
    pub event: String,
    pub payload: Value,
    /// Wall-clock seconds when the owner fired the event.
    pub fired_at: f64,
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown capability: {0}")]
    UnknownCapability(CapabilityId),

    #[error("capability {capability} has no trigger named {event:?}")]
    UnknownTrigger {
        capability: CapabilityId,
        event: String,
    },

    #[error("trigger payload rejected: {0}")]
    InvalidPayload(String),

    #[error("description embedding failed: {0}")]
    Embedding(#[from] EmbedError),
}

/// A registered capability with its registry-side state.
#[derive(Debug, Clone)]
struct LocalCapability {
    definition: Capability,
    vector: Embedding,
    registered_at: f64,
    last_heartbeat: f64,
}

/// Owns this node's local capability definitions.
pub struct CapabilityRegistry {
    node_id: NodeId,
    embedder: Arc<dyn EmbeddingProvider>,
    caps: RwLock<HashMap<CapabilityId, LocalCapability>>,
    /// Sink into the trigger pipeline, wired by the node at startup.
    trigger_sink: Mutex<Option<mpsc::Sender<TriggerFire>>>,
}

impl CapabilityRegistry {
    pub fn new(node_id: NodeId, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            node_id,
            embedder,
            caps: RwLock::new(HashMap::new()),
            trigger_sink: Mutex::new(None),
        }
    }

    /// Wires the channel that carries fired triggers to the pipeline.
    pub fn set_trigger_sink(&self, sink: mpsc::Sender<TriggerFire>) {
        *self.trigger_sink.lock() = Some(sink);
    }

    /// The id of the node owning this registry.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Registers (or re-registers) a capability.
    ///
    /// Idempotent on id: re-registering replaces the definition and
    /// re-embeds the description, keeping the original registration time.
    /// Returns the assigned capability id.
    pub async fn register(&self, mut cap: Capability) -> Result<CapabilityId, RegistryError> {
        let id = CapabilityId::new(&self.node_id, &cap.cap_type, &cap.name);

        // Embed outside the lock.
        let vector = self.embedder.embed(&cap.description).await?;

        for tool in &mut cap.tools {
            tool.capability_id = Some(id.clone());
        }

        let now = now_secs();
        let mut caps = self.caps.write();
        match caps.get_mut(&id) {
            Some(existing) => {
                existing.definition = cap;
                existing.vector = vector;
                existing.last_heartbeat = now;
                debug!(capability = %id, "capability re-registered");
            }
            None => {
                caps.insert(
                    id.clone(),
                    LocalCapability {
                        definition: cap,
                        vector,
                        registered_at: now,
                        last_heartbeat: now,
                    },
                );
                info!(capability = %id, "capability registered");
            }
        }
        Ok(id)
    }

    /// Removes a capability. Returns whether it existed.
    pub fn deregister(&self, id: &CapabilityId) -> bool {
        let removed = self.caps.write().remove(id).is_some();
        if removed {
            info!(capability = %id, "capability deregistered");
        }
        removed
    }

    /// Ids of all registered capabilities.
    pub fn list(&self) -> Vec<CapabilityId> {
        self.caps.read().keys().cloned().collect()
    }

    /// A clone of the capability definition.
    pub fn get(&self, id: &CapabilityId) -> Option<Capability> {
        self.caps.read().get(id).map(|c| c.definition.clone())
    }

    /// The description embedding computed at registration.
    pub fn vector(&self, id: &CapabilityId) -> Option<Embedding> {
        self.caps.read().get(id).map(|c| c.vector.clone())
    }

    /// Looks up a tool on a capability, binding included.
    pub fn get_tool(&self, id: &CapabilityId, tool_name: &str) -> Option<Tool> {
        self.caps.read().get(id).and_then(|c| {
            c.definition
                .tools
                .iter()
                .find(|t| t.name == tool_name)
                .cloned()
        })
    }

    /// Looks up a trigger definition.
    pub fn get_trigger(&self, id: &CapabilityId, event: &str) -> Option<Trigger> {
        self.caps.read().get(id).and_then(|c| {
            c.definition
                .triggers
                .iter()
                .find(|t| t.event == event)
                .cloned()
        })
    }

    /// Fires a trigger event into the pipeline.
    ///
    /// The payload is validated against the trigger's schema here — the
    /// pipeline and everything downstream only sees conforming events.
    /// Delivery into the pipeline is fail-fast: a full pipeline drops the
    /// event rather than blocking the owner.
    pub fn fire_trigger(
        &self,
        id: &CapabilityId,
        event: &str,
        payload: Value,
    ) -> Result<(), RegistryError> {
        let trigger = {
            let caps = self.caps.read();
            let cap = caps
                .get(id)
                .ok_or_else(|| RegistryError::UnknownCapability(id.clone()))?;
            cap.definition
                .triggers
                .iter()
                .find(|t| t.event == event)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownTrigger {
                    capability: id.clone(),
                    event: event.to_string(),
                })?
        };

        if let Err(violations) = super::schema::validate(&trigger.payload_schema, &payload) {
            let summary = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RegistryError::InvalidPayload(summary));
        }

        let fire = TriggerFire {
            capability_id: id.clone(),
            event: event.to_string(),
            payload,
            fired_at: now_secs(),
        };

        match self.trigger_sink.lock().as_ref() {
            Some(sink) => {
                if let Err(e) = sink.try_send(fire) {
                    warn!(capability = %id, event, "trigger pipeline full, event dropped: {e}");
                }
            }
            None => {
                debug!(capability = %id, event, "no trigger pipeline wired, event dropped");
            }
        }
        Ok(())
    }

    /// Records a heartbeat for a capability (e.g. from its provider's
    /// health check).
    pub fn heartbeat(&self, id: &CapabilityId) -> bool {
        match self.caps.write().get_mut(id) {
            Some(cap) => {
                cap.last_heartbeat = now_secs();
                true
            }
            None => false,
        }
    }

    /// Builds the gossiped projections of all local capabilities.
    ///
    /// Local projections always carry `hops = 0`, no `via`, and the local
    /// execution latency estimate.
    pub fn projections(&self) -> Vec<CapabilityInfo> {
        self.caps
            .read()
            .iter()
            .map(|(id, cap)| CapabilityInfo {
                id: id.clone(),
                label: cap.definition.label.clone(),
                description: cap.definition.description.clone(),
                vector: cap.vector.clone(),
                local: true,
                hops: 0,
                via: None,
                constraints: cap.definition.constraints.clone(),
                est_latency_ms: HOP_LATENCY_MS,
            })
            .collect()
    }

    /// Seconds since the oldest heartbeat, for staleness accounting.
    pub fn seconds_since_heartbeat(&self, id: &CapabilityId) -> Option<f64> {
        self.caps
            .read()
            .get(id)
            .map(|c| (now_secs() - c.last_heartbeat).max(0.0))
    }

    pub fn len(&self) -> usize {
        self.caps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::types::TriggerPriority;
    use crate::crypto::MeshKeypair;
    use crate::embed::HashedEmbedder;
    use serde_json::json;

    fn registry() -> CapabilityRegistry {
        let node_id = NodeId::from_public_key(&MeshKeypair::generate().public_key());
        CapabilityRegistry::new(node_id, Arc::new(HashedEmbedder::new()))
    }

    fn chat_capability() -> Capability {
        Capability {
            cap_type: "llm".into(),
            name: "chat".into(),
            label: "Chat".into(),
            description: "chat completion".into(),
            tools: vec![Tool::new(
                "complete",
                "complete a chat",
                json!({"type": "object", "required": ["prompt"],
                       "properties": {"prompt": {"type": "string"}}}),
            )],
            triggers: vec![Trigger {
                event: "idle".into(),
                description: "model went idle".into(),
                intent_template: "model {name} is idle".into(),
                payload_schema: json!({"type": "object", "required": ["name"],
                                       "properties": {"name": {"type": "string"}}}),
                route_hint: None,
                priority: TriggerPriority::Normal,
                throttle_ms: 1000,
            }],
            metadata: serde_json::Map::new(),
            constraints: Default::default(),
        }
    }

    #[tokio::test]
    async fn register_assigns_structured_id_and_embeds() {
        let reg = registry();
        let id = reg.register(chat_capability()).await.expect("register");
        assert_eq!(id.cap_type(), "llm");
        assert_eq!(id.name(), "chat");
        assert!(reg.vector(&id).is_some());

        let tool = reg.get_tool(&id, "complete").expect("tool");
        assert_eq!(tool.capability_id.as_ref(), Some(&id));
    }

    #[tokio::test]
    async fn register_is_idempotent_on_id() {
        let reg = registry();
        let id1 = reg.register(chat_capability()).await.unwrap();
        let id2 = reg.register(chat_capability()).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes() {
        let reg = registry();
        let id = reg.register(chat_capability()).await.unwrap();
        assert!(reg.deregister(&id));
        assert!(!reg.deregister(&id));
        assert!(reg.get(&id).is_none());
    }

    #[tokio::test]
    async fn unembeddable_description_is_rejected() {
        let reg = registry();
        let mut cap = chat_capability();
        cap.description = "???".into(); // tokenizes to nothing
        assert!(matches!(
            reg.register(cap).await,
            Err(RegistryError::Embedding(_))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn projections_are_local_with_zero_hops() {
        let reg = registry();
        reg.register(chat_capability()).await.unwrap();
        let infos = reg.projections();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].local);
        assert_eq!(infos[0].hops, 0);
        assert!(infos[0].via.is_none());
    }

    #[tokio::test]
    async fn fire_trigger_validates_payload() {
        let reg = registry();
        let id = reg.register(chat_capability()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        reg.set_trigger_sink(tx);

        // Bad payload: missing required "name".
        assert!(matches!(
            reg.fire_trigger(&id, "idle", json!({})),
            Err(RegistryError::InvalidPayload(_))
        ));

        reg.fire_trigger(&id, "idle", json!({"name": "llama"}))
            .expect("fires");
        let fired = rx.try_recv().expect("event queued");
        assert_eq!(fired.event, "idle");
        assert_eq!(fired.capability_id, id);
    }

    #[tokio::test]
    async fn fire_trigger_unknown_event_errors() {
        let reg = registry();
        let id = reg.register(chat_capability()).await.unwrap();
        assert!(matches!(
            reg.fire_trigger(&id, "no-such-event", json!({})),
            Err(RegistryError::UnknownTrigger { .. })
        ));
    }

    #[tokio::test]
    async fn heartbeat_refreshes_known_only() {
        let reg = registry();
        let id = reg.register(chat_capability()).await.unwrap();
        assert!(reg.heartbeat(&id));
        assert!(reg.seconds_since_heartbeat(&id).unwrap() < 1.0);

        let other = CapabilityId::parse("aa:llm:gone").unwrap();
        assert!(!reg.heartbeat(&other));
    }
}
