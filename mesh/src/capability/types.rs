//! Capability, tool, and trigger definitions, plus the gossiped projection.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embed::Embedding;
use crate::identity::NodeId;

// ---------------------------------------------------------------------------
// Capability Id
// ---------------------------------------------------------------------------

/// A capability identifier: `node_id:type:name`.
///
/// The id is a value, not a handle — gradient entries, gossip messages, and
/// invoke requests all carry it as a plain string with structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

/// Errors parsing a capability id.
#[derive(Debug, Error)]
#[error("malformed capability id (expected node_id:type:name): {0:?}")]
pub struct MalformedCapabilityId(String);

impl CapabilityId {
    /// Assembles an id from its three parts.
    pub fn new(node_id: &NodeId, cap_type: &str, name: &str) -> Self {
        Self(format!("{}:{}:{}", node_id, cap_type, name))
    }

    /// Parses an id received off the wire.
    pub fn parse(s: &str) -> Result<Self, MalformedCapabilityId> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(node), Some(ty), Some(name))
                if !node.is_empty() && !ty.is_empty() && !name.is_empty() =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(MalformedCapabilityId(s.to_string())),
        }
    }

    /// The originating node's id segment.
    pub fn node_id(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The type tag segment, e.g. `llm` or `sensor`.
    pub fn cap_type(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or("")
    }

    /// The capability name segment.
    pub fn name(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Hardware and cost constraints advertised with a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Constraints {
    /// The capability needs a GPU on its host.
    #[serde(default)]
    pub gpu_required: bool,
    /// Maximum accepted input size in bytes, if bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_bytes: Option<u64>,
    /// Accepted input formats (MIME types or short tags). Empty = any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_formats: Vec<String>,
    /// Backed by a large, high-reasoning model. Feeds the router's
    /// large-model boost.
    #[serde(default)]
    pub large_model: bool,
    /// Metered cost per call in arbitrary units; 0.0 means free. Feeds the
    /// router's free-local bonus and cloud penalty.
    #[serde(default)]
    pub cost_per_call: f64,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Timeouts, retries, and execution semantics for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Per-invocation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retry count on timeout. Only honored for idempotent tools or
    /// requests carrying an idempotency key.
    pub retries: u32,
    /// Safe to execute more than once for the same request.
    pub idempotent: bool,
    /// The tool may be invoked fire-and-forget.
    pub async_allowed: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: crate::config::DEFAULT_TOOL_TIMEOUT.as_millis() as u64,
            retries: 0,
            idempotent: false,
            async_allowed: false,
        }
    }
}

/// Routing preferences a tool declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoutingHints {
    /// Prefer executing on the caller's node when a local candidate exists.
    #[serde(default)]
    pub prefer_local: bool,
    /// Pin execution to a specific node when routable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeId>,
    /// Refuse routes beyond this many hops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u8>,
}

/// A callable operation on a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Stable tool name, unique within its capability.
    pub name: String,
    pub description: String,
    /// JSON-schema-style parameter specification. Validated by
    /// [`super::schema::validate`] before every invocation.
    pub params_schema: serde_json::Value,
    /// JSON-schema-style description of the return value.
    pub returns_schema: serde_json::Value,
    /// Id of the owning capability. Stamped by the registry at
    /// registration; tools built by hand may leave it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
    #[serde(default)]
    pub hints: RoutingHints,
    /// Permissions the caller context must hold. Empty = unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl Tool {
    /// Minimal tool with default policy and open permissions.
    pub fn new(name: &str, description: &str, params_schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params_schema,
            returns_schema: serde_json::json!({}),
            capability_id: None,
            policy: ExecutionPolicy::default(),
            hints: RoutingHints::default(),
            permissions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Urgency tag on a trigger. `Critical` bypasses the throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A capability-originated event that becomes a routed intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Event name, unique within its capability.
    pub event: String,
    pub description: String,
    /// Template rendered against the event payload, e.g.
    /// `"motion at {location}"`.
    pub intent_template: String,
    /// JSON-schema-style payload specification.
    pub payload_schema: serde_json::Value,
    /// Optional capability-id glob or type prefix tried before semantic
    /// routing, e.g. `"*:automation:*"` or `"camera"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_hint: Option<String>,
    #[serde(default)]
    pub priority: TriggerPriority,
    /// Minimum milliseconds between emissions of this event.
    #[serde(default)]
    pub throttle_ms: u64,
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A local capability definition, as handed to the registry by its owner
/// (typically a capability provider adapter at startup).
///
/// The description embedding is *not* part of the definition — the registry
/// computes it once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Type tag, e.g. `llm`, `camera`, `automation`.
    pub cap_type: String,
    /// Capability name, unique per (node, type).
    pub name: String,
    /// Human-readable label for UIs and logs.
    pub label: String,
    /// Free-text description. This is what gets embedded and matched
    /// against intents — write it the way users phrase requests.
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    /// Free-form metadata (model names, room placement, vendor info).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub constraints: Constraints,
}

// ---------------------------------------------------------------------------
// Gossiped projection
// ---------------------------------------------------------------------------

/// The shareable projection of a capability carried in announcements.
///
/// Contains no secrets, no API keys, no per-user state — this struct is the
/// entire public footprint of a capability on the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: CapabilityId,
    pub label: String,
    pub description: String,
    pub vector: Embedding,
    /// True when announced by the capability's own node.
    pub local: bool,
    /// Hops from the announcing node to the capability (0 when local).
    pub hops: u8,
    /// Originator the route was learned through, when not local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<NodeId>,
    #[serde(default)]
    pub constraints: Constraints,
    /// Estimated end-to-end latency from the announcing node, ms.
    pub est_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MeshKeypair;

    fn node_id() -> NodeId {
        NodeId::from_public_key(&MeshKeypair::generate().public_key())
    }

    #[test]
    fn capability_id_parts() {
        let node = node_id();
        let id = CapabilityId::new(&node, "llm", "chat");
        assert_eq!(id.node_id(), node.as_str());
        assert_eq!(id.cap_type(), "llm");
        assert_eq!(id.name(), "chat");
    }

    #[test]
    fn capability_id_name_may_contain_colons() {
        let node = node_id();
        let id = CapabilityId::new(&node, "model", "llama:70b");
        assert_eq!(id.name(), "llama:70b");
        let reparsed = CapabilityId::parse(id.as_str()).expect("parses");
        assert_eq!(reparsed, id);
    }

    #[test]
    fn parse_rejects_missing_segments() {
        assert!(CapabilityId::parse("only-one-part").is_err());
        assert!(CapabilityId::parse("two:parts").is_err());
        assert!(CapabilityId::parse("a::name").is_err());
        assert!(CapabilityId::parse("").is_err());
    }

    #[test]
    fn default_policy_is_conservative() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.retries, 0);
        assert!(!policy.idempotent);
    }

    #[test]
    fn capability_serde_roundtrip() {
        let cap = Capability {
            cap_type: "camera".into(),
            name: "porch".into(),
            label: "Porch Camera".into(),
            description: "detect motion and people at the porch".into(),
            tools: vec![Tool::new(
                "snapshot",
                "take a still frame",
                serde_json::json!({"type": "object"}),
            )],
            triggers: vec![Trigger {
                event: "motion".into(),
                description: "motion detected".into(),
                intent_template: "motion at {location}".into(),
                payload_schema: serde_json::json!({"type": "object"}),
                route_hint: Some("*:automation:*".into()),
                priority: TriggerPriority::High,
                throttle_ms: 5_000,
            }],
            metadata: serde_json::Map::new(),
            constraints: Constraints::default(),
        };

        let json = serde_json::to_string(&cap).unwrap();
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(cap, back);
    }
}
