//! # Wire Envelope & Payloads
//!
//! Every mesh message shares one envelope with canonical field order:
//!
//! ```text
//! type | from | to | payload | ttl | timestamp | nonce | signature
//! ```
//!
//! The signature covers `canonical(from ‖ to ‖ payload ‖ ttl ‖ timestamp ‖
//! nonce)` (see [`crate::crypto::signing`]). The payload is carried as a
//! JSON value; because `serde_json` maps are ordered, serializing the
//! parsed value reproduces the exact bytes the sender signed — both ends
//! canonicalize through the same path.
//!
//! Envelopes are ephemeral: they exist during propagation and die at the
//! nonce cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::capability::{CapabilityId, CapabilityInfo, TriggerPriority};
use crate::clock::now_secs;
use crate::crypto::{sign_canonical, verify_canonical, MeshKeypair, MeshSignature};
use crate::identity::NodeId;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Discriminant of every mesh message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Announce,
    Heartbeat,
    Removed,
    Update,
    TriggerEvent,
    RouteUpdate,
    NodeJoin,
    NodeLeave,
    TokenRevoked,
    InvokeRequest,
    InvokeResponse,
}

impl MessageKind {
    /// Kinds that are forwarded epidemically. Invocations and trigger
    /// events are point-to-point or routed-once, never flooded.
    pub fn is_gossiped(&self) -> bool {
        !matches!(
            self,
            MessageKind::TriggerEvent | MessageKind::InvokeRequest | MessageKind::InvokeResponse
        )
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Errors constructing or parsing envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload type mismatch for {kind:?}")]
    PayloadMismatch { kind: MessageKind },
}

/// The signed wire envelope. Field order in this struct *is* the canonical
/// wire order — do not reorder fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: NodeId,
    /// `None` is a broadcast.
    pub to: Option<NodeId>,
    pub payload: Value,
    pub ttl: u8,
    /// Float seconds since the Unix epoch.
    pub timestamp: f64,
    /// 16 hex chars, fresh per message.
    pub nonce: String,
    /// Base64 Ed25519 signature over the canonical form.
    pub signature: String,
}

impl Envelope {
    /// Builds and signs an envelope around a payload.
    pub fn build<P: Serialize>(
        kind: MessageKind,
        keypair: &MeshKeypair,
        to: Option<NodeId>,
        payload: &P,
        ttl: u8,
    ) -> Result<Self, EnvelopeError> {
        Self::build_at(kind, keypair, to, payload, ttl, now_secs())
    }

    /// Builds with an explicit timestamp, for tests.
    pub fn build_at<P: Serialize>(
        kind: MessageKind,
        keypair: &MeshKeypair,
        to: Option<NodeId>,
        payload: &P,
        ttl: u8,
        timestamp: f64,
    ) -> Result<Self, EnvelopeError> {
        let from = NodeId::from_public_key(&keypair.public_key());
        let payload = serde_json::to_value(payload)?;
        let payload_json = serde_json::to_string(&payload)?;
        let nonce = fresh_nonce();

        let signature = sign_canonical(
            keypair,
            from.as_str(),
            to.as_ref().map(|n| n.as_str()),
            &payload_json,
            ttl,
            timestamp,
            &nonce,
        );

        Ok(Self {
            kind,
            from,
            to,
            payload,
            ttl,
            timestamp,
            nonce,
            signature: signature.to_base64(),
        })
    }

    /// Verifies the signature against the claimed sender's key (derived
    /// from the node id). Any failure is a quiet `false`.
    pub fn verify_signature(&self) -> bool {
        let Ok(public_key) = self.from.to_public_key() else {
            return false;
        };
        let Ok(payload_json) = serde_json::to_string(&self.payload) else {
            return false;
        };
        let Ok(signature) = MeshSignature::from_base64(&self.signature) else {
            return false;
        };
        verify_canonical(
            &public_key,
            self.from.as_str(),
            self.to.as_ref().map(|n| n.as_str()),
            &payload_json,
            self.ttl,
            self.timestamp,
            &self.nonce,
            &signature,
        )
    }

    /// Serializes for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parses an envelope off the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Deserializes the payload into its typed form.
    pub fn payload_as<P: serde::de::DeserializeOwned>(&self) -> Result<P, EnvelopeError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|_| EnvelopeError::PayloadMismatch { kind: self.kind })
    }

    /// A copy with TTL decremented, for forwarding. `None` when spent.
    ///
    /// The signature covers the TTL, so forwarded envelopes are re-signed
    /// by the forwarder — the original originator's claims live inside the
    /// payload, which is copied verbatim.
    pub fn forwarded_by(&self, keypair: &MeshKeypair) -> Option<Self> {
        self.forward_with_payload(keypair, self.payload.clone())
    }

    /// Forwarding with a rewritten payload. Announcements need this: the
    /// forwarder replaces each capability's hop view with its own before
    /// passing the message on, keeping the distance vector honest.
    ///
    /// Nonce and timestamp are preserved so the replay cache still
    /// recognizes the message; TTL decrements and the forwarder re-signs.
    pub fn forwarded_with<P: Serialize>(&self, keypair: &MeshKeypair, payload: &P) -> Option<Self> {
        let payload = serde_json::to_value(payload).ok()?;
        self.forward_with_payload(keypair, payload)
    }

    fn forward_with_payload(&self, keypair: &MeshKeypair, payload: Value) -> Option<Self> {
        // Forwarding needs TTL left over *after* the decrement: a message
        // arriving with TTL 1 is processed but travels no further.
        if self.ttl <= 1 {
            return None;
        }
        let ttl = self.ttl - 1;
        let payload_json = serde_json::to_string(&payload).ok()?;
        let from = NodeId::from_public_key(&keypair.public_key());
        let signature = sign_canonical(
            keypair,
            from.as_str(),
            self.to.as_ref().map(|n| n.as_str()),
            &payload_json,
            ttl,
            self.timestamp,
            &self.nonce,
        );
        Some(Self {
            kind: self.kind,
            from,
            to: self.to.clone(),
            payload,
            ttl,
            timestamp: self.timestamp,
            nonce: self.nonce.clone(),
            signature: signature.to_base64(),
        })
    }
}

/// A fresh 16-hex-char nonce (8 random bytes).
pub fn fresh_nonce() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Point-in-time resource state carried with announcements and heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceSnapshot {
    /// CPU utilization fraction, 0.0–1.0.
    pub cpu: f64,
    /// Memory utilization fraction, 0.0–1.0.
    pub memory: f64,
    /// GPU utilization fraction, when a GPU exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<f64>,
    /// Battery fraction, when running on battery hardware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging: Option<bool>,
    /// Coarse network class: `lan`, `wifi`, `cellular`, `ble`, `relay`.
    #[serde(default)]
    pub network_class: String,
}

impl ResourceSnapshot {
    /// A single load figure for routing: the busiest of CPU/GPU/memory.
    pub fn load(&self) -> f64 {
        self.cpu.max(self.memory).max(self.gpu.unwrap_or(0.0))
    }
}

/// `announce` — the originator's capability projections plus resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementPayload {
    /// Originating node (survives forwarding; the envelope `from` is the
    /// last forwarder).
    pub from_node: NodeId,
    /// At most [`crate::config::MAX_CAPS_PER_ANNOUNCEMENT`] entries.
    pub capabilities: Vec<CapabilityInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,
}

/// `heartbeat` — liveness refresh for known capability ids. Never creates
/// gradient entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub from_node: NodeId,
    pub capability_ids: Vec<CapabilityId>,
    /// Load fraction of the originator, 0.0–1.0.
    pub load: f64,
    /// Depth of the originator's execution queue.
    pub queue_depth: u32,
}

/// `removed` — a capability is gone; tombstone it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedPayload {
    pub from_node: NodeId,
    pub capability_id: CapabilityId,
}

/// `update` — metadata/status mutation on an existing entry. Never widens
/// routing scope: no hops, no vector, no next hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub from_node: NodeId,
    pub capability_id: CapabilityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub est_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// `route_update` — a changed route metric for an existing capability,
/// subject to the same hop-strict acceptance as announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteUpdatePayload {
    pub from_node: NodeId,
    pub capability_id: CapabilityId,
    pub hops: u8,
    pub est_latency_ms: f64,
}

/// `trigger_event` — a fired trigger traveling as a routable intent.
/// Routed once by the receiver; never gossiped onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEventPayload {
    /// `trigger/<capability-type>/<event>`.
    pub intent_type: String,
    /// Rendered intent text, e.g. `"motion at front door"`.
    pub text: String,
    /// The capability that fired.
    pub source: CapabilityId,
    pub data: Value,
    pub priority: TriggerPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_hint: Option<String>,
}

/// `node_join` — membership bookkeeping only; capabilities travel in
/// their own announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeJoinPayload {
    /// The joining node (survives re-signed forwarding).
    pub node_id: NodeId,
    pub node_name: String,
    /// Transport classes the joiner listens on.
    pub transports: Vec<String>,
}

/// `node_leave` — graceful departure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLeavePayload {
    /// The departing node (survives re-signed forwarding).
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `invoke_request` — a forwarded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequestPayload {
    pub request_id: Uuid,
    pub capability_id: CapabilityId,
    pub tool: String,
    /// Tool interface version the caller compiled against.
    pub version: u16,
    pub params: Value,
    pub context: Value,
    /// Remaining forwards permitted; 0 at a non-owning node is `no-route`.
    pub hop_budget: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Caller deadline in milliseconds.
    pub timeout_ms: u64,
}

/// `invoke_response` — the matching reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponsePayload {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::MeshError>,
    pub duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keypair() -> MeshKeypair {
        MeshKeypair::generate()
    }

    #[test]
    fn envelope_roundtrip_is_structural_equality() {
        let kp = keypair();
        let payload = NodeLeavePayload {
            node_id: NodeId::from_public_key(&kp.public_key()),
            reason: Some("shutdown".into()),
        };
        let env = Envelope::build(MessageKind::NodeLeave, &kp, None, &payload, 10).unwrap();

        let bytes = env.to_bytes();
        let back = Envelope::from_bytes(&bytes).expect("parses");
        assert_eq!(env, back);
        assert!(back.verify_signature());
    }

    #[test]
    fn nonce_is_sixteen_hex_chars() {
        let n = fresh_nonce();
        assert_eq!(n.len(), 16);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fresh_nonce(), fresh_nonce());
    }

    #[test]
    fn wire_field_order_is_canonical() {
        let kp = keypair();
        let env = Envelope::build(
            MessageKind::Heartbeat,
            &kp,
            None,
            &json!({"load": 0.5}),
            3,
        )
        .unwrap();
        let wire = String::from_utf8(env.to_bytes()).unwrap();

        let order = ["\"type\"", "\"from\"", "\"to\"", "\"payload\"", "\"ttl\"", "\"timestamp\"", "\"nonce\"", "\"signature\""];
        let positions: Vec<usize> = order.iter().map(|f| wire.find(f).expect("field present")).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "fields out of order: {wire}");
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let kp = keypair();
        let mut env = Envelope::build(
            MessageKind::Update,
            &kp,
            None,
            &json!({"status": "ok"}),
            5,
        )
        .unwrap();
        assert!(env.verify_signature());

        env.payload = json!({"status": "compromised"});
        assert!(!env.verify_signature());
    }

    #[test]
    fn forged_sender_fails_verification() {
        let kp = keypair();
        let other = keypair();
        let mut env =
            Envelope::build(MessageKind::NodeJoin, &kp, None, &json!({}), 5).unwrap();

        env.from = NodeId::from_public_key(&other.public_key());
        assert!(!env.verify_signature());
    }

    #[test]
    fn forwarding_decrements_ttl_and_resigns() {
        let origin = keypair();
        let relay = keypair();
        let env = Envelope::build(
            MessageKind::Announce,
            &origin,
            None,
            &json!({"capabilities": []}),
            10,
        )
        .unwrap();

        let fwd = env.forwarded_by(&relay).expect("forwardable");
        assert_eq!(fwd.ttl, 9);
        assert_eq!(fwd.nonce, env.nonce);
        assert_eq!(fwd.from, NodeId::from_public_key(&relay.public_key()));
        assert!(fwd.verify_signature());

        // TTL 1 is processed by the receiver but never travels further;
        // TTL 0 likewise.
        let last_hop = Envelope { ttl: 1, ..env.clone() };
        assert!(last_hop.forwarded_by(&relay).is_none());
        let spent = Envelope { ttl: 0, ..env };
        assert!(spent.forwarded_by(&relay).is_none());
    }

    #[test]
    fn payload_as_rejects_wrong_shape() {
        let kp = keypair();
        let env = Envelope::build(MessageKind::Heartbeat, &kp, None, &json!("a string"), 1).unwrap();
        assert!(env.payload_as::<HeartbeatPayload>().is_err());
    }

    #[test]
    fn gossiped_kinds_exclude_point_to_point() {
        assert!(MessageKind::Announce.is_gossiped());
        assert!(MessageKind::TokenRevoked.is_gossiped());
        assert!(!MessageKind::TriggerEvent.is_gossiped());
        assert!(!MessageKind::InvokeRequest.is_gossiped());
        assert!(!MessageKind::InvokeResponse.is_gossiped());
    }

    #[test]
    fn resource_snapshot_load_is_the_max_dimension() {
        let snap = ResourceSnapshot {
            cpu: 0.2,
            memory: 0.4,
            gpu: Some(0.9),
            ..Default::default()
        };
        assert_eq!(snap.load(), 0.9);
    }
}
