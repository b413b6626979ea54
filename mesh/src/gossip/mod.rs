//! # Epidemic Gossip
//!
//! Capability announcements, heartbeats, removals, trigger events, and
//! membership changes all travel as signed [`message::Envelope`]s with
//! replay-protected ingestion and TTL-bounded fan-out forwarding.
//!
//! ```text
//! message.rs — wire envelope (canonical field order) + payload types
//! nonce.rs   — bounded replay-protection cache
//! engine.rs  — announce/prune loops, ingestion, forwarding
//! ```
//!
//! The engine owns gossip *semantics*; bytes move through the transport
//! manager. Convergence with fan-out 3 at a 30-second cadence is
//! O(log₃ N) rounds — a target, not a guarantee.

pub mod engine;
pub mod message;
pub mod nonce;

pub use engine::{GossipCounters, GossipEngine, HandleOutcome, NoopSampler, ResourceSampler};
pub use message::{
    AnnouncementPayload, Envelope, HeartbeatPayload, InvokeRequestPayload, InvokeResponsePayload,
    MessageKind, NodeJoinPayload, NodeLeavePayload, RemovedPayload, ResourceSnapshot,
    RouteUpdatePayload, TriggerEventPayload, UpdatePayload,
};
pub use nonce::NonceCache;
