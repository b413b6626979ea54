//! # Capabilities
//!
//! A capability is a named unit of work a node can perform: a type tag, a
//! free-text description (the thing that gets embedded), callable *tools*,
//! and event-emitting *triggers*.
//!
//! ```text
//! types.rs     — Capability / Tool / Trigger / CapabilityInfo and friends
//! schema.rs    — validate(schema, params): the pure gate in front of handlers
//! registry.rs  — owner-side store; embeds at registration, tracks heartbeats
//! ```
//!
//! Ownership is strictly one-way: the node owns the registry, the registry
//! owns capability records, and everything downstream (gradient entries,
//! gossip projections) refers to capabilities by id value — never by
//! reference back into the registry.

pub mod registry;
pub mod schema;
pub mod types;

pub use registry::{CapabilityRegistry, RegistryError, TriggerFire};
pub use schema::{validate, SchemaViolation};
pub use types::{
    Capability, CapabilityId, CapabilityInfo, Constraints, ExecutionPolicy, RoutingHints, Tool,
    Trigger, TriggerPriority,
};
