//! # Semantic Routing
//!
//! ```text
//! gradient.rs — bounded distance-vector table keyed by embedding vectors
//! router.rs   — intent resolution with policy boosts and constraints
//! ```
//!
//! The gradient table answers "who can do something shaped like this
//! vector, and through which peer"; the router turns that raw answer into a
//! policy-adjusted decision.

pub mod gradient;
pub mod router;

pub use gradient::{GradientEntry, GradientTable, RouteAdvert, RouteCandidate};
pub use router::{Intent, RouteConstraints, RouteContext, RouteDecision, SemanticRouter};
