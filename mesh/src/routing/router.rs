//! # Semantic Router
//!
//! Turns an intent — text or a pre-computed vector — into a route decision.
//!
//! The gradient table supplies raw candidates (`similarity × confidence ≥
//! min_score`); the router applies the policy multipliers on top and
//! re-ranks:
//!
//! | adjustment        | factor | condition                                   |
//! |-------------------|--------|---------------------------------------------|
//! | large-model boost | 1.2    | reasoning-shaped intent × large-model entry |
//! | specialty boost   | 1.2    | intent keywords match the capability type   |
//! | load penalty      | 0.7    | last known load of the target > 0.8         |
//! | idle bonus        | 1.1    | last known load of the target < 0.3         |
//! | free bonus        | 1.3    | caller prefers free × cost 0                |
//! | cloud penalty     | 0.8    | caller prefers free × cost > 0              |
//!
//! All multiplicative, all applied after the lock on the gradient table has
//! been released. Ties break deterministically: higher adjusted score,
//! fewer hops, lower latency, lower capability id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capability::CapabilityId;
use crate::clock::now_secs;
use crate::config::{
    CLOUD_PENALTY, FREE_LOCAL_BONUS, HIGH_LOAD, IDLE_BONUS, LARGE_MODEL_BOOST, LOAD_PENALTY,
    LOW_LOAD, MIN_ROUTE_SCORE, SPECIALTY_BOOST,
};
use crate::embed::{Embedding, EmbeddingProvider};
use crate::error::{ErrorCode, MeshError};
use crate::identity::NodeId;

use super::gradient::{GradientTable, RouteCandidate};

/// Intent keywords that suggest the caller wants a high-reasoning model.
const REASONING_HINTS: &[&str] = &[
    "analyze", "analyse", "reason", "explain", "summarize", "plan", "review", "debug", "prove",
    "research", "architect", "compare",
];

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// What the caller wants routed: natural-language text, a pre-computed
/// vector, or both (text enables the keyword-based boosts).
#[derive(Debug, Clone)]
pub struct Intent {
    pub text: Option<String>,
    pub vector: Option<Embedding>,
}

impl Intent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            vector: None,
        }
    }

    pub fn vector(vector: Embedding) -> Self {
        Self {
            text: None,
            vector: Some(vector),
        }
    }
}

/// Hard constraints on a route. Unlike the policy multipliers these never
/// trade off — an unsatisfied constraint is an error, not a lower score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConstraints {
    /// Only capabilities on the local node are eligible.
    #[serde(default)]
    pub data_stays_local: bool,
}

/// Caller context accompanying a routing request.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// Prefer free (cost 0) capabilities; penalize metered ones.
    pub prefer_free: bool,
    pub constraints: RouteConstraints,
}

/// The router's answer: where to go and what it cost to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Node hosting the capability (the originator, not the next hop).
    pub node_id: NodeId,
    pub capability_id: CapabilityId,
    /// Final policy-adjusted score.
    pub score: f64,
    pub hops: u8,
    pub est_latency_ms: f64,
    /// Directly reachable peer the invocation is sent through.
    pub next_hop: NodeId,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Resolves intents against the gradient table under the scoring policy.
pub struct SemanticRouter {
    local_node: NodeId,
    table: Arc<GradientTable>,
    embedder: Arc<dyn EmbeddingProvider>,
    /// Last known load per node, fed by heartbeats and resource snapshots.
    loads: RwLock<HashMap<NodeId, f64>>,
}

impl SemanticRouter {
    pub fn new(
        local_node: NodeId,
        table: Arc<GradientTable>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            local_node,
            table,
            embedder,
            loads: RwLock::new(HashMap::new()),
        }
    }

    /// Records a node's last known load fraction (0.0–1.0).
    pub fn set_node_load(&self, node: NodeId, load: f64) {
        self.loads.write().insert(node, load.clamp(0.0, 1.0));
    }

    pub fn node_load(&self, node: &NodeId) -> Option<f64> {
        self.loads.read().get(node).copied()
    }

    /// Routes an intent to the best capability.
    pub async fn route(
        &self,
        intent: Intent,
        ctx: &RouteContext,
    ) -> Result<RouteDecision, MeshError> {
        self.route_at(intent, ctx, now_secs()).await
    }

    /// Routing with an explicit clock, for tests.
    pub async fn route_at(
        &self,
        intent: Intent,
        ctx: &RouteContext,
        now: f64,
    ) -> Result<RouteDecision, MeshError> {
        // 1. Obtain the intent vector. Embedding happens out here, never
        //    under the table lock.
        let vector = match (&intent.vector, &intent.text) {
            (Some(v), _) => v.clone(),
            (None, Some(text)) => self.embedder.embed(text).await.map_err(|e| {
                MeshError::routing_failed(&format!("intent embedding failed: {e}"))
            })?,
            (None, None) => {
                return Err(MeshError::routing_failed("intent has neither text nor vector"))
            }
        };

        // 2. Raw candidates above the score floor.
        let candidates = self.table.find_candidates_at(&vector, MIN_ROUTE_SCORE, now);

        // 3. Hard constraints filter before any scoring.
        let candidates: Vec<RouteCandidate> = if ctx.constraints.data_stays_local {
            let local: Vec<RouteCandidate> =
                candidates.into_iter().filter(|c| c.entry.is_local()).collect();
            if local.is_empty() {
                return Err(MeshError::constraint_unsatisfied("data_stays_local"));
            }
            local
        } else {
            candidates
        };

        if candidates.is_empty() {
            return Err(MeshError::new(
                ErrorCode::RoutingFailed,
                "no capability scored above the routing threshold",
            ));
        }

        // 4. Policy adjustments and final ranking.
        let intent_text = intent.text.as_deref().map(str::to_lowercase);
        let mut best: Option<(f64, RouteCandidate)> = None;
        for candidate in candidates {
            let score = self.adjust(&candidate, intent_text.as_deref(), ctx);
            trace!(
                capability = %candidate.entry.capability_id,
                raw = candidate.adjusted,
                adjusted = score,
                "candidate scored"
            );
            let better = match &best {
                None => true,
                Some((best_score, best_candidate)) => {
                    score > *best_score
                        || (score == *best_score
                            && (candidate.entry.hops < best_candidate.entry.hops
                                || (candidate.entry.hops == best_candidate.entry.hops
                                    && (candidate.entry.est_latency_ms
                                        < best_candidate.entry.est_latency_ms
                                        || (candidate.entry.est_latency_ms
                                            == best_candidate.entry.est_latency_ms
                                            && candidate.entry.capability_id
                                                < best_candidate.entry.capability_id)))))
                }
            };
            if better {
                best = Some((score, candidate));
            }
        }

        let (score, winner) = best.expect("candidates is non-empty");
        let decision = RouteDecision {
            node_id: winner.entry.via.clone(),
            capability_id: winner.entry.capability_id.clone(),
            score,
            hops: winner.entry.hops,
            est_latency_ms: winner.entry.est_latency_ms,
            next_hop: winner.entry.next_hop.clone(),
        };
        debug!(
            capability = %decision.capability_id,
            node = %decision.node_id.short(),
            score = decision.score,
            hops = decision.hops,
            local = decision.node_id == self.local_node,
            "route decided"
        );
        Ok(decision)
    }

    /// Applies the multiplicative policy adjustments to one candidate.
    fn adjust(
        &self,
        candidate: &RouteCandidate,
        intent_text: Option<&str>,
        ctx: &RouteContext,
    ) -> f64 {
        let entry = &candidate.entry;
        let mut score = candidate.adjusted;

        if let Some(text) = intent_text {
            if entry.constraints.large_model
                && REASONING_HINTS.iter().any(|hint| text.contains(hint))
            {
                score *= LARGE_MODEL_BOOST;
            }
            let cap_type = entry.capability_id.cap_type();
            if !cap_type.is_empty() && text.contains(cap_type) {
                score *= SPECIALTY_BOOST;
            }
        }

        // Load shaping uses the capability's own node, not the next hop —
        // the question is who executes, not who relays.
        if let Some(load) = self.node_load(&entry.via) {
            if load > HIGH_LOAD {
                score *= LOAD_PENALTY;
            } else if load < LOW_LOAD {
                score *= IDLE_BONUS;
            }
        }

        if ctx.prefer_free {
            if entry.constraints.cost_per_call == 0.0 {
                score *= FREE_LOCAL_BONUS;
            } else {
                score *= CLOUD_PENALTY;
            }
        }

        score
    }
}
