//! # Operator HTTP API
//!
//! Read-only visibility into a running node, plus a `/route` dry run that
//! returns the route decision for an intent without executing anything.
//!
//! ```text
//! GET  /status        — version, uptime, peer and table counts
//! GET  /healthz       — liveness probe
//! GET  /capabilities  — local capability ids
//! GET  /gradient      — gradient table snapshot
//! GET  /peers         — known peers and last-seen ages
//! POST /route         — dry-run route an intent
//! ```
//!
//! The chat-completion shim and any externally facing REST surface live
//! in separate services; this API is for operators and tests.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use murmur_mesh::routing::{Intent, RouteConstraints, RouteContext};
use murmur_mesh::{MeshError, MeshNode};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<MeshNode>,
    pub version: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Builds the operator API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .route("/capabilities", get(capabilities))
        .route("/gradient", get(gradient))
        .route("/peers", get(peers))
        .route("/route", post(route))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    node_id: String,
    node_name: String,
    mesh_id: String,
    uptime_secs: i64,
    peer_count: usize,
    gradient_entries: usize,
    local_capabilities: usize,
    timestamp: String,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let node = &state.node;
    let now = chrono::Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        node_id: node.node_id().to_string(),
        node_name: node.config().node_name.clone(),
        mesh_id: node.config().mesh.mesh_id.clone(),
        uptime_secs: (now - state.started_at).num_seconds(),
        peer_count: node.transport().peers().len(),
        gradient_entries: node.table().size(),
        local_capabilities: node.registry().len(),
        timestamp: now.to_rfc3339(),
    })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.node.status() {
        murmur_mesh::NodeStatus::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not running"),
    }
}

#[derive(Debug, Serialize)]
struct CapabilityListing {
    id: String,
    label: String,
    cap_type: String,
    tools: Vec<String>,
}

async fn capabilities(State(state): State<AppState>) -> Json<Vec<CapabilityListing>> {
    let registry = state.node.registry();
    let mut listings: Vec<CapabilityListing> = registry
        .list()
        .into_iter()
        .filter_map(|id| {
            registry.get(&id).map(|cap| CapabilityListing {
                id: id.to_string(),
                label: cap.label,
                cap_type: cap.cap_type,
                tools: cap.tools.into_iter().map(|t| t.name).collect(),
            })
        })
        .collect();
    listings.sort_by(|a, b| a.id.cmp(&b.id));
    Json(listings)
}

#[derive(Debug, Serialize)]
struct GradientRow {
    capability_id: String,
    label: String,
    hops: u8,
    next_hop: String,
    via: String,
    est_latency_ms: f64,
    confidence: f64,
    age_secs: f64,
}

async fn gradient(State(state): State<AppState>) -> Json<Vec<GradientRow>> {
    let now = murmur_mesh::clock::now_secs();
    let mut rows: Vec<GradientRow> = state
        .node
        .table()
        .snapshot()
        .into_iter()
        .map(|e| GradientRow {
            capability_id: e.capability_id.to_string(),
            label: e.label.clone(),
            hops: e.hops,
            next_hop: e.next_hop.short().to_string(),
            via: e.via.short().to_string(),
            est_latency_ms: e.est_latency_ms,
            confidence: e.confidence(),
            age_secs: (now - e.last_updated).max(0.0),
        })
        .collect();
    rows.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
    Json(rows)
}

#[derive(Debug, Serialize)]
struct PeerRow {
    node_id: String,
    last_seen_secs_ago: f64,
}

async fn peers(State(state): State<AppState>) -> Json<Vec<PeerRow>> {
    let now = murmur_mesh::clock::now_secs();
    let mut rows: Vec<PeerRow> = state
        .node
        .engine()
        .known_peers()
        .into_iter()
        .map(|(id, last_seen)| PeerRow {
            node_id: id.to_string(),
            last_seen_secs_ago: (now - last_seen).max(0.0),
        })
        .collect();
    rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(rows)
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    text: String,
    #[serde(default)]
    prefer_free: bool,
    #[serde(default)]
    data_stays_local: bool,
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    node_id: String,
    capability_id: String,
    score: f64,
    hops: u8,
    est_latency_ms: f64,
}

async fn route(
    State(state): State<AppState>,
    Json(request): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, ApiError> {
    let ctx = RouteContext {
        prefer_free: request.prefer_free,
        constraints: RouteConstraints {
            data_stays_local: request.data_stays_local,
        },
    };
    let decision = state.node.route(Intent::text(request.text), &ctx).await?;
    Ok(Json(RouteResponse {
        node_id: decision.node_id.to_string(),
        capability_id: decision.capability_id.to_string(),
        score: decision.score,
        hops: decision.hops,
        est_latency_ms: decision.est_latency_ms,
    }))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wraps [`MeshError`] for HTTP: the structured error body is the
/// library's `{code, message, details, retryable}` shape, verbatim.
struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(err: MeshError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.code {
            murmur_mesh::ErrorCode::CapabilityNotFound
            | murmur_mesh::ErrorCode::ToolNotFound
            | murmur_mesh::ErrorCode::RoutingFailed => StatusCode::NOT_FOUND,
            murmur_mesh::ErrorCode::ValidationError
            | murmur_mesh::ErrorCode::ConstraintUnsatisfied => StatusCode::UNPROCESSABLE_ENTITY,
            murmur_mesh::ErrorCode::AuthFailed => StatusCode::FORBIDDEN,
            murmur_mesh::ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            murmur_mesh::ErrorCode::CapabilityOffline => StatusCode::BAD_GATEWAY,
        };
        (status, Json(self.0)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use murmur_mesh::auth::{MeshAuth, RevocationList};
    use murmur_mesh::capability::{Capability, Tool};
    use murmur_mesh::config::NodeConfig;
    use murmur_mesh::crypto::MeshKeypair;
    use murmur_mesh::error::MeshError;
    use murmur_mesh::exec::ToolHandler;
    use murmur_mesh::gossip::engine::NoopSampler;
    use murmur_mesh::transport::loopback::LoopbackHub;
    use tower::util::ServiceExt;

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

    async fn running_node() -> Arc<MeshNode> {
        let hub = LoopbackHub::new();
        let keypair = MeshKeypair::generate();
        let mut config = NodeConfig::default();
        config.node_id = keypair.public_key().to_hex();
        config.node_name = "api-test".into();
        config.mesh.mesh_id = "testmesh".into();
        config.transports.relay.enabled = false;

        let auth = MeshAuth::new("testmesh", None, Arc::new(RevocationList::in_memory()));
        let node = Arc::new(MeshNode::new(
            config,
            keypair,
            auth,
            Arc::new(NoopSampler),
        ));
        node.register_transport(hub.transport_for(node.node_id()));
        node.start().await.expect("starts");
        node
    }

    fn router_for(node: Arc<MeshNode>) -> Router {
        create_router(AppState {
            node,
            version: "test".into(),
            started_at: chrono::Utc::now(),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn status_reports_the_node() {
        let node = running_node().await;
        let app = router_for(Arc::clone(&node));

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["node_name"], "api-test");
        assert_eq!(json["mesh_id"], "testmesh");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn healthz_tracks_lifecycle() {
        let node = running_node().await;
        let app = router_for(Arc::clone(&node));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        node.shutdown().await;
        let app = router_for(Arc::clone(&node));
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn route_dry_run_finds_local_capability() {
        let node = running_node().await;
        node.register_capability(
            Capability {
                cap_type: "llm".into(),
                name: "chat".into(),
                label: "Chat".into(),
                description: "chat completion with a language model".into(),
                tools: vec![Tool::new("complete", "complete", serde_json::json!({}))],
                triggers: vec![],
                metadata: serde_json::Map::new(),
                constraints: Default::default(),
            },
            Arc::new(Echo),
        )
        .await
        .expect("registers");

        let app = router_for(Arc::clone(&node));
        let response = app
            .oneshot(
                Request::post("/route")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"text": "chat completion with a language model"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["hops"], 0);
        assert_eq!(json["node_id"], node.node_id().to_string());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn route_dry_run_maps_no_route_to_404() {
        let node = running_node().await;
        let app = router_for(Arc::clone(&node));
        let response = app
            .oneshot(
                Request::post("/route")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "completely unknown intent"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["code"], "routing_failed");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn constraint_unsatisfied_maps_to_422() {
        let node = running_node().await;
        let app = router_for(Arc::clone(&node));
        let response = app
            .oneshot(
                Request::post("/route")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"text": "anything", "data_stays_local": true}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(response).await;
        assert_eq!(json["code"], "constraint_unsatisfied");
        node.shutdown().await;
    }
}
