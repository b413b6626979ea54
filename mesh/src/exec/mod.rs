//! # Executor
//!
//! Dispatches resolved tool calls: locally through a registered
//! [`ToolHandler`], or across the mesh as an `invoke_request` /
//! `invoke_response` exchange with hop budgets, per-tool timeouts, and a
//! single recomputed-route retry on timeout.
//!
//! Validation runs before every handler — local or forwarded — so a
//! handler only ever sees parameters its schema accepts. Permission
//! checks ride on the caller context's `permissions` array.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::capability::registry::CapabilityRegistry;
use crate::capability::{schema, CapabilityId, ExecutionPolicy, Tool};
use crate::clock::monotonic_ms;
use crate::config::DEFAULT_HOP_BUDGET;
use crate::crypto::MeshKeypair;
use crate::error::{ErrorCode, MeshError};
use crate::gossip::message::{Envelope, InvokeRequestPayload, InvokeResponsePayload, MessageKind};
use crate::identity::NodeId;
use crate::routing::{GradientTable, RouteDecision};
use crate::transport::TransportManager;

/// Executes one tool invocation on the local node. Implemented by the
/// capability-provider glue; the core only routes and validates.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, tool: &Tool, params: Value, context: Value)
        -> Result<Value, MeshError>;
}

/// Executor counters for the metrics endpoint.
#[derive(Debug, Default)]
pub struct ExecutorCounters {
    pub local_executions: AtomicU64,
    pub forwarded: AtomicU64,
    pub timeouts: AtomicU64,
    pub reroutes: AtomicU64,
    pub validation_failures: AtomicU64,
}

/// Dispatches tool calls locally or across the mesh.
pub struct Executor {
    node_id: NodeId,
    keypair: MeshKeypair,
    registry: Arc<CapabilityRegistry>,
    table: Arc<GradientTable>,
    transport: Arc<TransportManager>,
    /// Local handlers keyed by capability id.
    handlers: RwLock<HashMap<CapabilityId, Arc<dyn ToolHandler>>>,
    /// In-flight remote invocations awaiting their response, with the
    /// peer each one is waiting on.
    pending: DashMap<Uuid, (NodeId, oneshot::Sender<InvokeResponsePayload>)>,
    pub counters: ExecutorCounters,
}

impl Executor {
    pub fn new(
        keypair: MeshKeypair,
        registry: Arc<CapabilityRegistry>,
        table: Arc<GradientTable>,
        transport: Arc<TransportManager>,
    ) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        Self {
            node_id,
            keypair,
            registry,
            table,
            transport,
            handlers: RwLock::new(HashMap::new()),
            pending: DashMap::new(),
            counters: ExecutorCounters::default(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Registers the handler that executes a local capability's tools.
    pub fn register_handler(&self, capability_id: CapabilityId, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(capability_id, handler);
    }

    /// Number of in-flight remote invocations.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Cancels every in-flight invocation waiting on a peer — the
    /// revocation semantics. Dropping the sender completes each waiter
    /// with `auth_failed`.
    pub fn cancel_for_peer(&self, peer: &NodeId) {
        self.pending.retain(|_, entry| &entry.0 != peer);
    }

    // -- Public dispatch --------------------------------------------------

    /// Executes a routed decision: locally when this node owns the
    /// capability, otherwise forwarded to the decision's next hop.
    pub async fn execute(
        &self,
        decision: &RouteDecision,
        tool_name: &str,
        params: Value,
        context: Value,
        policy: &ExecutionPolicy,
    ) -> Result<Value, MeshError> {
        if decision.node_id == self.node_id {
            return self
                .execute_local(&decision.capability_id, tool_name, params, context)
                .await;
        }
        self.execute_remote(decision, tool_name, params, context, policy)
            .await
    }

    /// Local dispatch: schema validation → permission check → handler.
    pub async fn execute_local(
        &self,
        capability_id: &CapabilityId,
        tool_name: &str,
        params: Value,
        context: Value,
    ) -> Result<Value, MeshError> {
        let Some(tool) = self.registry.get_tool(capability_id, tool_name) else {
            if self.registry.get(capability_id).is_none() {
                return Err(MeshError::capability_not_found(capability_id.as_str()));
            }
            return Err(MeshError::tool_not_found(capability_id.as_str(), tool_name));
        };

        if let Err(violations) = schema::validate(&tool.params_schema, &params) {
            self.counters
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            let summary = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(
                MeshError::new(ErrorCode::ValidationError, summary).with_detail("tool", tool_name)
            );
        }

        check_permissions(&tool, &context)?;

        let handler = self.handlers.read().get(capability_id).cloned();
        let Some(handler) = handler else {
            return Err(MeshError::new(
                ErrorCode::CapabilityOffline,
                format!("no local handler bound for {capability_id}"),
            ));
        };

        self.counters.local_executions.fetch_add(1, Ordering::Relaxed);
        let timeout = Duration::from_millis(tool.policy.timeout_ms);
        match tokio::time::timeout(timeout, handler.handle(&tool, params, context)).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(MeshError::timeout(&format!("local tool {tool_name}")))
            }
        }
    }

    /// Remote dispatch with the timeout/re-route discipline.
    async fn execute_remote(
        &self,
        decision: &RouteDecision,
        tool_name: &str,
        params: Value,
        context: Value,
        policy: &ExecutionPolicy,
    ) -> Result<Value, MeshError> {
        let idempotency_key = context
            .get("idempotency_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        // Non-idempotent tools without a key never retry.
        let retries = if policy.idempotent || idempotency_key.is_some() {
            policy.retries.max(1)
        } else {
            0
        };
        let timeout = effective_timeout(policy, &context);

        let max_attempts = 1 + retries;
        let mut next_hop = decision.next_hop.clone();
        let mut attempt = 1u32;
        loop {
            let result = self
                .send_invoke(
                    &decision.capability_id,
                    &next_hop,
                    tool_name,
                    params.clone(),
                    context.clone(),
                    idempotency_key.clone(),
                    timeout,
                )
                .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.code == ErrorCode::Timeout && attempt < max_attempts => {
                    // Timeout: score the silent peer down and consult the
                    // table once more. A second timeout surfaces.
                    attempt += 1;
                    self.counters.reroutes.fetch_add(1, Ordering::Relaxed);
                    self.table.set_peer_offline(&next_hop, true);
                    match self.table.get(&decision.capability_id) {
                        Some(entry) => {
                            if entry.next_hop != next_hop {
                                debug!(
                                    capability = %decision.capability_id,
                                    new_hop = %entry.next_hop.short(),
                                    "re-routing after timeout"
                                );
                            }
                            next_hop = entry.next_hop;
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One invoke round-trip to one peer.
    #[allow(clippy::too_many_arguments)]
    async fn send_invoke(
        &self,
        capability_id: &CapabilityId,
        next_hop: &NodeId,
        tool_name: &str,
        params: Value,
        context: Value,
        idempotency_key: Option<String>,
        timeout: Duration,
    ) -> Result<Value, MeshError> {
        let request_id = Uuid::new_v4();
        let payload = InvokeRequestPayload {
            request_id,
            capability_id: capability_id.clone(),
            tool: tool_name.to_string(),
            version: 1,
            params,
            context,
            hop_budget: DEFAULT_HOP_BUDGET,
            idempotency_key,
            timeout_ms: timeout.as_millis() as u64,
        };
        let envelope = Envelope::build(
            MessageKind::InvokeRequest,
            &self.keypair,
            Some(next_hop.clone()),
            &payload,
            1,
        )
        .map_err(|e| MeshError::routing_failed(&format!("invoke serialization: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, (next_hop.clone(), tx));

        if let Err(e) = self.transport.send(next_hop, &envelope.to_bytes()).await {
            self.pending.remove(&request_id);
            return Err(MeshError::new(
                ErrorCode::CapabilityOffline,
                format!("peer unreachable: {e}"),
            )
            .with_detail("peer", next_hop.as_str()));
        }
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        trace!(%request_id, peer = %next_hop.short(), tool = tool_name, "invoke sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.data.unwrap_or(Value::Null))
                } else {
                    Err(response.error.unwrap_or_else(|| {
                        MeshError::new(ErrorCode::RoutingFailed, "remote failure without detail")
                    }))
                }
            }
            // The sender was dropped without a response: the invocation
            // was cancelled (peer revoked or shutdown).
            Ok(Err(_)) => Err(MeshError::auth_failed("invocation cancelled")),
            Err(_) => {
                self.pending.remove(&request_id);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(MeshError::timeout(&format!("invoke of {capability_id}")))
            }
        }
    }

    /// Handles one inbound invocation envelope (from the gossip engine's
    /// invoke channel).
    pub async fn handle_inbound(&self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::InvokeRequest => self.handle_request(envelope).await,
            MessageKind::InvokeResponse => self.handle_response(envelope),
            other => {
                warn!(kind = ?other, "executor received non-invoke envelope");
            }
        }
    }

    async fn handle_request(&self, envelope: Envelope) {
        let Ok(request) = envelope.payload_as::<InvokeRequestPayload>() else {
            warn!("malformed invoke request dropped");
            return;
        };
        let caller = envelope.from.clone();
        let started = monotonic_ms();

        // Owner: execute. Otherwise: forward along the gradient.
        let outcome = if request.capability_id.node_id() == self.node_id.as_str() {
            self.execute_local(
                &request.capability_id,
                &request.tool,
                request.params.clone(),
                request.context.clone(),
            )
            .await
        } else {
            return self.forward_request(envelope, request).await;
        };

        let duration_ms = (monotonic_ms() - started) as f64;
        let response = match outcome {
            Ok(data) => InvokeResponsePayload {
                request_id: request.request_id,
                success: true,
                data: Some(data),
                error: None,
                duration_ms,
            },
            Err(err) => InvokeResponsePayload {
                request_id: request.request_id,
                success: false,
                data: None,
                error: Some(err),
                duration_ms,
            },
        };
        self.send_response(&caller, response).await;
    }

    /// Relays a request one hop closer to the capability's owner.
    async fn forward_request(&self, original: Envelope, mut request: InvokeRequestPayload) {
        let caller = original.from.clone();
        if request.hop_budget == 0 {
            let response = InvokeResponsePayload {
                request_id: request.request_id,
                success: false,
                data: None,
                error: Some(MeshError::routing_failed("hop budget exhausted")),
                duration_ms: 0.0,
            };
            return self.send_response(&caller, response).await;
        }
        request.hop_budget -= 1;

        let Some(entry) = self.table.get(&request.capability_id) else {
            let response = InvokeResponsePayload {
                request_id: request.request_id,
                success: false,
                data: None,
                error: Some(MeshError::capability_not_found(
                    request.capability_id.as_str(),
                )),
                duration_ms: 0.0,
            };
            return self.send_response(&caller, response).await;
        };

        // The forwarded request keeps the original request id, so the
        // response can be relayed back hop by hop. We remember where it
        // came from.
        let request_id = request.request_id;
        let Ok(forwarded) = Envelope::build(
            MessageKind::InvokeRequest,
            &self.keypair,
            Some(entry.next_hop.clone()),
            &request,
            1,
        ) else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, (entry.next_hop.clone(), tx));
        if self
            .transport
            .send(&entry.next_hop, &forwarded.to_bytes())
            .await
            .is_err()
        {
            self.pending.remove(&request_id);
            let response = InvokeResponsePayload {
                request_id,
                success: false,
                data: None,
                error: Some(MeshError::new(
                    ErrorCode::CapabilityOffline,
                    "next hop unreachable",
                )),
                duration_ms: 0.0,
            };
            return self.send_response(&caller, response).await;
        }

        // Relay the eventual response back to the caller.
        let timeout = Duration::from_millis(request.timeout_ms.max(1));
        let executor_keypair = self.keypair.clone();
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let response = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => response,
                _ => InvokeResponsePayload {
                    request_id,
                    success: false,
                    data: None,
                    error: Some(MeshError::timeout("forwarded invoke")),
                    duration_ms: timeout.as_millis() as f64,
                },
            };
            if let Ok(envelope) = Envelope::build(
                MessageKind::InvokeResponse,
                &executor_keypair,
                Some(caller.clone()),
                &response,
                1,
            ) {
                let _ = transport.send(&caller, &envelope.to_bytes()).await;
            }
        });
    }

    fn handle_response(&self, envelope: Envelope) {
        let Ok(response) = envelope.payload_as::<InvokeResponsePayload>() else {
            warn!("malformed invoke response dropped");
            return;
        };
        if let Some((_, (_, tx))) = self.pending.remove(&response.request_id) {
            let _ = tx.send(response);
        } else {
            trace!(request_id = %response.request_id, "response for unknown request");
        }
    }

    async fn send_response(&self, caller: &NodeId, response: InvokeResponsePayload) {
        if let Ok(envelope) = Envelope::build(
            MessageKind::InvokeResponse,
            &self.keypair,
            Some(caller.clone()),
            &response,
            1,
        ) {
            let _ = self.transport.send(caller, &envelope.to_bytes()).await;
        }
    }
}

/// Effective invocation timeout: the tool's own, shortened by a caller
/// deadline when the context carries one.
fn effective_timeout(policy: &ExecutionPolicy, context: &Value) -> Duration {
    let tool_ms = policy.timeout_ms.max(1);
    let caller_ms = context
        .get("deadline_ms")
        .and_then(Value::as_u64)
        .unwrap_or(u64::MAX);
    Duration::from_millis(tool_ms.min(caller_ms))
}

/// Permission gate: every permission the tool lists must appear in the
/// caller context's `permissions` array.
fn check_permissions(tool: &Tool, context: &Value) -> Result<(), MeshError> {
    if tool.permissions.is_empty() {
        return Ok(());
    }
    let granted: Vec<&str> = context
        .get("permissions")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    for needed in &tool.permissions {
        if !granted.contains(&needed.as_str()) {
            return Err(MeshError::new(
                ErrorCode::ValidationError,
                format!("missing permission: {needed}"),
            )
            .with_detail("permission", needed.as_str()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::config::TransportScoreWeights;
    use crate::embed::HashedEmbedder;
    use crate::transport::loopback::LoopbackHub;
    use crate::transport::TransportEvent;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Echoes its params back, prefixed with the tool name.
    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn handle(
            &self,
            tool: &Tool,
            params: Value,
            _context: Value,
        ) -> Result<Value, MeshError> {
            Ok(json!({ "tool": tool.name, "echo": params }))
        }
    }

    struct Node {
        executor: Arc<Executor>,
        registry: Arc<CapabilityRegistry>,
        table: Arc<GradientTable>,
        node_id: NodeId,
    }

    /// Builds a node on the hub and pumps its inbound invoke envelopes
    /// into its executor.
    async fn node(hub: &LoopbackHub, seed: u8) -> Node {
        let keypair = MeshKeypair::from_seed(&[seed; 32]);
        let node_id = NodeId::from_public_key(&keypair.public_key());
        let embedder: Arc<dyn crate::embed::EmbeddingProvider> = Arc::new(HashedEmbedder::new());
        let registry = Arc::new(CapabilityRegistry::new(node_id.clone(), embedder));
        let table = Arc::new(GradientTable::new(node_id.clone()));

        let (events_tx, mut events_rx) = mpsc::channel(256);
        let transport = Arc::new(TransportManager::new(
            node_id.clone(),
            TransportScoreWeights::default(),
            events_tx,
        ));
        transport.register_transport(hub.transport_for(&node_id));
        transport.start().await.unwrap();

        let executor = Arc::new(Executor::new(
            keypair,
            Arc::clone(&registry),
            Arc::clone(&table),
            transport,
        ));

        let pump = Arc::clone(&executor);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let TransportEvent::Inbound { bytes, .. } = event {
                    if let Ok(envelope) = Envelope::from_bytes(&bytes) {
                        if matches!(
                            envelope.kind,
                            MessageKind::InvokeRequest | MessageKind::InvokeResponse
                        ) {
                            pump.handle_inbound(envelope).await;
                        }
                    }
                }
            }
        });

        Node {
            executor,
            registry,
            table,
            node_id,
        }
    }

    fn chat_capability() -> Capability {
        Capability {
            cap_type: "llm".into(),
            name: "chat".into(),
            label: "Chat".into(),
            description: "chat completion".into(),
            tools: vec![Tool {
                permissions: vec!["llm.use".into()],
                ..Tool::new(
                    "complete",
                    "complete a chat",
                    json!({"type": "object", "required": ["prompt"],
                           "properties": {"prompt": {"type": "string"}}}),
                )
            }],
            triggers: vec![],
            metadata: serde_json::Map::new(),
            constraints: Default::default(),
        }
    }

    fn granted_context() -> Value {
        json!({ "permissions": ["llm.use"] })
    }

    #[tokio::test]
    async fn local_execution_happy_path() {
        let hub = LoopbackHub::new();
        let n = node(&hub, 1).await;
        let cap = n.registry.register(chat_capability()).await.unwrap();
        n.executor.register_handler(cap.clone(), Arc::new(EchoHandler));

        let result = n
            .executor
            .execute_local(&cap, "complete", json!({"prompt": "hi"}), granted_context())
            .await
            .expect("executes");
        assert_eq!(result["tool"], "complete");
        assert_eq!(result["echo"]["prompt"], "hi");
    }

    #[tokio::test]
    async fn validation_gate_runs_before_the_handler() {
        let hub = LoopbackHub::new();
        let n = node(&hub, 1).await;
        let cap = n.registry.register(chat_capability()).await.unwrap();
        n.executor.register_handler(cap.clone(), Arc::new(EchoHandler));

        let err = n
            .executor
            .execute_local(&cap, "complete", json!({}), granted_context())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn permission_gate_blocks_unauthorized_callers() {
        let hub = LoopbackHub::new();
        let n = node(&hub, 1).await;
        let cap = n.registry.register(chat_capability()).await.unwrap();
        n.executor.register_handler(cap.clone(), Arc::new(EchoHandler));

        let err = n
            .executor
            .execute_local(&cap, "complete", json!({"prompt": "hi"}), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("permission"));
    }

    #[tokio::test]
    async fn unknown_tool_and_capability_errors() {
        let hub = LoopbackHub::new();
        let n = node(&hub, 1).await;
        let cap = n.registry.register(chat_capability()).await.unwrap();

        let err = n
            .executor
            .execute_local(&cap, "no-such-tool", json!({}), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolNotFound);

        let ghost = CapabilityId::parse("aa:llm:ghost").unwrap();
        let err = n
            .executor
            .execute_local(&ghost, "complete", json!({}), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[tokio::test]
    async fn unbound_capability_is_offline() {
        let hub = LoopbackHub::new();
        let n = node(&hub, 1).await;
        let cap = n.registry.register(chat_capability()).await.unwrap();
        // No handler registered.
        let err = n
            .executor
            .execute_local(&cap, "complete", json!({"prompt": "x"}), granted_context())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityOffline);
    }

    #[tokio::test]
    async fn remote_invoke_round_trip() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 1).await;
        let b = node(&hub, 2).await;

        let cap = b.registry.register(chat_capability()).await.unwrap();
        b.executor.register_handler(cap.clone(), Arc::new(EchoHandler));

        let decision = RouteDecision {
            node_id: b.node_id.clone(),
            capability_id: cap.clone(),
            score: 0.9,
            hops: 1,
            est_latency_ms: 10.0,
            next_hop: b.node_id.clone(),
        };
        let result = a
            .executor
            .execute(
                &decision,
                "complete",
                json!({"prompt": "over the mesh"}),
                granted_context(),
                &ExecutionPolicy::default(),
            )
            .await
            .expect("round trip");
        assert_eq!(result["echo"]["prompt"], "over the mesh");
        assert_eq!(a.executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn remote_validation_error_comes_back_unchanged() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 1).await;
        let b = node(&hub, 2).await;

        let cap = b.registry.register(chat_capability()).await.unwrap();
        b.executor.register_handler(cap.clone(), Arc::new(EchoHandler));

        let decision = RouteDecision {
            node_id: b.node_id.clone(),
            capability_id: cap.clone(),
            score: 0.9,
            hops: 1,
            est_latency_ms: 10.0,
            next_hop: b.node_id.clone(),
        };
        let err = a
            .executor
            .execute(
                &decision,
                "complete",
                json!({"wrong": true}),
                granted_context(),
                &ExecutionPolicy::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn timeout_against_silent_peer_surfaces() {
        let hub = LoopbackHub::new();
        let a = node(&hub, 1).await;
        let b = node(&hub, 2).await;
        // B exists on the hub but has no such capability and no handler;
        // sever the link so the send itself fails fast.
        hub.sever(&a.node_id, &b.node_id);

        let cap = CapabilityId::new(&b.node_id, "llm", "chat");
        a.table.update_at(
            cap.clone(),
            "Chat".into(),
            crate::embed::Embedding::new(vec![1.0; crate::config::EMBEDDING_DIM]).unwrap(),
            1,
            b.node_id.clone(),
            b.node_id.clone(),
            None,
            Default::default(),
            crate::clock::now_secs(),
        );

        let decision = RouteDecision {
            node_id: b.node_id.clone(),
            capability_id: cap,
            score: 0.9,
            hops: 1,
            est_latency_ms: 10.0,
            next_hop: b.node_id.clone(),
        };
        let err = a
            .executor
            .execute(
                &decision,
                "complete",
                json!({"prompt": "x"}),
                granted_context(),
                &ExecutionPolicy {
                    timeout_ms: 200,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityOffline);
    }
}
