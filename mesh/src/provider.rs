//! # Capability-Provider Interface
//!
//! The seam between the core and external backend adapters (inference
//! runtimes, smart-home bridges, cloud APIs). Adapters live outside this
//! crate; the core consumes exactly this surface:
//!
//! ```text
//! discover()      — is the backend reachable at all
//! connect()       — hand over capability definitions (tools included)
//! health_check()  — liveness + latency, feeds capability heartbeats
//! execute()       — run one tool call
//! disconnect()    — release the backend
//! ```
//!
//! [`ProviderHandler`] binds a connected provider to the executor's
//! [`ToolHandler`] seam so routed invocations reach the backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{Capability, Tool};
use crate::error::{ErrorCode, MeshError};
use crate::exec::ToolHandler;

/// Result of a provider health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result of one provider-side tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderExecution {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl ProviderExecution {
    pub fn ok(data: Value, duration_ms: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// A backend adapter the node can source capabilities from.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Short stable name, used in logs and capability metadata.
    fn name(&self) -> &str;

    /// Whether the backend is reachable. Cheap; called before `connect`.
    async fn discover(&self) -> bool;

    /// Connects and returns the capabilities (tools included) this
    /// backend contributes.
    async fn connect(&self) -> Result<Vec<Capability>, MeshError>;

    /// Liveness probe; healthy results heartbeat the provider's
    /// capabilities.
    async fn health_check(&self) -> ProviderHealth;

    /// Executes one tool call on the backend.
    async fn execute(&self, tool_name: &str, params: Value, context: Value) -> ProviderExecution;

    /// Releases the backend.
    async fn disconnect(&self);
}

/// Adapts a [`CapabilityProvider`] to the executor's handler seam.
pub struct ProviderHandler {
    provider: Arc<dyn CapabilityProvider>,
}

impl ProviderHandler {
    pub fn new(provider: Arc<dyn CapabilityProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ToolHandler for ProviderHandler {
    async fn handle(
        &self,
        tool: &Tool,
        params: Value,
        context: Value,
    ) -> Result<Value, MeshError> {
        let result = self.provider.execute(&tool.name, params, context).await;
        if result.success {
            Ok(result.data.unwrap_or(Value::Null))
        } else {
            Err(MeshError::new(
                ErrorCode::CapabilityOffline,
                result
                    .error
                    .unwrap_or_else(|| "provider execution failed".into()),
            )
            .with_detail("provider", self.provider.name())
            .with_retryable(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeBackend;

    #[async_trait]
    impl CapabilityProvider for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn discover(&self) -> bool {
            true
        }

        async fn connect(&self) -> Result<Vec<Capability>, MeshError> {
            Ok(vec![])
        }

        async fn health_check(&self) -> ProviderHealth {
            ProviderHealth {
                healthy: true,
                latency_ms: 3.0,
                details: None,
            }
        }

        async fn execute(
            &self,
            tool_name: &str,
            params: Value,
            _context: Value,
        ) -> ProviderExecution {
            if tool_name == "boom" {
                ProviderExecution::failed("backend exploded", 1.0)
            } else {
                ProviderExecution::ok(json!({ "ran": tool_name, "with": params }), 1.0)
            }
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn handler_maps_success_and_failure() {
        let handler = ProviderHandler::new(Arc::new(FakeBackend));
        let tool = Tool::new("echo", "echo", json!({}));

        let ok = handler
            .handle(&tool, json!({"x": 1}), json!({}))
            .await
            .expect("success");
        assert_eq!(ok["ran"], "echo");

        let boom = Tool::new("boom", "boom", json!({}));
        let err = handler.handle(&boom, json!({}), json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityOffline);
        assert!(err.retryable);
        assert_eq!(err.details["provider"], "fake");
    }
}
