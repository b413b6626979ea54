//! # Public Error Surface
//!
//! Every error that crosses the core's public boundary is a [`MeshError`]
//! carrying a stable machine-readable [`ErrorCode`], a human message,
//! optional structured details, and a retryability hint.
//!
//! Internal modules keep their own `thiserror` enums; they convert into
//! `MeshError` at the surface so callers never have to match on module
//! internals.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes surfaced at the core's public entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No gradient entry and no local capability for the request.
    CapabilityNotFound,
    /// An entry exists but its peer is unreachable via any transport.
    CapabilityOffline,
    /// The capability exists but the named tool does not.
    ToolNotFound,
    /// Parameters violate the tool's schema.
    ValidationError,
    /// No response within the deadline.
    Timeout,
    /// Nothing scored above `min_score`, or constraints left no candidates.
    RoutingFailed,
    /// Mesh token invalid or expired, or signature verification failed.
    AuthFailed,
    /// A hard constraint (e.g. `data_stays_local`) left no eligible peer.
    ConstraintUnsatisfied,
}

impl ErrorCode {
    /// Wire/name form of the code, e.g. `"capability_not_found"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapabilityNotFound => "capability_not_found",
            ErrorCode::CapabilityOffline => "capability_offline",
            ErrorCode::ToolNotFound => "tool_not_found",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RoutingFailed => "routing_failed",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::ConstraintUnsatisfied => "constraint_unsatisfied",
        }
    }

    /// Whether a request failing with this code is worth retrying as-is.
    /// Validation and auth failures are not — resending the same bytes
    /// produces the same answer.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::CapabilityOffline | ErrorCode::Timeout | ErrorCode::RoutingFailed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned from the core's public surface.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct MeshError {
    pub code: ErrorCode,
    pub message: String,
    /// Structured context: capability ids, peer ids, schema paths.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub retryable: bool,
}

impl MeshError {
    /// Builds an error with the code's default retryability and no details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Map::new(),
            retryable: code.default_retryable(),
        }
    }

    /// Attaches a structured detail field.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Overrides the retryability hint.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn capability_not_found(capability_id: &str) -> Self {
        Self::new(
            ErrorCode::CapabilityNotFound,
            format!("no route or local capability for {capability_id}"),
        )
        .with_detail("capability_id", capability_id)
    }

    pub fn tool_not_found(capability_id: &str, tool: &str) -> Self {
        Self::new(
            ErrorCode::ToolNotFound,
            format!("capability {capability_id} has no tool named {tool}"),
        )
        .with_detail("capability_id", capability_id)
        .with_detail("tool", tool)
    }

    pub fn timeout(what: &str) -> Self {
        Self::new(ErrorCode::Timeout, format!("{what} timed out"))
    }

    pub fn auth_failed(reason: &str) -> Self {
        Self::new(ErrorCode::AuthFailed, format!("authentication failed: {reason}"))
    }

    pub fn routing_failed(reason: &str) -> Self {
        Self::new(ErrorCode::RoutingFailed, format!("routing failed: {reason}"))
    }

    pub fn constraint_unsatisfied(constraint: &str) -> Self {
        Self::new(
            ErrorCode::ConstraintUnsatisfied,
            format!("constraint {constraint} left no eligible capability"),
        )
        .with_detail("constraint", constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ConstraintUnsatisfied).unwrap();
        assert_eq!(json, "\"constraint_unsatisfied\"");
        assert_eq!(ErrorCode::AuthFailed.as_str(), "auth_failed");
    }

    #[test]
    fn retryability_defaults() {
        assert!(ErrorCode::Timeout.default_retryable());
        assert!(ErrorCode::CapabilityOffline.default_retryable());
        assert!(!ErrorCode::ValidationError.default_retryable());
        assert!(!ErrorCode::AuthFailed.default_retryable());
    }

    #[test]
    fn error_roundtrip_keeps_details() {
        let err = MeshError::tool_not_found("node-a:llm:chat", "complete");
        let json = serde_json::to_string(&err).unwrap();
        let back: MeshError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::ToolNotFound);
        assert_eq!(back.details["tool"], "complete");
        assert!(!back.retryable);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = MeshError::timeout("invoke of node-a:llm:chat");
        let s = err.to_string();
        assert!(s.starts_with("timeout:"));
        assert!(s.contains("timed out"));
    }
}
