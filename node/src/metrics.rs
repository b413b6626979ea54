//! # Prometheus Metrics
//!
//! Operational metrics for the mesh node, scraped at `/metrics` on the
//! configured metrics port.
//!
//! Counters mirror the library's atomic counters; gauges are refreshed
//! from live state at scrape time. Everything registers in a dedicated
//! [`prometheus::Registry`] so nothing collides with a default global
//! registry consumer.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use murmur_mesh::MeshNode;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Announcements this node has broadcast.
    pub gossip_announcements_sent: IntCounter,
    /// Announcements accepted from peers.
    pub gossip_announcements_received: IntCounter,
    /// Replayed nonces dropped silently.
    pub gossip_duplicate_drop: IntCounter,
    /// Messages rejected for clock skew.
    pub gossip_skew_rejected: IntCounter,
    /// Messages rejected for bad signatures.
    pub gossip_signature_rejected: IntCounter,
    /// Messages forwarded onward (fan-out).
    pub gossip_forwards: IntCounter,
    /// Current entries in the gradient table.
    pub gradient_table_size: IntGauge,
    /// Known mesh peers.
    pub known_peers: IntGauge,
    /// Tool calls executed on this node.
    pub invoke_local_total: IntCounter,
    /// Tool calls forwarded to other nodes.
    pub invoke_forwarded_total: IntCounter,
    /// Invocations that timed out.
    pub invoke_timeouts_total: IntCounter,
    /// Frames that failed on every transport.
    pub transport_send_failures: IntCounter,
    /// Trigger events suppressed by the throttle gate.
    pub triggers_throttled_total: IntCounter,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("murmur".into()), None)
            .expect("failed to create prometheus registry");

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("metric creation");
            registry.register(Box::new(c.clone())).expect("metric registration");
            c
        }
        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::new(name, help).expect("metric creation");
            registry.register(Box::new(g.clone())).expect("metric registration");
            g
        }

        Self {
            gossip_announcements_sent: counter(
                &registry,
                "gossip_announcements_sent",
                "Announcements broadcast by this node",
            ),
            gossip_announcements_received: counter(
                &registry,
                "gossip_announcements_received",
                "Announcements accepted from peers",
            ),
            gossip_duplicate_drop: counter(
                &registry,
                "gossip_duplicate_drop",
                "Replayed nonces dropped silently",
            ),
            gossip_skew_rejected: counter(
                &registry,
                "gossip_skew_rejected",
                "Messages rejected for clock skew",
            ),
            gossip_signature_rejected: counter(
                &registry,
                "gossip_signature_rejected",
                "Messages rejected for invalid signatures",
            ),
            gossip_forwards: counter(
                &registry,
                "gossip_forwards",
                "Messages forwarded onward per the fan-out rule",
            ),
            gradient_table_size: gauge(
                &registry,
                "gradient_table_size",
                "Current entries in the gradient table",
            ),
            known_peers: gauge(&registry, "known_peers", "Known mesh peers"),
            invoke_local_total: counter(
                &registry,
                "invoke_local_total",
                "Tool calls executed locally",
            ),
            invoke_forwarded_total: counter(
                &registry,
                "invoke_forwarded_total",
                "Tool calls forwarded to other nodes",
            ),
            invoke_timeouts_total: counter(
                &registry,
                "invoke_timeouts_total",
                "Invocations that timed out",
            ),
            transport_send_failures: counter(
                &registry,
                "transport_send_failures",
                "Frames that failed on every transport",
            ),
            triggers_throttled_total: counter(
                &registry,
                "triggers_throttled_total",
                "Trigger events suppressed by the throttle gate",
            ),
            registry,
        }
    }

    /// Pulls the library's atomic counters into the Prometheus handles.
    /// Counters only move forward, so the sync is a delta-add.
    pub fn refresh_from(&self, node: &MeshNode) {
        use std::sync::atomic::Ordering;

        let gossip = &node.engine().counters;
        let exec = &node.executor().counters;
        let transport = &node.transport().counters;

        sync_counter(
            &self.gossip_announcements_sent,
            gossip.announcements_sent.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.gossip_announcements_received,
            gossip.announcements_received.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.gossip_duplicate_drop,
            gossip.duplicate_drops.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.gossip_skew_rejected,
            gossip.skew_rejections.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.gossip_signature_rejected,
            gossip.signature_rejections.load(Ordering::Relaxed),
        );
        sync_counter(&self.gossip_forwards, gossip.forwards.load(Ordering::Relaxed));
        sync_counter(
            &self.invoke_local_total,
            exec.local_executions.load(Ordering::Relaxed),
        );
        sync_counter(
            &self.invoke_forwarded_total,
            exec.forwarded.load(Ordering::Relaxed),
        );
        sync_counter(&self.invoke_timeouts_total, exec.timeouts.load(Ordering::Relaxed));
        sync_counter(
            &self.transport_send_failures,
            transport.sends_failed.load(Ordering::Relaxed),
        );

        self.gradient_table_size.set(node.table().size() as i64);
        self.known_peers.set(node.transport().peers().len() as i64);
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Advances a Prometheus counter to an absolute value.
fn sync_counter(counter: &IntCounter, absolute: u64) {
    let current = counter.get();
    if absolute > current {
        counter.inc_by(absolute - current);
    }
}

/// State handed to the metrics handler: the node for refresh, the handles
/// for encoding.
#[derive(Clone)]
pub struct MetricsState {
    pub node: Arc<MeshNode>,
    pub metrics: Arc<NodeMetrics>,
}

/// Axum handler rendering `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<MetricsState>,
) -> impl IntoResponse {
    state.metrics.refresh_from(&state.node);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = NodeMetrics::new();
        metrics.gossip_duplicate_drop.inc();
        metrics.gradient_table_size.set(7);

        let body = metrics.encode().expect("encodes");
        assert!(body.contains("murmur_gossip_duplicate_drop 1"));
        assert!(body.contains("murmur_gradient_table_size 7"));
    }

    #[test]
    fn sync_counter_never_goes_backward() {
        let c = IntCounter::new("x", "x").unwrap();
        sync_counter(&c, 5);
        assert_eq!(c.get(), 5);
        sync_counter(&c, 3); // stale reading: no change
        assert_eq!(c.get(), 5);
        sync_counter(&c, 9);
        assert_eq!(c.get(), 9);
    }
}
