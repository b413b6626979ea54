//! Per-peer connection pool.
//!
//! One pool per peer; at most one live connection per transport class.
//! `send` walks the preferred transport first, then the remaining classes
//! in priority order, dialing lazily and retrying a transient failure once
//! on the same transport before falling through.
//!
//! Preference switching is hysteretic: the top-scoring transport must beat
//! the incumbent by [`SWITCH_HYSTERESIS`] composite points before the pool
//! re-marks it. Two links of near-equal quality would otherwise flap on
//! every probe.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::{TransportScoreWeights, SWITCH_HYSTERESIS};
use crate::identity::NodeId;

use super::metrics::LinkMetrics;
use super::{Connection, Transport, TransportError, TransportKind};

struct Slot {
    connection: Option<Arc<dyn Connection>>,
    metrics: LinkMetrics,
}

/// The per-peer pool. Owned by the manager behind an async mutex; outside
/// callers interact only through the manager's `send`/`broadcast`.
pub struct ConnectionPool {
    peer: NodeId,
    slots: HashMap<TransportKind, Slot>,
    preferred: Option<TransportKind>,
    weights: TransportScoreWeights,
    /// Monotonic seconds of the last successful delivery to this peer.
    last_delivery: Option<f64>,
}

impl ConnectionPool {
    pub fn new(peer: NodeId, weights: TransportScoreWeights) -> Self {
        Self {
            peer,
            slots: HashMap::new(),
            preferred: None,
            weights,
            last_delivery: None,
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn preferred(&self) -> Option<TransportKind> {
        self.preferred
    }

    /// Sends one frame, trying transports in preference order.
    ///
    /// Returns the transport class that delivered. Each class gets one
    /// retry for a transient failure before the pool falls through to the
    /// next; a class with no registered driver is skipped.
    pub async fn send(
        &mut self,
        transports: &BTreeMap<TransportKind, Arc<dyn Transport>>,
        bytes: &[u8],
        now_monotonic_secs: f64,
    ) -> Result<TransportKind, TransportError> {
        for kind in self.try_order() {
            let Some(transport) = transports.get(&kind) else {
                continue;
            };

            match self.send_on(transport.as_ref(), kind, bytes).await {
                Ok(latency_ms) => {
                    let slot = self.slot_mut(kind);
                    slot.metrics.record_success(latency_ms, bytes.len());
                    self.last_delivery = Some(now_monotonic_secs);
                    self.rerank();
                    return Ok(kind);
                }
                Err(e) => {
                    self.slot_mut(kind).metrics.record_failure();
                    trace!(peer = %self.peer.short(), transport = %kind, "send failed, falling through: {e}");
                }
            }
        }

        warn!(peer = %self.peer.short(), "no transport delivered");
        Err(TransportError::NoTransport(self.peer.short().to_string()))
    }

    /// One attempt plus one same-transport retry. Returns observed latency.
    async fn send_on(
        &mut self,
        transport: &dyn Transport,
        kind: TransportKind,
        bytes: &[u8],
    ) -> Result<f64, TransportError> {
        for attempt in 0..2 {
            let connection = match self.live_connection(transport, kind).await {
                Ok(c) => c,
                Err(e) if attempt == 0 => {
                    trace!(peer = %self.peer.short(), transport = %kind, "dial failed once: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let started = Instant::now();
            match connection.send(bytes).await {
                Ok(()) => return Ok(started.elapsed().as_secs_f64() * 1000.0),
                Err(e) => {
                    // A dead connection is dropped so the retry re-dials.
                    self.slot_mut(kind).connection = None;
                    if attempt == 1 {
                        return Err(e);
                    }
                }
            }
        }
        Err(TransportError::SendFailed("retries exhausted".into()))
    }

    /// Reuses the slot's connection or dials a fresh one.
    async fn live_connection(
        &mut self,
        transport: &dyn Transport,
        kind: TransportKind,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(slot) = self.slots.get(&kind) {
            if let Some(conn) = &slot.connection {
                if conn.is_open() {
                    return Ok(Arc::clone(conn));
                }
            }
        }
        let conn = transport.connect(&self.peer).await?;
        self.slot_mut(kind).connection = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Records a probe result for a (usually non-preferred) transport.
    pub fn record_probe(&mut self, kind: TransportKind, result: Result<f64, ()>) {
        let slot = self.slot_mut(kind);
        match result {
            Ok(latency_ms) => slot.metrics.record_success(latency_ms, 0),
            Err(()) => slot.metrics.record_failure(),
        }
        self.rerank();
    }

    /// Transport classes worth probing right now: every registered class
    /// except the current preferred one.
    pub fn probe_targets(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .iter()
            .copied()
            .filter(|k| Some(*k) != self.preferred)
            .collect()
    }

    /// Seconds since the last successful delivery, if any ever happened.
    pub fn seconds_since_delivery(&self, now_monotonic_secs: f64) -> Option<f64> {
        self.last_delivery.map(|t| (now_monotonic_secs - t).max(0.0))
    }

    /// Records an out-of-band successful delivery (e.g. a probe frame).
    pub fn note_delivery(&mut self, now_monotonic_secs: f64) {
        self.last_delivery = Some(now_monotonic_secs);
    }

    /// Metrics for every class this pool has touched.
    pub fn metrics_snapshot(&self) -> Vec<LinkMetrics> {
        self.slots.values().map(|s| s.metrics.clone()).collect()
    }

    /// Drops all live connections (shutdown path).
    pub async fn close_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(conn) = slot.connection.take() {
                conn.close().await;
            }
        }
    }

    // -- Internals --------------------------------------------------------

    /// The order `send` tries transports: preferred first, then priority.
    fn try_order(&self) -> Vec<TransportKind> {
        let mut order = Vec::with_capacity(TransportKind::ALL.len());
        if let Some(preferred) = self.preferred {
            order.push(preferred);
        }
        for kind in TransportKind::ALL {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }

    fn slot_mut(&mut self, kind: TransportKind) -> &mut Slot {
        self.slots.entry(kind).or_insert_with(|| Slot {
            connection: None,
            metrics: LinkMetrics::seeded(kind),
        })
    }

    /// Applies the hysteresis rule to the preferred transport.
    fn rerank(&mut self) {
        let best = self
            .slots
            .iter()
            .max_by(|(_, a), (_, b)| {
                a.metrics
                    .composite_score(&self.weights)
                    .partial_cmp(&b.metrics.composite_score(&self.weights))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(kind, slot)| (*kind, slot.metrics.composite_score(&self.weights)));

        let Some((candidate, candidate_score)) = best else {
            return;
        };

        match self.preferred {
            None => {
                self.preferred = Some(candidate);
                debug!(peer = %self.peer.short(), transport = %candidate, "preferred transport set");
            }
            Some(current) if current != candidate => {
                let current_score = self
                    .slots
                    .get(&current)
                    .map(|s| s.metrics.composite_score(&self.weights))
                    .unwrap_or(f64::MIN);
                if candidate_score >= current_score + SWITCH_HYSTERESIS {
                    debug!(
                        peer = %self.peer.short(),
                        from = %current,
                        to = %candidate,
                        margin = candidate_score - current_score,
                        "preferred transport switched"
                    );
                    self.preferred = Some(candidate);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MeshKeypair;

    fn peer() -> NodeId {
        NodeId::from_public_key(&MeshKeypair::generate().public_key())
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(peer(), TransportScoreWeights::default())
    }

    #[test]
    fn first_probe_sets_preferred() {
        let mut p = pool();
        assert_eq!(p.preferred(), None);
        p.record_probe(TransportKind::Relay, Ok(80.0));
        assert_eq!(p.preferred(), Some(TransportKind::Relay));
    }

    #[test]
    fn switching_requires_the_hysteresis_margin() {
        // P2P and LAN with identical latency and success differ only in
        // nominal bandwidth/power, a gap well inside the 20-point margin.
        let mut p = pool();
        for _ in 0..20 {
            p.record_probe(TransportKind::P2pDirect, Ok(10.0));
        }
        assert_eq!(p.preferred(), Some(TransportKind::P2pDirect));

        for _ in 0..20 {
            p.record_probe(TransportKind::Lan, Ok(10.0));
        }
        // LAN scores a little higher but not 20 points higher: no switch.
        assert_eq!(p.preferred(), Some(TransportKind::P2pDirect));

        // Once the incumbent degrades hard, the margin clears and LAN wins.
        for _ in 0..30 {
            p.record_probe(TransportKind::P2pDirect, Err(()));
        }
        assert_eq!(p.preferred(), Some(TransportKind::Lan));
    }

    #[test]
    fn probe_targets_exclude_preferred() {
        let mut p = pool();
        p.record_probe(TransportKind::Lan, Ok(5.0));
        let targets = p.probe_targets();
        assert!(!targets.contains(&TransportKind::Lan));
        assert_eq!(targets.len(), TransportKind::ALL.len() - 1);
    }

    #[test]
    fn failures_erode_preference_eligibility() {
        let mut p = pool();
        p.record_probe(TransportKind::Lan, Ok(5.0));
        // LAN collapses; direct P2P stays healthy and clears the margin.
        for _ in 0..30 {
            p.record_probe(TransportKind::Lan, Err(()));
            p.record_probe(TransportKind::P2pDirect, Ok(10.0));
        }
        assert_eq!(p.preferred(), Some(TransportKind::P2pDirect));
    }

    #[test]
    fn delivery_clock_tracks_last_success() {
        let p = pool();
        assert_eq!(p.seconds_since_delivery(100.0), None);
    }

    #[tokio::test]
    async fn send_with_no_transports_fails() {
        let mut p = pool();
        let transports = BTreeMap::new();
        let err = p.send(&transports, b"hello", 0.0).await.unwrap_err();
        assert!(matches!(err, TransportError::NoTransport(_)));
    }
}
