//! Per-link rolling metrics and the composite transport score.
//!
//! Each (peer, transport) pair keeps exponentially weighted averages of
//! latency and success, a crude bandwidth estimate from observed frame
//! sizes, and a power figure seeded from the transport class. The
//! composite score folds them into one comparable number:
//!
//! ```text
//! 0.4·(100 − latency_ms) + 0.3·success·100 + 0.2·min(100, bw_mbps)
//!                        + 0.1·(100 − power_mW/10)
//! ```
//!
//! Weights are configurable ([`TransportScoreWeights`]); these are the
//! documented defaults. Higher is better.

use serde::{Deserialize, Serialize};

use crate::config::TransportScoreWeights;

use super::TransportKind;

/// EWMA smoothing factor. New observations carry 20% weight — responsive
/// without letting one slow send trash a good link's score.
const ALPHA: f64 = 0.2;

/// Rolling quality metrics for one peer over one transport class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub kind: TransportKind,
    /// EWMA round-trip-ish latency in milliseconds.
    pub avg_latency_ms: f64,
    /// EWMA success rate, 0.0–1.0.
    pub success_rate: f64,
    /// Estimated usable bandwidth in Mbps.
    pub bandwidth_mbps: f64,
    /// Estimated power cost of using this link, in milliwatts.
    pub power_mw: f64,
    /// Samples observed; scores are provisional until a few arrive.
    pub samples: u64,
}

impl LinkMetrics {
    /// Fresh metrics seeded from the class's nominal figures and a neutral
    /// 50 ms / 100% success prior.
    pub fn seeded(kind: TransportKind) -> Self {
        Self {
            kind,
            avg_latency_ms: 50.0,
            success_rate: 1.0,
            bandwidth_mbps: kind.nominal_bandwidth_mbps(),
            power_mw: kind.nominal_power_mw(),
            samples: 0,
        }
    }

    /// Records a successful send/probe.
    pub fn record_success(&mut self, latency_ms: f64, bytes: usize) {
        self.avg_latency_ms = ewma(self.avg_latency_ms, latency_ms);
        self.success_rate = ewma(self.success_rate, 1.0);
        if latency_ms > 0.0 && bytes > 512 {
            // Only meaningful frames move the bandwidth estimate.
            let mbps = (bytes as f64 * 8.0 / 1_000_000.0) / (latency_ms / 1000.0);
            self.bandwidth_mbps = ewma(self.bandwidth_mbps, mbps);
        }
        self.samples += 1;
    }

    /// Records a failed send/probe.
    pub fn record_failure(&mut self) {
        self.success_rate = ewma(self.success_rate, 0.0);
        self.samples += 1;
    }

    /// The composite quality score under the given weights.
    pub fn composite_score(&self, weights: &TransportScoreWeights) -> f64 {
        weights.latency * (100.0 - self.avg_latency_ms)
            + weights.success * self.success_rate * 100.0
            + weights.bandwidth * self.bandwidth_mbps.min(100.0)
            + weights.power * (100.0 - self.power_mw / 10.0)
    }
}

fn ewma(current: f64, observation: f64) -> f64 {
    current * (1.0 - ALPHA) + observation * ALPHA
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> TransportScoreWeights {
        TransportScoreWeights::default()
    }

    #[test]
    fn seeded_lan_beats_seeded_relay() {
        let lan = LinkMetrics::seeded(TransportKind::Lan);
        let relay = LinkMetrics::seeded(TransportKind::Relay);
        assert!(lan.composite_score(&weights()) > relay.composite_score(&weights()));
    }

    #[test]
    fn failures_drag_the_score_down() {
        let mut m = LinkMetrics::seeded(TransportKind::Lan);
        let before = m.composite_score(&weights());
        for _ in 0..10 {
            m.record_failure();
        }
        let after = m.composite_score(&weights());
        assert!(after < before);
        assert!(m.success_rate < 0.2);
    }

    #[test]
    fn latency_observations_move_the_average() {
        let mut m = LinkMetrics::seeded(TransportKind::Lan);
        for _ in 0..50 {
            m.record_success(5.0, 64);
        }
        assert!(m.avg_latency_ms < 10.0);

        for _ in 0..50 {
            m.record_success(200.0, 64);
        }
        assert!(m.avg_latency_ms > 150.0);
    }

    #[test]
    fn small_frames_do_not_move_bandwidth() {
        let mut m = LinkMetrics::seeded(TransportKind::Lan);
        let bw = m.bandwidth_mbps;
        m.record_success(1.0, 64);
        assert_eq!(m.bandwidth_mbps, bw);

        // A 1 MB frame in 100 ms ≈ 80 Mbps observation.
        m.record_success(100.0, 1_000_000);
        assert_ne!(m.bandwidth_mbps, bw);
    }

    #[test]
    fn documented_score_formula() {
        // Spot-check the formula with round numbers.
        let m = LinkMetrics {
            kind: TransportKind::Lan,
            avg_latency_ms: 20.0,
            success_rate: 0.9,
            bandwidth_mbps: 300.0,
            power_mw: 500.0,
            samples: 100,
        };
        let expected = 0.4 * 80.0 + 0.3 * 90.0 + 0.2 * 100.0 + 0.1 * 50.0;
        assert!((m.composite_score(&weights()) - expected).abs() < 1e-9);
    }
}
