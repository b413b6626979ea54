//! # Mesh Configuration & Constants
//!
//! Every protocol constant lives here, alongside the serde-typed
//! [`NodeConfig`] that is persisted at `<config_root>/config.json`.
//!
//! The constants are the defaults; most of them can be overridden per
//! deployment through [`Limits`] and [`TransportScoreWeights`]. The values
//! that are *not* configurable (vector dimension, confidence decay) are the
//! ones a mesh cannot disagree on without partitioning itself.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Identity
// ---------------------------------------------------------------------------

/// Protocol fingerprint used in handshakes and version negotiation.
pub const PROTOCOL_FINGERPRINT: &str = "MURMUR-MESH-1";

/// Wire protocol version. Bumped on envelope-breaking changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// The full crate version string.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Embedding Parameters
// ---------------------------------------------------------------------------

/// Dimensionality of all capability and intent vectors. Matches the
/// MiniLM-class sentence encoders every supported embedding backend ships.
/// This is a mesh-wide invariant, not a tunable.
pub const EMBEDDING_DIM: usize = 384;

/// Tolerance when checking that a vector is unit length. Vectors further
/// than this from 1.0 are re-normalized or rejected.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

/// Bounded LRU size for the embedding cache. Gossip churn re-announces the
/// same capability descriptions constantly; re-embedding them is wasted CPU.
pub const EMBED_CACHE_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// Gradient Table Parameters
// ---------------------------------------------------------------------------

/// Maximum number of entries in the gradient table. The cap is what keeps
/// capability spam from turning the routing table into a memory leak.
pub const GRADIENT_TABLE_MAX: usize = 1000;

/// Entries older than this are expired and eligible for pruning.
pub const GRADIENT_EXPIRE_SECS: f64 = 300.0;

/// Estimated added latency per network hop, in milliseconds.
pub const HOP_LATENCY_MS: f64 = 10.0;

/// Confidence decay per hop: `confidence = CONFIDENCE_DECAY ^ hops`.
pub const CONFIDENCE_DECAY: f64 = 0.95;

/// Minimum adjusted similarity for the router to return a route at all.
pub const MIN_ROUTE_SCORE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Router Policy Multipliers
// ---------------------------------------------------------------------------

/// Boost when a high-reasoning intent matches a large-model capability.
pub const LARGE_MODEL_BOOST: f64 = 1.2;

/// Boost when intent keywords match the capability type tag.
pub const SPECIALTY_BOOST: f64 = 1.2;

/// Penalty applied when the target's last known load exceeds [`HIGH_LOAD`].
pub const LOAD_PENALTY: f64 = 0.7;

/// Bonus applied when the target's last known load is below [`LOW_LOAD`].
pub const IDLE_BONUS: f64 = 1.1;

/// Load fraction above which a peer counts as busy.
pub const HIGH_LOAD: f64 = 0.8;

/// Load fraction below which a peer counts as idle.
pub const LOW_LOAD: f64 = 0.3;

/// Bonus for zero-cost capabilities when the caller prefers free execution.
pub const FREE_LOCAL_BONUS: f64 = 1.3;

/// Penalty for metered capabilities when the caller prefers free execution.
pub const CLOUD_PENALTY: f64 = 0.8;

// ---------------------------------------------------------------------------
// Gossip Parameters
// ---------------------------------------------------------------------------

/// How often the gossip engine announces local capabilities.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// How often the gossip engine prunes expired gradient entries and nonces.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Number of peers each message is forwarded to per round. With fan-out 3
/// and a 30-second cadence, a capability crosses a million-node mesh in
/// roughly 20 rounds.
pub const GOSSIP_FANOUT: usize = 3;

/// Initial TTL on announcements. Decremented once per forward.
pub const ANNOUNCE_TTL: u8 = 10;

/// Cap on capabilities carried per announcement. Larger registries are
/// split across rounds rather than producing jumbo messages.
pub const MAX_CAPS_PER_ANNOUNCEMENT: usize = 50;

/// Seconds a `(nonce, timestamp)` pair is retained for replay protection.
pub const NONCE_CACHE_SECS: f64 = 300.0;

/// Maximum tolerated clock skew on incoming message timestamps.
pub const TIMESTAMP_SKEW_SECS: f64 = 300.0;

/// Seconds a removed capability id is tombstoned so that stale
/// re-announcements in flight do not resurrect it.
pub const TOMBSTONE_SECS: f64 = 60.0;

/// Seconds without a heartbeat before a capability is considered stale.
pub const HEARTBEAT_STALE_SECS: f64 = 90.0;

/// Seconds of staleness after which a capability is removed outright.
pub const STALE_REMOVAL_SECS: f64 = 900.0;

// ---------------------------------------------------------------------------
// Transport Parameters
// ---------------------------------------------------------------------------

/// Interval between probes on non-preferred transports.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Seconds of delivery failure after which a peer is marked offline.
pub const PEER_OFFLINE_SECS: f64 = 90.0;

/// Minimum composite-score margin before the pool switches its preferred
/// transport. Hysteresis: without it two near-equal links flap endlessly.
pub const SWITCH_HYSTERESIS: f64 = 20.0;

/// Bounded outbound send queue per peer. Gossip fails fast on overflow to
/// protect the announce cadence; the executor blocks with a deadline.
pub const SEND_QUEUE_CAP: usize = 1024;

/// Bounded inbound receive queue per peer. Overflow is dropped and counted.
pub const RECV_QUEUE_CAP: usize = 256;

/// BLE mesh segment limits. Low-power radio does not get to flood.
pub const BLE_MAX_HOPS: u8 = 3;
pub const BLE_MAX_TTL: u8 = 5;

/// Default LAN WebSocket listen port.
pub const DEFAULT_LAN_PORT: u16 = 7341;

/// Default UDP port for LAN service-broadcast discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7342;

/// Default operator API port (served by the node binary).
pub const DEFAULT_API_PORT: u16 = 7343;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 7344;

// ---------------------------------------------------------------------------
// Auth Parameters
// ---------------------------------------------------------------------------

/// Default validity of a founder-issued join token.
pub const JOIN_TOKEN_VALIDITY_SECS: i64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Executor Parameters
// ---------------------------------------------------------------------------

/// Default hop budget on forwarded invocations.
pub const DEFAULT_HOP_BUDGET: u8 = 5;

/// Default per-tool execution timeout when the tool declares none.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default drain deadline during shutdown.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Transport Score Weights
// ---------------------------------------------------------------------------

/// Weights for the composite transport score:
/// `0.4*(100 − avg_latency_ms) + 0.3*success_rate*100 +
///  0.2*min(100, bw_mbps) + 0.1*(100 − power_mW/10)`.
///
/// The defaults are the documented reference values; deployments on battery
/// hardware typically raise `power` at the expense of `latency`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportScoreWeights {
    pub latency: f64,
    pub success: f64,
    pub bandwidth: f64,
    pub power: f64,
}

impl Default for TransportScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            success: 0.3,
            bandwidth: 0.2,
            power: 0.1,
        }
    }
}

// ---------------------------------------------------------------------------
// Node Configuration (persisted)
// ---------------------------------------------------------------------------

/// Role of this node within its mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshRole {
    /// Holds the mesh founder keypair; can mint and revoke join tokens.
    Founder,
    /// Joined via a founder-issued token.
    Member,
}

/// Per-transport enablement and addressing.
///
/// Fields beyond `enabled` are transport-specific; unknown transports keep
/// their extra settings in `options` so platform drivers can read them
/// without a config schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub enabled: bool,
    /// Listen/connect port where the transport uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Endpoint URL where the transport dials out (relay WSS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Driver-specific settings, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl TransportConfig {
    fn enabled_with_port(port: u16) -> Self {
        Self {
            enabled: true,
            port: Some(port),
            url: None,
            options: serde_json::Map::new(),
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            port: None,
            url: None,
            options: serde_json::Map::new(),
        }
    }
}

/// The five transport classes, in default priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportsConfig {
    pub lan: TransportConfig,
    pub p2p_direct: TransportConfig,
    pub ble_mesh: TransportConfig,
    pub smart_home: TransportConfig,
    pub relay: TransportConfig,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            lan: TransportConfig::enabled_with_port(DEFAULT_LAN_PORT),
            p2p_direct: TransportConfig::disabled(),
            ble_mesh: TransportConfig::disabled(),
            smart_home: TransportConfig::disabled(),
            relay: TransportConfig {
                enabled: true,
                port: None,
                url: Some("wss://relay.murmuration.network/mesh".to_string()),
                options: serde_json::Map::new(),
            },
        }
    }
}

/// Mesh membership settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSettings {
    pub mesh_id: String,
    pub role: MeshRole,
    pub gossip_interval_sec: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            mesh_id: String::new(),
            role: MeshRole::Member,
            gossip_interval_sec: ANNOUNCE_INTERVAL.as_secs(),
        }
    }
}

/// Tunable protocol limits. Defaults mirror the module constants above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub gradient_table_max: usize,
    pub announce_interval_sec: u64,
    pub expire_sec: f64,
    pub fanout: usize,
    pub nonce_cache_sec: f64,
    pub timestamp_skew_sec: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            gradient_table_max: GRADIENT_TABLE_MAX,
            announce_interval_sec: ANNOUNCE_INTERVAL.as_secs(),
            expire_sec: GRADIENT_EXPIRE_SECS,
            fanout: GOSSIP_FANOUT,
            nonce_cache_sec: NONCE_CACHE_SECS,
            timestamp_skew_sec: TIMESTAMP_SKEW_SECS,
        }
    }
}

/// The persisted node configuration, stored as pretty-printed JSON at
/// `<config_root>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Hex-encoded public key of this node. Filled in by `init`.
    pub node_id: String,
    /// Human-friendly display name, shown in peer listings.
    pub node_name: String,
    pub transports: TransportsConfig,
    pub mesh: MeshSettings,
    pub limits: Limits,
    /// Composite transport score weights. Omitted in most configs.
    #[serde(default, skip_serializing_if = "is_default_weights")]
    pub transport_score_weights: Option<TransportScoreWeights>,
}

fn is_default_weights(w: &Option<TransportScoreWeights>) -> bool {
    match w {
        None => true,
        Some(w) => *w == TransportScoreWeights::default(),
    }
}

/// Errors loading or saving a node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Loads a configuration from `config.json` in the given directory.
    pub fn load(config_root: &Path) -> Result<Self, ConfigError> {
        let path = config_root.join("config.json");
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Persists the configuration as pretty-printed JSON.
    pub fn save(&self, config_root: &Path) -> Result<(), ConfigError> {
        let path = config_root.join("config.json");
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Structural sanity checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.gradient_table_max == 0 {
            return Err(ConfigError::Invalid(
                "limits.gradient_table_max must be at least 1".into(),
            ));
        }
        if self.limits.fanout == 0 {
            return Err(ConfigError::Invalid(
                "limits.fanout must be at least 1".into(),
            ));
        }
        if self.limits.expire_sec <= 0.0 {
            return Err(ConfigError::Invalid(
                "limits.expire_sec must be positive".into(),
            ));
        }
        let all_disabled = !self.transports.lan.enabled
            && !self.transports.p2p_direct.enabled
            && !self.transports.ble_mesh.enabled
            && !self.transports.smart_home.enabled
            && !self.transports.relay.enabled;
        if all_disabled {
            return Err(ConfigError::Invalid(
                "at least one transport must be enabled".into(),
            ));
        }
        Ok(())
    }

    /// Effective transport score weights (configured or defaults).
    pub fn score_weights(&self) -> TransportScoreWeights {
        self.transport_score_weights.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let limits = Limits::default();
        assert_eq!(limits.gradient_table_max, GRADIENT_TABLE_MAX);
        assert_eq!(limits.fanout, GOSSIP_FANOUT);
        assert_eq!(limits.expire_sec, GRADIENT_EXPIRE_SECS);
        // Staleness must precede removal or the heartbeat lifecycle inverts.
        assert!(HEARTBEAT_STALE_SECS < STALE_REMOVAL_SECS);
        // Nonce retention must cover the full skew window.
        assert!(NONCE_CACHE_SECS >= TIMESTAMP_SKEW_SECS);
    }

    #[test]
    fn score_weights_sum_to_one() {
        let w = TransportScoreWeights::default();
        let sum = w.latency + w.success + w.bandwidth + w.power;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = NodeConfig::default();
        config.node_id = "ab".repeat(32);
        config.node_name = "kitchen-box".into();
        config.mesh.mesh_id = "home".into();

        config.save(dir.path()).expect("save");
        let loaded = NodeConfig::load(dir.path()).expect("load");
        assert_eq!(config, loaded);
    }

    #[test]
    fn validate_rejects_zero_fanout() {
        let mut config = NodeConfig::default();
        config.limits.fanout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_all_transports_disabled() {
        let mut config = NodeConfig::default();
        config.transports.lan.enabled = false;
        config.transports.relay.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_has_relay_fallback_enabled() {
        let config = NodeConfig::default();
        assert!(config.transports.relay.enabled);
        assert!(config.transports.relay.url.is_some());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            NodeConfig::load(dir.path()),
            Err(ConfigError::Read { .. })
        ));
    }
}
