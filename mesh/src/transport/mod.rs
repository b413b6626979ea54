//! # Multi-Transport Fabric
//!
//! A peer is reachable over up to five transport classes, tried in
//! priority order with continuous metric probing and hysteresis-based
//! preference switching:
//!
//! 1. LAN (WebSocket over the local network, UDP service broadcast)
//! 2. Direct peer-to-peer radio (Wi-Fi P2P)
//! 3. Low-power mesh radio (BLE mesh, hop/TTL capped)
//! 4. Smart-home fabric bridge
//! 5. Relay server over secure WebSocket (always-on fallback)
//!
//! ```text
//! mod.rs      — Transport / Connection traits, TransportKind, events
//! metrics.rs  — per-link rolling metrics + composite score
//! pool.rs     — per-peer connection pool (≤1 connection per class)
//! manager.rs  — send/broadcast, probe loop, offline marking
//! loopback.rs — in-memory transport for tests and single-host runs
//! lan.rs      — WebSocket listener/dialer + UDP discovery beacon
//! relay.rs    — relay WSS client + admission handshake verification
//! ```
//!
//! Radio-class transports (Wi-Fi P2P, BLE mesh, smart-home bridges) need
//! platform drivers; they plug in through the same [`Transport`] trait the
//! built-in LAN and relay drivers use.

pub mod lan;
pub mod loopback;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::NodeId;

pub use manager::TransportManager;
pub use metrics::LinkMetrics;
pub use pool::ConnectionPool;

/// Bytes a probe frame starts with; receivers discard these frames after
/// accounting for them.
pub const PROBE_MARKER: &[u8] = b"MMPROBE1";

// ---------------------------------------------------------------------------
// Transport classes
// ---------------------------------------------------------------------------

/// The five transport classes, ordered by default preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Lan,
    P2pDirect,
    BleMesh,
    SmartHome,
    Relay,
}

impl TransportKind {
    /// All classes in default priority order (failover walks this).
    pub const ALL: [TransportKind; 5] = [
        TransportKind::Lan,
        TransportKind::P2pDirect,
        TransportKind::BleMesh,
        TransportKind::SmartHome,
        TransportKind::Relay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Lan => "lan",
            TransportKind::P2pDirect => "p2p_direct",
            TransportKind::BleMesh => "ble_mesh",
            TransportKind::SmartHome => "smart_home",
            TransportKind::Relay => "relay",
        }
    }

    /// Typical power draw in milliwatts, used to seed link metrics before
    /// real measurements arrive.
    pub fn nominal_power_mw(&self) -> f64 {
        match self {
            TransportKind::Lan => 600.0,
            TransportKind::P2pDirect => 900.0,
            TransportKind::BleMesh => 40.0,
            TransportKind::SmartHome => 250.0,
            TransportKind::Relay => 1000.0,
        }
    }

    /// Typical bandwidth in Mbps, same purpose.
    pub fn nominal_bandwidth_mbps(&self) -> f64 {
        match self {
            TransportKind::Lan => 300.0,
            TransportKind::P2pDirect => 150.0,
            TransportKind::BleMesh => 0.2,
            TransportKind::SmartHome => 2.0,
            TransportKind::Relay => 20.0,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport-layer failures. These are recovered locally (retry, next
/// transport, next route) and never surface raw to callers of the core.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable on this transport")]
    PeerUnreachable(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("send queue full")]
    QueueFull,

    #[error("peer is blocked")]
    PeerBlocked,

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("no transport available for peer {0}")]
    NoTransport(String),

    #[error("timed out")]
    Timeout,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events the fabric pushes up to the node: inbound frames, discovery, and
/// reachability changes. The node loop dispatches these to the gossip
/// engine and the gradient table.
#[derive(Debug)]
pub enum TransportEvent {
    Inbound {
        peer: NodeId,
        kind: TransportKind,
        bytes: Vec<u8>,
    },
    PeerDiscovered {
        peer: NodeId,
        kind: TransportKind,
    },
    PeerOffline {
        peer: NodeId,
    },
    PeerOnline {
        peer: NodeId,
    },
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One live connection to one peer over one transport class.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Sends one frame. Framing (length prefixes, WS messages) is the
    /// connection's concern; callers hand over whole envelopes.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// A transport driver: discovery, listening, and dialing for one class.
///
/// Drivers push inbound frames and discovered peers into the event channel
/// handed to [`Transport::start`]; the manager owns routing and policy.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Starts listeners and discovery. Idempotent.
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError>;

    /// Dials (or reuses) a connection to a peer.
    async fn connect(&self, peer: &NodeId) -> Result<Arc<dyn Connection>, TransportError>;

    /// Stops listeners and closes every connection.
    async fn shutdown(&self);
}
