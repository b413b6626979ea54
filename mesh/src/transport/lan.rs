//! LAN transport: WebSocket frames over the local network, with a UDP
//! broadcast beacon for discovery.
//!
//! Discovery: every few seconds each node broadcasts a small JSON beacon
//! (`{node_id, port}`) on the discovery port and listens for the beacons
//! of others. A received beacon maps the peer's node id to
//! `beacon-source-ip:advertised-port`.
//!
//! Connections: plain `ws://` inside the LAN. The dialing side sends a
//! one-line hello (`{node_id}`) as its first message so the accepting side
//! knows who connected; after that, every message is an opaque binary
//! frame handed up unchanged.
//!
//! Outbound frames go through a bounded per-connection queue
//! ([`SEND_QUEUE_CAP`]); a full queue fails fast with `QueueFull` and the
//! pool treats it like any other transient send failure.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::config::SEND_QUEUE_CAP;
use crate::identity::NodeId;

use super::{Connection, Transport, TransportError, TransportEvent, TransportKind};

/// How often the discovery beacon fires.
const BEACON_INTERVAL: Duration = Duration::from_secs(5);

/// Dial timeout for LAN peers. Local networks answer fast or not at all.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The discovery beacon on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    node_id: NodeId,
    port: u16,
}

/// The first message on a dialed connection: who is calling.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
}

/// WebSocket-over-LAN transport driver.
pub struct LanTransport {
    me: NodeId,
    listen_port: u16,
    discovery_port: u16,
    /// Peer addresses learned from beacons.
    addrs: Arc<DashMap<NodeId, SocketAddr>>,
    /// Live connections, inbound and outbound alike.
    conns: Arc<DashMap<NodeId, Arc<WsConnection>>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LanTransport {
    pub fn new(me: NodeId, listen_port: u16, discovery_port: u16) -> Self {
        Self {
            me,
            listen_port,
            discovery_port,
            addrs: Arc::new(DashMap::new()),
            conns: Arc::new(DashMap::new()),
            events: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Manually seeds a peer address (for LANs where broadcast is filtered).
    pub fn add_peer_addr(&self, peer: NodeId, addr: SocketAddr) {
        self.addrs.insert(peer, addr);
    }

    fn events_tx(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.events.lock().clone()
    }

    /// Registers an established socket and starts its I/O tasks.
    fn install<S>(
        &self,
        peer: NodeId,
        ws: WebSocketStream<S>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Arc<WsConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = spawn_ws_io(peer.clone(), ws, events);
        self.conns.insert(peer, Arc::clone(&conn));
        conn
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.events.lock() = Some(events.clone());

        // -- WebSocket listener -------------------------------------------
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("lan listen: {e}")))?;
        info!(port = self.listen_port, "LAN transport listening");

        let accept_events = events.clone();
        let conns = Arc::clone(&self.conns);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, addr)) = listener.accept().await else {
                    break;
                };
                let events = accept_events.clone();
                let conns = Arc::clone(&conns);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    // First message identifies the caller.
                    let hello: Hello = match ws.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                            Ok(h) => h,
                            Err(e) => {
                                debug!(%addr, "bad hello from LAN peer: {e}");
                                return;
                            }
                        },
                        _ => return,
                    };
                    trace!(peer = %hello.node_id.short(), %addr, "inbound LAN connection");
                    let conn = spawn_ws_io(hello.node_id.clone(), ws, events.clone());
                    conns.insert(hello.node_id.clone(), conn);
                    let _ = events
                        .send(TransportEvent::PeerDiscovered {
                            peer: hello.node_id,
                            kind: TransportKind::Lan,
                        })
                        .await;
                });
            }
        });

        // -- Discovery beacon ---------------------------------------------
        // Port 0 disables discovery (tests, manually seeded meshes). A
        // bind failure (port taken by a sibling node on this host) only
        // disables discovery; dialing and listening still work.
        match if self.discovery_port == 0 {
            Err(std::io::Error::other("discovery disabled"))
        } else {
            UdpSocket::bind(("0.0.0.0", self.discovery_port)).await
        } {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    warn!("LAN discovery: set_broadcast failed: {e}");
                }
                let socket = Arc::new(socket);
                let beacon = serde_json::to_vec(&Beacon {
                    node_id: self.me.clone(),
                    port: self.listen_port,
                })
                .unwrap_or_default();
                let target: SocketAddr = ([255, 255, 255, 255], self.discovery_port).into();

                let send_socket = Arc::clone(&socket);
                let beacon_task = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
                    loop {
                        ticker.tick().await;
                        if let Err(e) = send_socket.send_to(&beacon, target).await {
                            trace!("beacon send failed: {e}");
                        }
                    }
                });

                let me = self.me.clone();
                let addrs = Arc::clone(&self.addrs);
                let recv_events = events.clone();
                let recv_task = tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                            break;
                        };
                        let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) else {
                            continue;
                        };
                        if beacon.node_id == me {
                            continue;
                        }
                        let addr = SocketAddr::new(src.ip(), beacon.port);
                        let fresh = addrs.insert(beacon.node_id.clone(), addr).is_none();
                        if fresh {
                            debug!(peer = %beacon.node_id.short(), %addr, "LAN peer discovered");
                            let _ = recv_events
                                .send(TransportEvent::PeerDiscovered {
                                    peer: beacon.node_id,
                                    kind: TransportKind::Lan,
                                })
                                .await;
                        }
                    }
                });

                self.tasks.lock().extend([beacon_task, recv_task]);
            }
            Err(e) => {
                warn!(
                    port = self.discovery_port,
                    "LAN discovery disabled (bind failed: {e})"
                );
            }
        }

        self.tasks.lock().push(accept_task);
        Ok(())
    }

    async fn connect(&self, peer: &NodeId) -> Result<Arc<dyn Connection>, TransportError> {
        if let Some(conn) = self.conns.get(peer) {
            if conn.is_open() {
                return Ok(Arc::clone(conn.value()) as Arc<dyn Connection>);
            }
            drop(conn);
            self.conns.remove(peer);
        }

        let addr = self
            .addrs
            .get(peer)
            .map(|a| *a.value())
            .ok_or_else(|| TransportError::PeerUnreachable(peer.short().to_string()))?;
        let events = self
            .events_tx()
            .ok_or_else(|| TransportError::ConnectFailed("transport not started".into()))?;

        let url = format!("ws://{addr}/mesh");
        let (mut ws, _resp) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(&url),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectFailed(format!("{url}: {e}")))?;

        let hello = serde_json::to_string(&Hello {
            node_id: self.me.clone(),
        })
        .unwrap_or_default();
        ws.send(Message::Text(hello))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("hello: {e}")))?;

        debug!(peer = %peer.short(), %addr, "outbound LAN connection");
        Ok(self.install(peer.clone(), ws, events) as Arc<dyn Connection>)
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in self.conns.iter() {
            entry.value().mark_closed();
        }
        self.conns.clear();
        self.started.store(false, Ordering::SeqCst);
        info!("LAN transport shut down");
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One live WebSocket, driven by a writer task and a reader task. The
/// connection handle itself is just the outbound queue plus an open flag.
#[derive(Debug)]
pub struct WsConnection {
    out_tx: mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl WsConnection {
    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match self.out_tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.mark_closed();
    }
}

/// Splits a WebSocket into writer/reader tasks and returns the handle.
fn spawn_ws_io<S>(
    peer: NodeId,
    ws: WebSocketStream<S>,
    events: mpsc::Sender<TransportEvent>,
) -> Arc<WsConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_CAP);
    let open = Arc::new(AtomicBool::new(true));

    let writer_open = Arc::clone(&open);
    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        writer_open.store(false, Ordering::SeqCst);
        let _ = sink.close().await;
    });

    let reader_open = Arc::clone(&open);
    let reader_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(bytes)) => {
                    if bytes.starts_with(super::PROBE_MARKER) {
                        continue;
                    }
                    // Bounded receive queue: when the node falls behind,
                    // frames are dropped here rather than stalling the
                    // socket.
                    match events.try_send(TransportEvent::Inbound {
                        peer: reader_peer.clone(),
                        kind: TransportKind::Lan,
                        bytes,
                    }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!(peer = %reader_peer.short(), "receive queue full, frame dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        trace!(peer = %reader_peer.short(), "LAN connection closed");
    });

    let _ = peer;
    Arc::new(WsConnection { out_tx, open })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MeshKeypair;

    fn node(tag: u8) -> NodeId {
        NodeId::from_public_key(&MeshKeypair::from_seed(&[tag; 32]).public_key())
    }

    #[tokio::test]
    async fn dial_and_exchange_frames() {
        let a = node(1);
        let b = node(2);

        // Ephemeral ports; discovery ports chosen not to collide.
        let ta = LanTransport::new(a.clone(), 0, 0);
        let tb = LanTransport::new(b.clone(), 18741, 0);

        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);

        // Port 0 discovery binds are fine; port 0 listeners pick ephemeral
        // ports, so B uses a fixed test port A can dial.
        tb.start(tx_b).await.expect("b starts");
        ta.start(tx_a).await.expect("a starts");

        ta.add_peer_addr(b.clone(), ([127, 0, 0, 1], 18741).into());
        let conn = ta.connect(&b).await.expect("dials");
        conn.send(b"over websocket").await.expect("sends");

        // B sees the discovery of A (from the hello) then the frame.
        let mut saw_frame = false;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
                .await
                .expect("event in time")
                .expect("channel open")
            {
                TransportEvent::Inbound { peer, bytes, .. } => {
                    assert_eq!(peer, a);
                    assert_eq!(bytes, b"over websocket");
                    saw_frame = true;
                }
                TransportEvent::PeerDiscovered { peer, .. } => assert_eq!(peer, a),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(saw_frame);

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn connect_without_address_is_unreachable() {
        let t = LanTransport::new(node(1), 0, 0);
        let (tx, _rx) = mpsc::channel(4);
        t.start(tx).await.unwrap();
        assert!(matches!(
            t.connect(&node(9)).await.unwrap_err(),
            TransportError::PeerUnreachable(_)
        ));
        t.shutdown().await;
    }
}
