//! Relay transport: the always-on fallback over secure WebSocket.
//!
//! One WSS link to the relay carries traffic for every peer; frames are
//! addressed (`Deliver { to, from, payload }`) and the relay forwards them
//! between admitted clients.
//!
//! ## Admission
//!
//! The first client message after connect is the admission handshake:
//! `{ mesh_id, join_token, node_public_key }`. The relay verifies
//! (a) the join-token signature under the registered mesh public key,
//! (b) the mesh id match, (c) non-expiration — and closes with
//! `auth_failed` otherwise. [`MeshDirectory`] implements that verification
//! plus first-founder-wins mesh registration; the same code runs in the
//! relay deployment and in the tests here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthError, JoinToken};
use crate::config::SEND_QUEUE_CAP;
use crate::crypto::{MeshPublicKey, MeshSignature};
use crate::identity::NodeId;

use super::{Connection, Transport, TransportError, TransportEvent, TransportKind};

/// Dial timeout for the relay.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the admission verdict.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// The admission handshake — first message after transport connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionHandshake {
    pub mesh_id: String,
    pub join_token: JoinToken,
    /// Hex public key of the joining node.
    pub node_public_key: String,
}

/// Frames exchanged with the relay, bincode-encoded in WS binary messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay, exactly once, first.
    Admission(AdmissionHandshake),
    /// Relay → client verdict. `status` is `ok` or `auth_failed`.
    AdmissionResult { ok: bool, status: String },
    /// Addressed payload in either direction.
    Deliver {
        to: NodeId,
        from: NodeId,
        payload: Vec<u8>,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Relay-side admission
// ---------------------------------------------------------------------------

/// The relay's registry of meshes and their founder keys, plus per-mesh
/// revocations. First founder wins: the initial `register_mesh` installs
/// the key; re-registration must prove possession of the same key.
#[derive(Default)]
pub struct MeshDirectory {
    meshes: DashMap<String, MeshPublicKey>,
    revoked: DashMap<String, std::collections::HashSet<NodeId>>,
}

impl MeshDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn registration_bytes(mesh_id: &str, key: &MeshPublicKey) -> Vec<u8> {
        format!("register\n{mesh_id}\n{}", key.to_hex()).into_bytes()
    }

    /// Registers a mesh under a founder key. `proof` is the founder's
    /// signature over the registration bytes; it gates both first
    /// registration and re-registration.
    pub fn register_mesh(
        &self,
        mesh_id: &str,
        key: MeshPublicKey,
        proof: &MeshSignature,
    ) -> Result<(), AuthError> {
        if !key.verify(&Self::registration_bytes(mesh_id, &key), proof) {
            return Err(AuthError::BadSignature);
        }
        match self.meshes.get(mesh_id) {
            // First founder wins: a different key cannot take the name.
            Some(existing) if *existing.value() != key => Err(AuthError::BadSignature),
            _ => {
                self.meshes.insert(mesh_id.to_string(), key);
                info!(mesh = mesh_id, "mesh registered at relay");
                Ok(())
            }
        }
    }

    pub fn founder_key(&self, mesh_id: &str) -> Option<MeshPublicKey> {
        self.meshes.get(mesh_id).map(|k| k.value().clone())
    }

    /// Marks a node revoked within a mesh; future admissions are refused.
    pub fn revoke(&self, mesh_id: &str, node: NodeId) {
        self.revoked.entry(mesh_id.to_string()).or_default().insert(node);
    }

    /// The relay's admission check. Returns the admitted node id.
    pub fn verify_admission(
        &self,
        handshake: &AdmissionHandshake,
        now: f64,
    ) -> Result<NodeId, AuthError> {
        let founder = self
            .founder_key(&handshake.mesh_id)
            .ok_or(AuthError::NoFounderKey)?;

        if handshake.join_token.mesh_id != handshake.mesh_id {
            return Err(AuthError::WrongMesh {
                expected: handshake.mesh_id.clone(),
                got: handshake.join_token.mesh_id.clone(),
            });
        }
        handshake.join_token.verify(Some(&founder), now)?;

        let key = MeshPublicKey::from_hex(&handshake.node_public_key)
            .map_err(|_| AuthError::Malformed("node public key".into()))?;
        let node = NodeId::from_public_key(&key);

        if let Some(set) = self.revoked.get(&handshake.mesh_id) {
            if set.contains(&node) {
                return Err(AuthError::Revoked(node));
            }
        }
        Ok(node)
    }
}

// ---------------------------------------------------------------------------
// Client transport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RelayLink {
    out_tx: mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

/// The relay WSS client driver. All peers share one admitted link.
pub struct RelayTransport {
    me: NodeId,
    me_public_hex: String,
    url: String,
    mesh_id: String,
    join_token: JoinToken,
    link: tokio::sync::Mutex<Option<Arc<RelayLink>>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    started: AtomicBool,
}

impl RelayTransport {
    pub fn new(
        me: NodeId,
        me_public: &MeshPublicKey,
        url: impl Into<String>,
        mesh_id: impl Into<String>,
        join_token: JoinToken,
    ) -> Self {
        Self {
            me,
            me_public_hex: me_public.to_hex(),
            url: url.into(),
            mesh_id: mesh_id.into(),
            join_token,
            link: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Dials and admits, reusing an open link when one exists.
    async fn ensure_link(&self) -> Result<Arc<RelayLink>, TransportError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.open.load(Ordering::SeqCst) {
                return Ok(Arc::clone(link));
            }
        }

        let events = self
            .events
            .lock()
            .clone()
            .ok_or_else(|| TransportError::ConnectFailed("transport not started".into()))?;

        let (mut ws, _resp) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&self.url))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.url)))?;

        // Admission: handshake out, verdict in.
        let handshake = RelayFrame::Admission(AdmissionHandshake {
            mesh_id: self.mesh_id.clone(),
            join_token: self.join_token.clone(),
            node_public_key: self.me_public_hex.clone(),
        });
        ws.send(Message::Binary(handshake.encode()))
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("admission send: {e}")))?;

        let verdict = tokio::time::timeout(ADMISSION_TIMEOUT, ws.next())
            .await
            .map_err(|_| TransportError::Timeout)?;
        match verdict {
            Some(Ok(Message::Binary(bytes))) => match RelayFrame::decode(&bytes) {
                Some(RelayFrame::AdmissionResult { ok: true, .. }) => {}
                Some(RelayFrame::AdmissionResult { status, .. }) => {
                    warn!(status, "relay refused admission");
                    return Err(TransportError::AdmissionRejected(status));
                }
                _ => return Err(TransportError::ConnectFailed("bad admission reply".into())),
            },
            _ => return Err(TransportError::ConnectFailed("relay closed during admission".into())),
        }
        info!(url = %self.url, "admitted at relay");

        // Split into writer/reader tasks.
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
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(bytes)) => {
                        if let Some(RelayFrame::Deliver { from, payload, .. }) =
                            RelayFrame::decode(&bytes)
                        {
                            if events
                                .send(TransportEvent::Inbound {
                                    peer: from,
                                    kind: TransportKind::Relay,
                                    bytes: payload,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            trace!("relay link closed");
        });

        let link = Arc::new(RelayLink { out_tx, open });
        *guard = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.events.lock() = Some(events);
        // The first dial is opportunistic; the relay may come up later and
        // `connect` re-dials on demand.
        if let Err(e) = self.ensure_link().await {
            debug!("relay not reachable at start: {e}");
        }
        Ok(())
    }

    async fn connect(&self, peer: &NodeId) -> Result<Arc<dyn Connection>, TransportError> {
        let link = self.ensure_link().await?;
        Ok(Arc::new(RelayConnection {
            link,
            me: self.me.clone(),
            peer: peer.clone(),
        }))
    }

    async fn shutdown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.open.store(false, Ordering::SeqCst);
        }
        self.started.store(false, Ordering::SeqCst);
        info!("relay transport shut down");
    }
}

#[derive(Debug)]
struct RelayConnection {
    link: Arc<RelayLink>,
    me: NodeId,
    peer: NodeId,
}

#[async_trait]
impl Connection for RelayConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let frame = RelayFrame::Deliver {
            to: self.peer.clone(),
            from: self.me.clone(),
            payload: bytes.to_vec(),
        };
        match self.link.out_tx.try_send(frame.encode()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now_secs;
    use crate::crypto::MeshKeypair;
    use tokio::net::TcpListener;

    fn node_of(kp: &MeshKeypair) -> NodeId {
        NodeId::from_public_key(&kp.public_key())
    }

    fn register(directory: &MeshDirectory, founder: &MeshKeypair, mesh_id: &str) {
        let key = founder.public_key();
        let proof = founder.sign(&MeshDirectory::registration_bytes(mesh_id, &key));
        directory.register_mesh(mesh_id, key, &proof).expect("registers");
    }

    #[test]
    fn first_founder_wins_registration() {
        let directory = MeshDirectory::new();
        let founder = MeshKeypair::generate();
        register(&directory, &founder, "home");

        // Same founder may re-register with a fresh proof.
        let key = founder.public_key();
        let proof = founder.sign(&MeshDirectory::registration_bytes("home", &key));
        assert!(directory.register_mesh("home", key, &proof).is_ok());

        // A different key cannot take the name, even with a valid
        // self-signed proof.
        let usurper = MeshKeypair::generate();
        let key = usurper.public_key();
        let proof = usurper.sign(&MeshDirectory::registration_bytes("home", &key));
        assert!(directory.register_mesh("home", key, &proof).is_err());
    }

    #[test]
    fn registration_requires_possession_proof() {
        let directory = MeshDirectory::new();
        let founder = MeshKeypair::generate();
        let key = founder.public_key();
        // Proof signed over the wrong bytes.
        let bad_proof = founder.sign(b"not the registration bytes");
        assert!(directory.register_mesh("home", key, &bad_proof).is_err());
    }

    #[test]
    fn admission_accepts_valid_token_and_rejects_forged() {
        let directory = MeshDirectory::new();
        let founder = MeshKeypair::generate();
        register(&directory, &founder, "home");

        let joiner = MeshKeypair::generate();
        let good = AdmissionHandshake {
            mesh_id: "home".into(),
            join_token: JoinToken::issue(&founder, "home"),
            node_public_key: joiner.public_key().to_hex(),
        };
        let admitted = directory.verify_admission(&good, now_secs()).expect("admitted");
        assert_eq!(admitted, node_of(&joiner));

        // A token signed by someone other than the registered founder.
        let impostor = MeshKeypair::generate();
        let forged = AdmissionHandshake {
            mesh_id: "home".into(),
            join_token: JoinToken::issue(&impostor, "home"),
            node_public_key: joiner.public_key().to_hex(),
        };
        assert!(matches!(
            directory.verify_admission(&forged, now_secs()),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn admission_refuses_revoked_nodes() {
        let directory = MeshDirectory::new();
        let founder = MeshKeypair::generate();
        register(&directory, &founder, "home");

        let joiner = MeshKeypair::generate();
        directory.revoke("home", node_of(&joiner));

        let handshake = AdmissionHandshake {
            mesh_id: "home".into(),
            join_token: JoinToken::issue(&founder, "home"),
            node_public_key: joiner.public_key().to_hex(),
        };
        assert!(matches!(
            directory.verify_admission(&handshake, now_secs()),
            Err(AuthError::Revoked(_))
        ));
    }

    /// Minimal in-process relay speaking the real frame protocol, enough
    /// to exercise the client end to end.
    async fn spawn_mock_relay(directory: Arc<MeshDirectory>) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let port = listener.local_addr().unwrap().port();
        let clients: Arc<DashMap<NodeId, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let directory = Arc::clone(&directory);
                let clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    // Admission first.
                    let node = match ws.next().await {
                        Some(Ok(Message::Binary(bytes))) => match RelayFrame::decode(&bytes) {
                            Some(RelayFrame::Admission(hs)) => {
                                match directory.verify_admission(&hs, now_secs()) {
                                    Ok(node) => {
                                        let _ = ws
                                            .send(Message::Binary(
                                                RelayFrame::AdmissionResult {
                                                    ok: true,
                                                    status: "ok".into(),
                                                }
                                                .encode(),
                                            ))
                                            .await;
                                        node
                                    }
                                    Err(_) => {
                                        let _ = ws
                                            .send(Message::Binary(
                                                RelayFrame::AdmissionResult {
                                                    ok: false,
                                                    status: "auth_failed".into(),
                                                }
                                                .encode(),
                                            ))
                                            .await;
                                        let _ = ws.close(None).await;
                                        return;
                                    }
                                }
                            }
                            _ => return,
                        },
                        _ => return,
                    };

                    let (mut sink, mut stream) = ws.split();
                    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
                    clients.insert(node.clone(), tx);

                    let forward = tokio::spawn(async move {
                        while let Some(bytes) = rx.recv().await {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                    });

                    while let Some(Ok(msg)) = stream.next().await {
                        if let Message::Binary(bytes) = msg {
                            if let Some(RelayFrame::Deliver { to, .. }) = RelayFrame::decode(&bytes)
                            {
                                if let Some(dest) = clients.get(&to) {
                                    let _ = dest.value().send(bytes).await;
                                }
                            }
                        }
                    }
                    clients.remove(&node);
                    forward.abort();
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn client_is_admitted_and_frames_flow_via_relay() {
        let directory = Arc::new(MeshDirectory::new());
        let founder = MeshKeypair::generate();
        register(&directory, &founder, "home");
        let port = spawn_mock_relay(Arc::clone(&directory)).await;

        let kp_a = MeshKeypair::generate();
        let kp_b = MeshKeypair::generate();
        let a = node_of(&kp_a);
        let b = node_of(&kp_b);

        let make = |kp: &MeshKeypair| {
            RelayTransport::new(
                node_of(kp),
                &kp.public_key(),
                format!("ws://127.0.0.1:{port}/"),
                "home",
                JoinToken::issue(&founder, "home"),
            )
        };
        let ta = make(&kp_a);
        let tb = make(&kp_b);

        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        ta.start(tx_a).await.unwrap();
        tb.start(tx_b).await.unwrap();

        let conn = ta.connect(&b).await.expect("admitted and connected");
        conn.send(b"through the relay").await.expect("sends");

        match tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .expect("in time")
            .expect("open")
        {
            TransportEvent::Inbound { peer, kind, bytes } => {
                assert_eq!(peer, a);
                assert_eq!(kind, TransportKind::Relay);
                assert_eq!(bytes, b"through the relay");
            }
            other => panic!("unexpected: {other:?}"),
        }

        ta.shutdown().await;
        tb.shutdown().await;
    }

    #[tokio::test]
    async fn client_with_forged_token_gets_auth_failed() {
        let directory = Arc::new(MeshDirectory::new());
        let founder = MeshKeypair::generate();
        register(&directory, &founder, "home");
        let port = spawn_mock_relay(directory).await;

        let impostor = MeshKeypair::generate();
        let kp = MeshKeypair::generate();
        let transport = RelayTransport::new(
            node_of(&kp),
            &kp.public_key(),
            format!("ws://127.0.0.1:{port}/"),
            "home",
            // Signed by the wrong founder.
            JoinToken::issue(&impostor, "home"),
        );

        let (tx, _rx) = mpsc::channel(4);
        *transport.events.lock() = Some(tx);
        let err = transport.ensure_link().await.unwrap_err();
        assert!(matches!(err, TransportError::AdmissionRejected(status) if status == "auth_failed"));
    }
}
