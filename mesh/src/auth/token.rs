//! Founder-signed tokens.
//!
//! Two artifacts, both signed by the mesh founder key over a canonical
//! newline-joined byte form:
//!
//! - **Join token** — a bearer invite. Encodes the mesh id, the founder's
//!   public key, and an expiry into a deep link (`murmur://join/…`, bs58)
//!   that fits in a QR code. Whoever holds it may present it to the relay
//!   and to LAN peers, alongside their own node public key.
//! - **Mesh token** — a node-bound credential carried on connections:
//!   `{mesh_id, node_id, issued_at, expires_at, capabilities, signature}`.
//!   Minted by the founder at join time (or self-minted on founder nodes).
//!
//! Nodes cache founder keys by key id — the truncated blake3 of the public
//! key — so revocations can name the key that signed what they revoke.

use serde::{Deserialize, Serialize};

use crate::clock::now_secs;
use crate::config::JOIN_TOKEN_VALIDITY_SECS;
use crate::crypto::{MeshKeypair, MeshPublicKey, MeshSignature};
use crate::identity::NodeId;

use super::AuthError;

/// Deep-link scheme prefix for encoded join tokens.
const DEEP_LINK_PREFIX: &str = "murmur://join/";

/// Truncated blake3 of a founder public key; names the key in caches and
/// revocations.
pub fn founder_key_id(key: &MeshPublicKey) -> String {
    hex::encode(&blake3::hash(key.as_bytes()).as_bytes()[..8])
}

// ---------------------------------------------------------------------------
// Join token
// ---------------------------------------------------------------------------

/// A bearer invite into a mesh. Carries the founder public key so the
/// joiner (and every peer it meets) learns the key to verify future
/// revocations against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinToken {
    pub mesh_id: String,
    /// Hex founder public key.
    pub founder_public_key: String,
    pub issued_at: f64,
    pub expires_at: f64,
    /// Random discriminator so every invite is distinct.
    pub invite_id: String,
    /// Base64 founder signature over the canonical form.
    pub signature: String,
}

impl JoinToken {
    /// Mints an invite valid for the default 24 hours.
    pub fn issue(founder: &MeshKeypair, mesh_id: impl Into<String>) -> Self {
        Self::issue_with_validity(founder, mesh_id, JOIN_TOKEN_VALIDITY_SECS as f64)
    }

    pub fn issue_with_validity(
        founder: &MeshKeypair,
        mesh_id: impl Into<String>,
        validity_secs: f64,
    ) -> Self {
        let mesh_id = mesh_id.into();
        let issued_at = now_secs();
        let expires_at = issued_at + validity_secs;
        let founder_public_key = founder.public_key().to_hex();
        let invite_id = crate::gossip::message::fresh_nonce();

        let signature = founder
            .sign(&Self::canonical_bytes(
                &mesh_id,
                &founder_public_key,
                issued_at,
                expires_at,
                &invite_id,
            ))
            .to_base64();

        Self {
            mesh_id,
            founder_public_key,
            issued_at,
            expires_at,
            invite_id,
            signature,
        }
    }

    fn canonical_bytes(
        mesh_id: &str,
        founder_public_key: &str,
        issued_at: f64,
        expires_at: f64,
        invite_id: &str,
    ) -> Vec<u8> {
        format!(
            "join\n{mesh_id}\n{founder_public_key}\n{}\n{}\n{invite_id}",
            serde_json::to_string(&issued_at).unwrap_or_default(),
            serde_json::to_string(&expires_at).unwrap_or_default(),
        )
        .into_bytes()
    }

    /// The founder key embedded in the invite.
    pub fn founder_key(&self) -> Result<MeshPublicKey, AuthError> {
        MeshPublicKey::from_hex(&self.founder_public_key)
            .map_err(|_| AuthError::Malformed("founder public key".into()))
    }

    /// Verifies signature and validity window. The embedded key must also
    /// match `expected_founder` when the verifier already knows the mesh
    /// (the relay does; a fresh joiner does not).
    pub fn verify(
        &self,
        expected_founder: Option<&MeshPublicKey>,
        now: f64,
    ) -> Result<(), AuthError> {
        let key = self.founder_key()?;
        if let Some(expected) = expected_founder {
            if &key != expected {
                return Err(AuthError::BadSignature);
            }
        }
        let signature = MeshSignature::from_base64(&self.signature)
            .map_err(|_| AuthError::Malformed("signature".into()))?;
        let bytes = Self::canonical_bytes(
            &self.mesh_id,
            &self.founder_public_key,
            self.issued_at,
            self.expires_at,
            &self.invite_id,
        );
        if !key.verify(&bytes, &signature) {
            return Err(AuthError::BadSignature);
        }
        if now > self.expires_at {
            return Err(AuthError::Expired {
                expires_at: self.expires_at,
            });
        }
        if now < self.issued_at - 60.0 {
            // A token "issued" in the future is clock trouble at best.
            return Err(AuthError::NotYetValid);
        }
        Ok(())
    }

    /// Encodes as a deep link / QR payload.
    pub fn to_deep_link(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{DEEP_LINK_PREFIX}{}", bs58::encode(json).into_string())
    }

    /// Parses a deep link back into a token (signature NOT yet verified).
    pub fn from_deep_link(link: &str) -> Result<Self, AuthError> {
        let encoded = link
            .strip_prefix(DEEP_LINK_PREFIX)
            .ok_or_else(|| AuthError::Malformed("missing murmur://join/ prefix".into()))?;
        let json = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| AuthError::Malformed("bad bs58".into()))?;
        serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Mesh token
// ---------------------------------------------------------------------------

/// A node-bound credential: proof that the founder admitted `node_id` to
/// `mesh_id` with the listed capability grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshToken {
    pub mesh_id: String,
    pub node_id: NodeId,
    pub issued_at: f64,
    pub expires_at: f64,
    /// Coarse grants, e.g. `announce`, `invoke`, `trigger`.
    pub capabilities: Vec<String>,
    /// Base64 founder signature over the canonical form.
    pub signature: String,
}

impl MeshToken {
    pub fn issue(
        founder: &MeshKeypair,
        mesh_id: impl Into<String>,
        node_id: NodeId,
        validity_secs: f64,
        capabilities: Vec<String>,
    ) -> Self {
        let mesh_id = mesh_id.into();
        let issued_at = now_secs();
        let expires_at = issued_at + validity_secs;
        let signature = founder
            .sign(&Self::canonical_bytes(
                &mesh_id,
                &node_id,
                issued_at,
                expires_at,
                &capabilities,
            ))
            .to_base64();
        Self {
            mesh_id,
            node_id,
            issued_at,
            expires_at,
            capabilities,
            signature,
        }
    }

    fn canonical_bytes(
        mesh_id: &str,
        node_id: &NodeId,
        issued_at: f64,
        expires_at: f64,
        capabilities: &[String],
    ) -> Vec<u8> {
        format!(
            "mesh\n{mesh_id}\n{node_id}\n{}\n{}\n{}",
            serde_json::to_string(&issued_at).unwrap_or_default(),
            serde_json::to_string(&expires_at).unwrap_or_default(),
            capabilities.join(","),
        )
        .into_bytes()
    }

    /// Verifies (a) the signature under the mesh founder key, (b) mesh id
    /// match, (c) non-expiration — the relay's three checks.
    pub fn verify(
        &self,
        founder: &MeshPublicKey,
        expected_mesh: &str,
        now: f64,
    ) -> Result<(), AuthError> {
        if self.mesh_id != expected_mesh {
            return Err(AuthError::WrongMesh {
                expected: expected_mesh.to_string(),
                got: self.mesh_id.clone(),
            });
        }
        let signature = MeshSignature::from_base64(&self.signature)
            .map_err(|_| AuthError::Malformed("signature".into()))?;
        let bytes = Self::canonical_bytes(
            &self.mesh_id,
            &self.node_id,
            self.issued_at,
            self.expires_at,
            &self.capabilities,
        );
        if !founder.verify(&bytes, &signature) {
            return Err(AuthError::BadSignature);
        }
        if now > self.expires_at {
            return Err(AuthError::Expired {
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }
}
