//! Signed revocations and the persisted revocation list.
//!
//! A revocation is a founder-signed statement that a node is out of the
//! mesh. It travels as a first-class gossip message (`token_revoked`) with
//! the same priority as capability removal, and it is persisted — a
//! restarted node must keep refusing a revoked peer.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::now_secs;
use crate::crypto::{MeshKeypair, MeshPublicKey, MeshSignature};
use crate::identity::NodeId;

use super::token::founder_key_id;
use super::AuthError;

/// A founder-signed revocation of one node's membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRevocation {
    pub mesh_id: String,
    pub revoked_node: NodeId,
    /// Key id of the founder key that signed this, for cache lookups.
    pub key_id: String,
    pub issued_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Base64 founder signature over the canonical form.
    pub signature: String,
}

impl SignedRevocation {
    pub fn issue(
        founder: &MeshKeypair,
        mesh_id: impl Into<String>,
        revoked_node: NodeId,
        reason: Option<String>,
    ) -> Self {
        let mesh_id = mesh_id.into();
        let issued_at = now_secs();
        let key_id = founder_key_id(&founder.public_key());
        let signature = founder
            .sign(&Self::canonical_bytes(
                &mesh_id,
                &revoked_node,
                &key_id,
                issued_at,
            ))
            .to_base64();
        Self {
            mesh_id,
            revoked_node,
            key_id,
            issued_at,
            reason,
            signature,
        }
    }

    fn canonical_bytes(
        mesh_id: &str,
        revoked_node: &NodeId,
        key_id: &str,
        issued_at: f64,
    ) -> Vec<u8> {
        format!(
            "revoke\n{mesh_id}\n{revoked_node}\n{key_id}\n{}",
            serde_json::to_string(&issued_at).unwrap_or_default(),
        )
        .into_bytes()
    }

    /// Verifies the founder signature. The reason field is advisory and
    /// deliberately outside the signed bytes.
    pub fn verify(&self, founder: &MeshPublicKey) -> Result<(), AuthError> {
        let signature = MeshSignature::from_base64(&self.signature)
            .map_err(|_| AuthError::Malformed("signature".into()))?;
        let bytes = Self::canonical_bytes(
            &self.mesh_id,
            &self.revoked_node,
            &self.key_id,
            self.issued_at,
        );
        if !founder.verify(&bytes, &signature) {
            return Err(AuthError::BadSignature);
        }
        Ok(())
    }
}

/// The set of revoked nodes, persisted as JSON so restarts keep refusing
/// revoked peers.
pub struct RevocationList {
    path: Option<PathBuf>,
    revoked: RwLock<HashSet<NodeId>>,
    records: RwLock<Vec<SignedRevocation>>,
}

impl RevocationList {
    /// An unpersisted list, for tests and ephemeral nodes.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            revoked: RwLock::new(HashSet::new()),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Loads (or initializes) the list persisted at
    /// `<data_dir>/revocations.json`.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("revocations.json");
        let records: Vec<SignedRevocation> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), "revocation file unreadable, starting empty: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        let revoked = records.iter().map(|r| r.revoked_node.clone()).collect();
        if !records.is_empty() {
            info!(count = records.len(), "loaded persisted revocations");
        }
        Self {
            path: Some(path),
            revoked: RwLock::new(revoked),
            records: RwLock::new(records),
        }
    }

    /// Records a (pre-verified) revocation. Returns `true` when the node
    /// was not already revoked. Persists synchronously when backed by a
    /// file.
    pub fn apply(&self, revocation: SignedRevocation) -> bool {
        let fresh = self.revoked.write().insert(revocation.revoked_node.clone());
        if fresh {
            info!(node = %revocation.revoked_node.short(), reason = ?revocation.reason, "node revoked");
            self.records.write().push(revocation);
            self.persist();
        }
        fresh
    }

    pub fn is_revoked(&self, node: &NodeId) -> bool {
        self.revoked.read().contains(node)
    }

    pub fn len(&self) -> usize {
        self.revoked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.read().is_empty()
    }

    /// All stored revocation records (for gossip catch-up of late joiners).
    pub fn records(&self) -> Vec<SignedRevocation> {
        self.records.read().clone()
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let records = self.records.read();
        match serde_json::to_string_pretty(&*records) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), "failed to persist revocations: {e}");
                }
            }
            Err(e) => warn!("failed to serialize revocations: {e}"),
        }
    }
}
