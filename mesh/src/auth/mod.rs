//! # Mesh Auth
//!
//! Admission and revocation for a mesh. Two Ed25519 keypairs matter: each
//! node's identity keypair, and the mesh *founder* keypair that mints join
//! tokens and signs revocations.
//!
//! ```text
//! token.rs      — founder-signed join tokens (deep link) and mesh tokens
//! revocation.rs — signed revocations + the persisted revocation list
//! ```
//!
//! [`MeshAuth`] bundles what the gossip engine and transports need at
//! runtime: the mesh id, the founder's public key, and the revocation
//! list.

pub mod revocation;
pub mod token;

use std::sync::Arc;

use thiserror::Error;

use crate::crypto::MeshPublicKey;
use crate::identity::NodeId;

pub use revocation::{RevocationList, SignedRevocation};
pub use token::{founder_key_id, JoinToken, MeshToken};

/// Authentication failures. All of them surface as `auth_failed` at the
/// public boundary; the variants exist for logs and tests.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("token expired at {expires_at}")]
    Expired { expires_at: f64 },

    #[error("token not yet valid")]
    NotYetValid,

    #[error("wrong mesh: expected {expected}, token is for {got}")]
    WrongMesh { expected: String, got: String },

    #[error("node {0} has been revoked")]
    Revoked(NodeId),

    #[error("no founder key known for this mesh")]
    NoFounderKey,

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Runtime auth context for one mesh membership.
#[derive(Clone)]
pub struct MeshAuth {
    mesh_id: String,
    /// Learned from the join token (members) or owned outright (founder).
    founder_public: Option<MeshPublicKey>,
    revocations: Arc<RevocationList>,
}

impl MeshAuth {
    pub fn new(
        mesh_id: impl Into<String>,
        founder_public: Option<MeshPublicKey>,
        revocations: Arc<RevocationList>,
    ) -> Self {
        Self {
            mesh_id: mesh_id.into(),
            founder_public,
            revocations,
        }
    }

    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    pub fn founder_public(&self) -> Option<&MeshPublicKey> {
        self.founder_public.as_ref()
    }

    pub fn revocations(&self) -> &Arc<RevocationList> {
        &self.revocations
    }

    pub fn is_revoked(&self, node: &NodeId) -> bool {
        self.revocations.is_revoked(node)
    }

    /// Verifies a founder-signed revocation and records it. Returns `true`
    /// when the revocation is valid and newly applied.
    pub fn apply_revocation(&self, revocation: &SignedRevocation) -> Result<bool, AuthError> {
        let founder = self.founder_public.as_ref().ok_or(AuthError::NoFounderKey)?;
        if revocation.mesh_id != self.mesh_id {
            return Err(AuthError::WrongMesh {
                expected: self.mesh_id.clone(),
                got: revocation.mesh_id.clone(),
            });
        }
        revocation.verify(founder)?;
        Ok(self.revocations.apply(revocation.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MeshKeypair;

    #[test]
    fn apply_revocation_requires_founder_key() {
        let founder = MeshKeypair::generate();
        let victim = NodeId::from_public_key(&MeshKeypair::generate().public_key());
        let revocation = SignedRevocation::issue(&founder, "home", victim.clone(), None);

        let without_key = MeshAuth::new("home", None, Arc::new(RevocationList::in_memory()));
        assert!(matches!(
            without_key.apply_revocation(&revocation),
            Err(AuthError::NoFounderKey)
        ));

        let with_key = MeshAuth::new(
            "home",
            Some(founder.public_key()),
            Arc::new(RevocationList::in_memory()),
        );
        assert!(with_key.apply_revocation(&revocation).unwrap());
        assert!(with_key.is_revoked(&victim));
        // Applying again is idempotent, not an error.
        assert!(!with_key.apply_revocation(&revocation).unwrap());
    }

    #[test]
    fn wrong_mesh_revocation_is_rejected() {
        let founder = MeshKeypair::generate();
        let victim = NodeId::from_public_key(&MeshKeypair::generate().public_key());
        let revocation = SignedRevocation::issue(&founder, "office", victim, None);

        let auth = MeshAuth::new(
            "home",
            Some(founder.public_key()),
            Arc::new(RevocationList::in_memory()),
        );
        assert!(matches!(
            auth.apply_revocation(&revocation),
            Err(AuthError::WrongMesh { .. })
        ));
    }
}
