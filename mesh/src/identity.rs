//! # Node Identity
//!
//! A node's identity is its Ed25519 keypair; its node id is the hex form of
//! the public key. The id appears in capability ids (`node_id:type:name`),
//! gossip envelopes, and gradient entries, so it is kept as a cheap clonable
//! string newtype rather than a key handle.
//!
//! Identity persistence follows the key-file convention: the secret key is
//! stored hex-encoded at `<data_dir>/keys/node.key` with owner-only
//! permissions on Unix.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::crypto::{KeyError, MeshKeypair, MeshPublicKey};

/// A node identifier: the hex-encoded Ed25519 public key (64 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derives the id from a public key.
    pub fn from_public_key(key: &MeshPublicKey) -> Self {
        Self(key.to_hex())
    }

    /// Wraps an id string received off the wire. Shape is validated (64 hex
    /// chars); the curve-point check happens when the key is actually used.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentityError::MalformedNodeId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Recovers the public key for signature verification.
    pub fn to_public_key(&self) -> Result<MeshPublicKey, KeyError> {
        MeshPublicKey::from_hex(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for logs and UIs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors during identity handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("malformed node id: {0:?}")]
    MalformedNodeId(String),

    #[error("key file error at {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Loads the node keypair from `<data_dir>/keys/node.key`, or generates and
/// saves a fresh one if the file does not exist.
///
/// The key file holds the hex-encoded 32-byte secret key. Permissions are
/// restricted to 0o600 on Unix.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<MeshKeypair, IdentityError> {
    let keys_dir = data_dir.join("keys");
    let key_path = keys_dir.join("node.key");

    if key_path.exists() {
        let hex_str =
            std::fs::read_to_string(&key_path).map_err(|source| IdentityError::KeyFile {
                path: key_path.display().to_string(),
                source,
            })?;
        let keypair = MeshKeypair::from_hex(hex_str.trim())?;
        info!(
            node_id = %keypair.public_key().to_hex(),
            key_path = %key_path.display(),
            "loaded node keypair from disk"
        );
        Ok(keypair)
    } else {
        std::fs::create_dir_all(&keys_dir).map_err(|source| IdentityError::KeyFile {
            path: keys_dir.display().to_string(),
            source,
        })?;

        let keypair = MeshKeypair::generate();
        let secret_hex = hex::encode(keypair.secret_key_bytes());
        std::fs::write(&key_path, &secret_hex).map_err(|source| IdentityError::KeyFile {
            path: key_path.display().to_string(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
        }

        info!(
            node_id = %keypair.public_key().to_hex(),
            key_path = %key_path.display(),
            "generated and saved new node keypair"
        );
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_key_is_64_hex() {
        let kp = MeshKeypair::generate();
        let id = NodeId::from_public_key(&kp.public_key());
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id.short().len(), 12);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(NodeId::parse("not-a-node-id").is_err());
        assert!(NodeId::parse(&"zz".repeat(32)).is_err());
        assert!(NodeId::parse(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn parse_normalizes_case() {
        let kp = MeshKeypair::generate();
        let upper = kp.public_key().to_hex().to_ascii_uppercase();
        let id = NodeId::parse(&upper).expect("valid id");
        assert_eq!(id.as_str(), kp.public_key().to_hex());
    }

    #[test]
    fn id_roundtrips_to_public_key() {
        let kp = MeshKeypair::generate();
        let id = NodeId::from_public_key(&kp.public_key());
        let pk = id.to_public_key().expect("valid key");
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn load_or_generate_persists_across_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = load_or_generate_keypair(dir.path()).expect("generate");
        assert!(dir.path().join("keys").join("node.key").exists());

        let second = load_or_generate_keypair(dir.path()).expect("load");
        assert_eq!(first.public_key(), second.public_key());
    }
}
