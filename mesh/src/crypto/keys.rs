//! # Key Management
//!
//! Ed25519 keypair generation and serialization for mesh identities.
//!
//! Every node has exactly one identity keypair, and every mesh has one
//! founder keypair. Both are plain Ed25519; the types here wrap
//! `ed25519-dalek` so the rest of the codebase has one audited place for
//! key handling and one set of error types.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek handles this).
//! - Key generation uses the OS RNG.
//! - Key bytes are never logged. Node ids are the *public* key in hex.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Errors during key operations. Deliberately vague about why — error
/// messages are not the place to leak key-material structure.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not a valid scalar")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid key or signature encoding")]
    InvalidEncoding,
}

/// A mesh identity keypair wrapping an Ed25519 signing key.
///
/// `MeshKeypair` intentionally does NOT implement `Serialize`. Persisting a
/// private key is a deliberate act — use [`MeshKeypair::secret_key_bytes`]
/// and [`MeshKeypair::from_seed`] explicitly.
#[derive(Clone)]
pub struct MeshKeypair {
    signing_key: SigningKey,
}

/// The public half of a mesh identity. Safe to share; the hex form of these
/// 32 bytes *is* the node id on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPublicKey {
    bytes: [u8; 32],
}

/// An Ed25519 signature over a message. Always 64 bytes; anything else
/// simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSignature {
    bytes: Vec<u8>,
}

impl MeshKeypair {
    /// Generates a fresh keypair from the OS cryptographic RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Constructs a keypair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parses a keypair from a hex-encoded 32-byte secret key, the format
    /// used by the on-disk key file.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidEncoding)?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The raw secret key bytes. Handle with the care this name implies.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> MeshPublicKey {
        MeshPublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Signs a message, producing a 64-byte deterministic signature.
    pub fn sign(&self, message: &[u8]) -> MeshSignature {
        let sig = self.signing_key.sign(message);
        MeshSignature {
            bytes: sig.to_bytes().to_vec(),
        }
    }

    /// Verifies a signature made by this keypair's public half.
    pub fn verify(&self, message: &[u8], signature: &MeshSignature) -> bool {
        self.public_key().verify(message, signature)
    }
}

impl fmt::Debug for MeshKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret never appears in debug output.
        f.debug_struct("MeshKeypair")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

impl MeshPublicKey {
    /// Parses a public key from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        // Validate it is a real curve point now, not at first verify.
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes: arr })
    }

    /// Parses a public key from its hex form (the node id).
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Hex form of the key — this string is the node id on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Verifies a signature over a message. Returns `false` for malformed
    /// keys or signatures; no panics, no error oracle.
    pub fn verify(&self, message: &[u8], signature: &MeshSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <&[u8; 64]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(sig_bytes);
        verifying_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for MeshPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshPublicKey({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for MeshPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Hash for MeshPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl MeshSignature {
    /// Wraps raw signature bytes from the wire. Length is checked lazily at
    /// verification.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parses a signature from its base64 wire form.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| KeyError::InvalidEncoding)?;
        Ok(Self { bytes })
    }

    /// Base64 wire form, as carried in the message envelope.
    pub fn to_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    /// The raw signature bytes (64 for any valid signature).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MeshSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshSignature({}…)", hex::encode(&self.bytes[..self.bytes.len().min(8)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_verify() {
        let kp = MeshKeypair::generate();
        let sig = kp.sign(b"hello mesh");
        assert!(kp.public_key().verify(b"hello mesh", &sig));
        assert!(!kp.public_key().verify(b"hello mess", &sig));
    }

    #[test]
    fn from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = MeshKeypair::from_seed(&seed);
        let b = MeshKeypair::from_seed(&seed);
        assert_eq!(a.public_key().to_hex(), b.public_key().to_hex());
    }

    #[test]
    fn hex_roundtrip() {
        let kp = MeshKeypair::generate();
        let hex_str = hex::encode(kp.secret_key_bytes());
        let restored = MeshKeypair::from_hex(&hex_str).expect("valid hex key");
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_hex_is_node_id_shaped() {
        let kp = MeshKeypair::generate();
        let id = kp.public_key().to_hex();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn invalid_public_key_rejected_at_parse() {
        // All-zero bytes are a small-order point; from_bytes must refuse.
        assert!(MeshPublicKey::from_bytes(&[0u8; 32]).is_err());
        assert!(MeshPublicKey::from_bytes(&[1u8; 16]).is_err());
    }

    #[test]
    fn signature_base64_roundtrip() {
        let kp = MeshKeypair::generate();
        let sig = kp.sign(b"payload");
        let encoded = sig.to_base64();
        let decoded = MeshSignature::from_base64(&encoded).expect("valid base64");
        assert!(kp.public_key().verify(b"payload", &decoded));
    }

    #[test]
    fn truncated_signature_fails_quietly() {
        let kp = MeshKeypair::generate();
        let sig = MeshSignature::from_bytes(vec![0u8; 12]);
        assert!(!kp.public_key().verify(b"anything", &sig));
    }

    #[test]
    fn debug_never_prints_secret() {
        let kp = MeshKeypair::generate();
        let debug = format!("{:?}", kp);
        let secret_hex = hex::encode(kp.secret_key_bytes());
        assert!(!debug.contains(&secret_hex));
    }
}
