//! # Canonical Signing
//!
//! Every gossip envelope is signed over a canonical byte form:
//!
//! ```text
//! from LF to LF payload-json LF ttl LF timestamp LF nonce
//! ```
//!
//! Fixed field order, fixed `\n` separators. The payload is compact JSON
//! (no embedded newlines), so the six fields occupy six lines and the
//! encoding is unambiguous. A broadcast (`to = None`) serializes as the
//! empty string in the second position.
//!
//! The timestamp is rendered through `serde_json`, which produces the
//! shortest round-trip representation of the `f64`. Signer and verifier
//! both format from the parsed value, so the bytes agree even across
//! platforms.

use thiserror::Error;

use super::keys::{MeshKeypair, MeshPublicKey, MeshSignature};

/// Errors constructing or checking canonical signatures.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("payload is not serializable: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// Builds the canonical byte form of an envelope for signing.
///
/// `payload_json` must be the compact (single-line) JSON of the payload —
/// exactly the bytes that go on the wire.
pub fn canonical_message(
    from: &str,
    to: Option<&str>,
    payload_json: &str,
    ttl: u8,
    timestamp: f64,
    nonce: &str,
) -> Vec<u8> {
    let ts = serde_json::to_string(&timestamp).unwrap_or_else(|_| "0".to_string());
    let mut out = Vec::with_capacity(
        from.len() + payload_json.len() + nonce.len() + ts.len() + 16,
    );
    out.extend_from_slice(from.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(to.unwrap_or("").as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload_json.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(ttl.to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(ts.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(nonce.as_bytes());
    out
}

/// Signs the canonical form of an envelope.
pub fn sign_canonical(
    keypair: &MeshKeypair,
    from: &str,
    to: Option<&str>,
    payload_json: &str,
    ttl: u8,
    timestamp: f64,
    nonce: &str,
) -> MeshSignature {
    let message = canonical_message(from, to, payload_json, ttl, timestamp, nonce);
    keypair.sign(&message)
}

/// Verifies an envelope signature against the claimed sender's public key.
///
/// Returns `false` for any failure — bad key, bad signature, wrong bytes.
/// Callers drop the message without state change, per the admission rules.
pub fn verify_canonical(
    public_key: &MeshPublicKey,
    from: &str,
    to: Option<&str>,
    payload_json: &str,
    ttl: u8,
    timestamp: f64,
    nonce: &str,
    signature: &MeshSignature,
) -> bool {
    let message = canonical_message(from, to, payload_json, ttl, timestamp, nonce);
    public_key.verify(&message, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = MeshKeypair::generate();
        let from = kp.public_key().to_hex();
        let payload = r#"{"kind":"heartbeat","capabilities":[]}"#;

        let sig = sign_canonical(&kp, &from, None, payload, 10, 1_700_000_000.5, "a1b2c3d4e5f60718");
        assert!(verify_canonical(
            &kp.public_key(),
            &from,
            None,
            payload,
            10,
            1_700_000_000.5,
            "a1b2c3d4e5f60718",
            &sig,
        ));
    }

    #[test]
    fn any_field_change_breaks_the_signature() {
        let kp = MeshKeypair::generate();
        let from = kp.public_key().to_hex();
        let payload = r#"{"kind":"removed","capability_id":"n:llm:chat"}"#;
        let sig = sign_canonical(&kp, &from, Some("peer-b"), payload, 5, 1000.0, "00ff00ff00ff00ff");

        let pk = kp.public_key();
        // TTL tampering (the classic relay cheat) must invalidate.
        assert!(!verify_canonical(&pk, &from, Some("peer-b"), payload, 4, 1000.0, "00ff00ff00ff00ff", &sig));
        // Recipient swap.
        assert!(!verify_canonical(&pk, &from, Some("peer-c"), payload, 5, 1000.0, "00ff00ff00ff00ff", &sig));
        // Timestamp nudge.
        assert!(!verify_canonical(&pk, &from, Some("peer-b"), payload, 5, 1000.1, "00ff00ff00ff00ff", &sig));
        // Nonce swap.
        assert!(!verify_canonical(&pk, &from, Some("peer-b"), payload, 5, 1000.0, "ff00ff00ff00ff00", &sig));
    }

    #[test]
    fn broadcast_and_directed_forms_differ() {
        let a = canonical_message("n1", None, "{}", 1, 0.0, "n");
        let b = canonical_message("n1", Some(""), "{}", 1, 0.0, "n");
        // Empty recipient and broadcast share one canonical form.
        assert_eq!(a, b);

        let c = canonical_message("n1", Some("n2"), "{}", 1, 0.0, "n");
        assert_ne!(a, c);
    }

    #[test]
    fn timestamp_formatting_is_stable() {
        // Whole-second timestamps and fractional ones both round-trip.
        let m1 = canonical_message("n", None, "{}", 0, 1_700_000_000.0, "x");
        let m2 = canonical_message("n", None, "{}", 0, 1_700_000_000.0, "x");
        assert_eq!(m1, m2);
    }
}
