//! # Cryptographic Primitives
//!
//! Ed25519 keypairs and the canonical signing discipline every gossip
//! message, trigger event, and route update goes through.
//!
//! ```text
//! keys.rs     — MeshKeypair / MeshPublicKey / MeshSignature wrappers
//! signing.rs  — canonical byte form + sign/verify helpers
//! ```

pub mod keys;
pub mod signing;

pub use keys::{KeyError, MeshKeypair, MeshPublicKey, MeshSignature};
pub use signing::{canonical_message, sign_canonical, verify_canonical, SigningError};
