//! Deterministic feature-hashing embedder — the default provider.
//!
//! No model files, no GPU, no network: tokens and token bigrams are hashed
//! with SHA-256 into a fixed number of buckets with ±1 signs, then the
//! accumulated vector is L2-normalized. This is the classic hashing trick;
//! it is nowhere near a sentence encoder in quality, but it is fully
//! deterministic across platforms, fast enough for gossip churn, and places
//! texts sharing vocabulary near each other — which is exactly what a mesh
//! needs before a real encoder is wired in.
//!
//! All nodes in a mesh must agree on the provider. The `model_id` string is
//! carried in diagnostics so mixed meshes are visible.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EMBEDDING_DIM;

use super::{EmbedError, Embedding, EmbeddingProvider};

/// Stable identifier; bump the suffix if the hashing scheme ever changes.
const MODEL_ID: &str = "hashed-sha256-384-v1";

/// The deterministic default embedding provider.
#[derive(Debug, Clone, Default)]
pub struct HashedEmbedder;

impl HashedEmbedder {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous embedding core, also used directly by tests and by
    /// callers that are already off the async path.
    pub fn embed_sync(&self, text: &str) -> Result<Embedding, EmbedError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(EmbedError::ZeroVector);
        }

        let mut acc = vec![0.0f32; EMBEDDING_DIM];
        for token in &tokens {
            accumulate(&mut acc, token.as_bytes());
        }
        // Bigrams capture a little word order; weighted under unigrams so
        // shared vocabulary still dominates.
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            accumulate_weighted(&mut acc, joined.as_bytes(), 0.5);
        }

        Embedding::new(acc)
    }
}

/// Lowercased alphanumeric tokens; everything else is a separator.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn accumulate(acc: &mut [f32], feature: &[u8]) {
    accumulate_weighted(acc, feature, 1.0);
}

/// Hashes one feature into a bucket with a sign bit.
///
/// Bytes 0..4 of the digest pick the bucket, byte 4's low bit picks the
/// sign. Both are stable across platforms because SHA-256 is.
fn accumulate_weighted(acc: &mut [f32], feature: &[u8], weight: f32) {
    let digest = Sha256::digest(feature);
    let bucket =
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % acc.len();
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    acc[bucket] += sign * weight;
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        self.embed_sync(text)
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}
