//! # Embedding Provider
//!
//! Intents and capability descriptions meet in one geometric space: unit
//! vectors of [`crate::config::EMBEDDING_DIM`] dimensions. Because every
//! vector is pre-normalized, cosine similarity is a plain dot product, and
//! the gradient-table scan stays a tight multiply-accumulate loop.
//!
//! The provider is swappable: production nodes wire a sentence-encoder
//! backend through [`EmbeddingProvider`]; the deterministic
//! [`hashed::HashedEmbedder`] is the required default and keeps a mesh
//! functional with no model files at all.
//!
//! A failed embedding is a dropped capability, never a zero vector — a zero
//! vector would cosine-match nothing and pollute the table.

pub mod cache;
pub mod hashed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EMBEDDING_DIM, UNIT_NORM_TOLERANCE};

pub use cache::CachedEmbedder;
pub use hashed::HashedEmbedder;

/// Errors producing or validating an embedding.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    #[error("wrong dimension: expected {expected}, got {got}")]
    WrongDimension { expected: usize, got: usize },

    #[error("vector contains non-finite components")]
    NonFinite,

    #[error("zero vector cannot be normalized")]
    ZeroVector,

    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// A unit-length embedding vector.
///
/// The constructor enforces the three invariants every routed vector must
/// hold: exact dimension, finite components, non-zero norm. Construction is
/// the only door — once you hold an `Embedding`, dot products are safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Validates and normalizes a raw vector.
    ///
    /// Vectors already within [`UNIT_NORM_TOLERANCE`] of unit length are
    /// kept bit-exact; others are re-normalized. Zero and non-finite
    /// vectors are rejected.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbedError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbedError::WrongDimension {
                expected: EMBEDDING_DIM,
                got: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::NonFinite);
        }
        let norm_sq: f64 = values.iter().map(|v| (*v as f64) * (*v as f64)).sum();
        let norm = norm_sq.sqrt();
        if norm == 0.0 {
            return Err(EmbedError::ZeroVector);
        }
        if (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE as f64 {
            return Ok(Self { values });
        }
        let values = values.iter().map(|v| (*v as f64 / norm) as f32).collect();
        Ok(Self { values })
    }

    /// Dot product — equal to cosine similarity for unit vectors.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| a * b)
            .sum()
    }

    /// The vector components.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean norm; within tolerance of 1.0 by construction.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbedError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.values
    }
}

/// Pluggable text-to-vector backend.
///
/// Implementations must be deterministic for a fixed model: the same text
/// always yields the same vector. Routing correctness depends on it —
/// announced capability vectors and locally computed intent vectors have to
/// live in the same space.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a text into a unit vector.
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError>;

    /// Stable identifier of the underlying model, for diagnostics.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(dim: usize, fill: f32) -> Vec<f32> {
        vec![fill; dim]
    }

    #[test]
    fn rejects_wrong_dimension() {
        assert!(matches!(
            Embedding::new(raw(100, 0.5)),
            Err(EmbedError::WrongDimension { got: 100, .. })
        ));
    }

    #[test]
    fn rejects_zero_and_nan() {
        assert!(matches!(
            Embedding::new(raw(EMBEDDING_DIM, 0.0)),
            Err(EmbedError::ZeroVector)
        ));

        let mut v = raw(EMBEDDING_DIM, 0.1);
        v[7] = f32::NAN;
        assert!(matches!(Embedding::new(v), Err(EmbedError::NonFinite)));
    }

    #[test]
    fn normalizes_non_unit_input() {
        let e = Embedding::new(raw(EMBEDDING_DIM, 3.0)).expect("valid");
        assert!((e.norm() - 1.0).abs() < UNIT_NORM_TOLERANCE);
    }

    #[test]
    fn dot_of_identical_unit_vectors_is_one() {
        let e = Embedding::new(raw(EMBEDDING_DIM, 1.0)).expect("valid");
        assert!((e.dot(&e) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn serde_enforces_invariants_on_deserialize() {
        // A short vector arriving off the wire must fail to parse.
        let short = serde_json::to_string(&vec![0.5f32; 10]).unwrap();
        assert!(serde_json::from_str::<Embedding>(&short).is_err());

        let e = Embedding::new(raw(EMBEDDING_DIM, 2.0)).expect("valid");
        let json = serde_json::to_string(&e).unwrap();
        let back: Embedding = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
