//! Bounded LRU cache in front of an embedding provider.
//!
//! Gossip re-announces the same capability descriptions every 30 seconds;
//! without a cache, every round re-embeds text the node has already seen.
//! The cache keys on the exact text (the provider is deterministic, so the
//! text fully determines the vector).

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::EMBED_CACHE_SIZE;

use super::{EmbedError, Embedding, EmbeddingProvider};

/// Wraps any [`EmbeddingProvider`] with a bounded LRU of recent results.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Embedding>>,
}

impl CachedEmbedder {
    /// Builds a cache of the default capacity around a provider.
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_capacity(inner, EMBED_CACHE_SIZE)
    }

    /// Builds a cache with an explicit capacity (minimum 1).
    pub fn with_capacity(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of cached embeddings.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        if let Some(hit) = self.cache.lock().get(text).cloned() {
            return Ok(hit);
        }

        // The lock is NOT held across the backend call — a slow model must
        // not serialize unrelated embeds. Two concurrent misses on the same
        // text both compute; the second insert is a harmless overwrite.
        let embedding = self.inner.embed(text).await?;
        self.cache
            .lock()
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
