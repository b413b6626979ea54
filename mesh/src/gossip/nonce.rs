//! Replay protection: the bounded nonce cache.
//!
//! Every accepted envelope's `(nonce, timestamp)` is retained for the nonce
//! window (300 s). A repeated nonce inside the window is a silent drop —
//! the caller increments a metric and nothing else happens.
//!
//! Retention is keyed on *insertion* time, not the message's claimed
//! timestamp; a peer cannot shorten its own replay window by lying about
//! the clock.

use dashmap::DashMap;

use crate::clock::now_secs;
use crate::config::NONCE_CACHE_SECS;

/// Entry: message timestamp plus when we first saw the nonce.
#[derive(Debug, Clone, Copy)]
struct Seen {
    #[allow(dead_code)]
    message_timestamp: f64,
    inserted_at: f64,
}

/// Concurrent nonce cache shared by the gossip engine's ingest paths.
pub struct NonceCache {
    retention_secs: f64,
    seen: DashMap<String, Seen>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::with_retention(NONCE_CACHE_SECS)
    }

    pub fn with_retention(retention_secs: f64) -> Self {
        Self {
            retention_secs,
            seen: DashMap::new(),
        }
    }

    /// Records a nonce. Returns `false` when the nonce was already present
    /// (a replay) — the entry is left untouched in that case so the replay
    /// cannot extend its own window.
    pub fn check_and_insert(&self, nonce: &str, message_timestamp: f64) -> bool {
        self.check_and_insert_at(nonce, message_timestamp, now_secs())
    }

    pub fn check_and_insert_at(&self, nonce: &str, message_timestamp: f64, now: f64) -> bool {
        let mut fresh = false;
        self.seen.entry(nonce.to_string()).or_insert_with(|| {
            fresh = true;
            Seen {
                message_timestamp,
                inserted_at: now,
            }
        });
        fresh
    }

    /// Drops nonces older than the retention window. Returns the count
    /// removed.
    pub fn prune(&self) -> usize {
        self.prune_at(now_secs())
    }

    pub fn prune_at(&self, now: f64) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now - seen.inserted_at < self.retention_secs);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_succeeds_repeat_fails() {
        let cache = NonceCache::new();
        assert!(cache.check_and_insert_at("a1b2c3d4e5f60718", 100.0, 100.0));
        assert!(!cache.check_and_insert_at("a1b2c3d4e5f60718", 100.0, 110.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_nonces_coexist() {
        let cache = NonceCache::new();
        assert!(cache.check_and_insert_at("0000000000000001", 1.0, 1.0));
        assert!(cache.check_and_insert_at("0000000000000002", 1.0, 1.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn prune_drops_only_aged_entries() {
        let cache = NonceCache::with_retention(300.0);
        cache.check_and_insert_at("old0000000000000", 0.0, 0.0);
        cache.check_and_insert_at("new0000000000000", 200.0, 200.0);

        assert_eq!(cache.prune_at(301.0), 1);
        assert_eq!(cache.len(), 1);
        // The pruned nonce is acceptable again.
        assert!(cache.check_and_insert_at("old0000000000000", 301.0, 301.0));
    }

    #[test]
    fn replay_does_not_extend_its_own_window() {
        let cache = NonceCache::with_retention(300.0);
        cache.check_and_insert_at("abcdef0123456789", 0.0, 0.0);
        // Replayed at t=290: still rejected, but must NOT refresh the entry.
        assert!(!cache.check_and_insert_at("abcdef0123456789", 290.0, 290.0));
        // At t=301 the original insertion has aged out.
        assert_eq!(cache.prune_at(301.0), 1);
    }
}
