//! # Gradient Table
//!
//! A bounded, distance-vector routing structure: capability id → best known
//! route. "Gradient" because confidence decays multiplicatively with every
//! hop (0.95^hops), so the table naturally slopes toward near replicas when
//! semantic scores tie.
//!
//! ## Replacement discipline
//!
//! An existing entry is replaced only when the newcomer has *strictly*
//! fewer hops, or the incumbent has expired. Equal-hop churn is ignored —
//! under gossip, accepting equal-cost alternates makes routes oscillate
//! between peers on every round.
//!
//! ## Bounded size
//!
//! The table never exceeds its configured bound. On overflow the entry
//! minimizing `confidence / (1 + age_minutes)` is evicted: old and distant
//! goes first, fresh and near stays. Local capabilities (hops = 0, next hop
//! = self) are pinned and never evicted.
//!
//! ## Tombstones
//!
//! A removed capability id is tombstoned for 60 seconds so that stale
//! re-announcements still in flight do not resurrect it.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capability::{CapabilityId, Constraints};
use crate::clock::now_secs;
use crate::config::{
    CONFIDENCE_DECAY, GRADIENT_EXPIRE_SECS, GRADIENT_TABLE_MAX, TOMBSTONE_SECS,
};
use crate::embed::Embedding;
use crate::identity::NodeId;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One routing entry: the best known way to reach a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientEntry {
    pub capability_id: CapabilityId,
    pub label: String,
    pub vector: Embedding,
    /// Network links between this node and the capability's originator.
    pub hops: u8,
    /// Directly reachable peer the capability is routed through. Equal to
    /// the local node id for local capabilities.
    pub next_hop: NodeId,
    /// Originating node of the capability.
    pub via: NodeId,
    pub est_latency_ms: f64,
    /// Wall-clock seconds of the last announce/heartbeat refresh.
    pub last_updated: f64,
    /// Constraints advertised with the capability; the router scores on
    /// cost and model class.
    #[serde(default)]
    pub constraints: Constraints,
}

impl GradientEntry {
    /// Route confidence: `0.95 ^ hops`.
    pub fn confidence(&self) -> f64 {
        CONFIDENCE_DECAY.powi(self.hops as i32)
    }

    /// Confidence with an extra hop charged, used while the next-hop peer
    /// is marked offline.
    pub fn degraded_confidence(&self) -> f64 {
        CONFIDENCE_DECAY.powi(self.hops as i32 + 1)
    }

    /// True when this entry describes a capability hosted on this node.
    pub fn is_local(&self) -> bool {
        self.hops == 0
    }

    fn is_expired(&self, now: f64, expire_secs: f64) -> bool {
        !self.is_local() && now - self.last_updated > expire_secs
    }

    /// Eviction priority: lower is evicted first.
    fn eviction_score(&self, now: f64) -> f64 {
        let age_minutes = ((now - self.last_updated).max(0.0)) / 60.0;
        self.confidence() / (1.0 + age_minutes)
    }
}

/// A `find_best` result: the winning entry plus its scores.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub entry: GradientEntry,
    /// Raw cosine similarity between intent and capability vectors.
    pub similarity: f64,
    /// `similarity * confidence` — the score compared against `min_score`.
    pub adjusted: f64,
}

/// A pending route advertisement, as extracted from one announcement. A
/// batch of these is applied under a single write lock so a concurrent
/// `find_best` sees either none or all of an announcement's updates.
#[derive(Debug, Clone)]
pub struct RouteAdvert {
    pub capability_id: CapabilityId,
    pub label: String,
    pub vector: Embedding,
    pub hops: u8,
    pub next_hop: NodeId,
    pub via: NodeId,
    pub est_latency_ms: Option<f64>,
    pub constraints: Constraints,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// The bounded routing store. One lock, many readers; see the module docs
/// for the replacement and eviction rules.
pub struct GradientTable {
    local_node: NodeId,
    max_size: usize,
    expire_secs: f64,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CapabilityId, GradientEntry>,
    /// Recently removed ids and their tombstone timestamps.
    tombstones: HashMap<CapabilityId, f64>,
    /// Peers currently considered unreachable; their routes score one hop
    /// worse but are not dropped.
    offline_peers: std::collections::HashSet<NodeId>,
}

impl GradientTable {
    /// Builds a table with the default bound and expiry.
    pub fn new(local_node: NodeId) -> Self {
        Self::with_limits(local_node, GRADIENT_TABLE_MAX, GRADIENT_EXPIRE_SECS)
    }

    /// Builds a table with explicit limits (tests, constrained devices).
    pub fn with_limits(local_node: NodeId, max_size: usize, expire_secs: f64) -> Self {
        Self {
            local_node,
            max_size: max_size.max(1),
            expire_secs,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// The node id whose local capabilities are pinned here.
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    // -- Updates ----------------------------------------------------------

    /// Records a route to a capability. Wall-clock wrapper over
    /// [`GradientTable::update_at`].
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        capability_id: CapabilityId,
        label: String,
        vector: Embedding,
        hops: u8,
        next_hop: NodeId,
        via: NodeId,
        est_latency_ms: Option<f64>,
        constraints: Constraints,
    ) -> bool {
        self.update_at(
            capability_id,
            label,
            vector,
            hops,
            next_hop,
            via,
            est_latency_ms,
            constraints,
            now_secs(),
        )
    }

    /// Records a route, with an explicit clock.
    ///
    /// Returns whether the table changed. Acceptance rules, in order:
    /// tombstoned ids are rejected; an existing non-expired entry is only
    /// replaced by strictly fewer hops; on capacity the lowest-scoring
    /// evictable entry makes room.
    #[allow(clippy::too_many_arguments)]
    pub fn update_at(
        &self,
        capability_id: CapabilityId,
        label: String,
        vector: Embedding,
        hops: u8,
        next_hop: NodeId,
        via: NodeId,
        est_latency_ms: Option<f64>,
        constraints: Constraints,
        now: f64,
    ) -> bool {
        let mut inner = self.inner.write();
        self.apply(
            &mut inner,
            RouteAdvert {
                capability_id,
                label,
                vector,
                hops,
                next_hop,
                via,
                est_latency_ms,
                constraints,
            },
            now,
        )
    }

    /// Applies a whole announcement's worth of adverts under one write
    /// lock. Returns how many changed the table.
    pub fn update_many_at(&self, adverts: Vec<RouteAdvert>, now: f64) -> usize {
        let mut inner = self.inner.write();
        adverts
            .into_iter()
            .filter(|advert| self.apply(&mut inner, advert.clone(), now))
            .count()
    }

    fn apply(&self, inner: &mut Inner, advert: RouteAdvert, now: f64) -> bool {
        let RouteAdvert {
            capability_id,
            label,
            vector,
            hops,
            next_hop,
            via,
            est_latency_ms,
            constraints,
        } = advert;

        if let Some(&buried_at) = inner.tombstones.get(&capability_id) {
            if now - buried_at < TOMBSTONE_SECS {
                trace!(capability = %capability_id, "update rejected: tombstoned");
                return false;
            }
            inner.tombstones.remove(&capability_id);
        }

        let est_latency_ms =
            est_latency_ms.unwrap_or(hops as f64 * crate::config::HOP_LATENCY_MS);

        if let Some(existing) = inner.entries.get(&capability_id) {
            let expired = existing.is_expired(now, self.expire_secs);
            if hops >= existing.hops && !expired {
                trace!(
                    capability = %capability_id,
                    new_hops = hops,
                    existing_hops = existing.hops,
                    "update rejected: not strictly better"
                );
                return false;
            }
        } else if inner.entries.len() >= self.max_size {
            // Make room: evict the lowest-score non-local entry.
            let victim = inner
                .entries
                .values()
                .filter(|e| !e.is_local())
                .min_by(|a, b| {
                    a.eviction_score(now)
                        .partial_cmp(&b.eviction_score(now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|e| e.capability_id.clone());

            match victim {
                Some(victim_id) => {
                    inner.entries.remove(&victim_id);
                    debug!(evicted = %victim_id, inserted = %capability_id, "gradient table full, evicted lowest score");
                }
                None => {
                    // Table is entirely local pins; nothing evictable.
                    debug!(capability = %capability_id, "gradient table full of local entries, update dropped");
                    return false;
                }
            }
        }

        inner.entries.insert(
            capability_id.clone(),
            GradientEntry {
                capability_id,
                label,
                vector,
                hops,
                next_hop,
                via,
                est_latency_ms,
                last_updated: now,
                constraints,
            },
        );
        true
    }

    /// Pins a local capability: hops 0, next hop self.
    pub fn insert_local(
        &self,
        capability_id: CapabilityId,
        label: String,
        vector: Embedding,
        est_latency_ms: f64,
    ) {
        let mut inner = self.inner.write();
        inner.tombstones.remove(&capability_id);
        inner.entries.insert(
            capability_id.clone(),
            GradientEntry {
                capability_id,
                label,
                vector,
                hops: 0,
                next_hop: self.local_node.clone(),
                via: self.local_node.clone(),
                est_latency_ms,
                last_updated: now_secs(),
                constraints: Constraints::default(),
            },
        );
    }

    /// Heartbeat refresh: bumps `last_updated` forward, never backward.
    /// Returns whether the id was known.
    pub fn refresh_at(&self, capability_id: &CapabilityId, now: f64) -> bool {
        match self.inner.write().entries.get_mut(capability_id) {
            Some(entry) => {
                if now > entry.last_updated {
                    entry.last_updated = now;
                }
                true
            }
            None => false,
        }
    }

    /// Update-message mutation: label and latency estimate only. Never
    /// touches hops, next hop, or the vector — updates must not widen
    /// routing scope.
    pub fn update_meta(
        &self,
        capability_id: &CapabilityId,
        label: Option<String>,
        est_latency_ms: Option<f64>,
    ) -> bool {
        match self.inner.write().entries.get_mut(capability_id) {
            Some(entry) => {
                if let Some(label) = label {
                    entry.label = label;
                }
                if let Some(lat) = est_latency_ms {
                    entry.est_latency_ms = lat;
                }
                true
            }
            None => false,
        }
    }

    // -- Removal ----------------------------------------------------------

    /// Removes an entry and tombstones the id.
    pub fn remove(&self, capability_id: &CapabilityId) -> bool {
        self.remove_at(capability_id, now_secs())
    }

    pub fn remove_at(&self, capability_id: &CapabilityId, now: f64) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(capability_id).is_some();
        inner.tombstones.insert(capability_id.clone(), now);
        removed
    }

    /// Purges every entry originated by or routed through a node. Used on
    /// NodeLeave and on token revocation.
    pub fn purge_node(&self, node: &NodeId) -> usize {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.is_local() || (&e.via != node && &e.next_hop != node));
        before - inner.entries.len()
    }

    /// Drops expired remote entries. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(now_secs())
    }

    pub fn prune_expired_at(&self, now: f64) -> usize {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        let expire_secs = self.expire_secs;
        inner
            .entries
            .retain(|_, e| !e.is_expired(now, expire_secs));
        // Tombstones age out on the same sweep.
        inner
            .tombstones
            .retain(|_, buried_at| now - *buried_at < TOMBSTONE_SECS);
        before - inner.entries.len()
    }

    // -- Offline peers ----------------------------------------------------

    /// Marks a peer's routes as degraded (scored one hop worse) or
    /// restores them.
    pub fn set_peer_offline(&self, peer: &NodeId, offline: bool) {
        let mut inner = self.inner.write();
        if offline {
            inner.offline_peers.insert(peer.clone());
        } else {
            inner.offline_peers.remove(peer);
        }
    }

    // -- Queries ----------------------------------------------------------

    /// Finds the best non-expired entry for an intent vector.
    pub fn find_best(&self, intent: &Embedding, min_score: f64) -> Option<RouteCandidate> {
        self.find_best_at(intent, min_score, now_secs())
    }

    /// Finds the best entry with an explicit clock.
    ///
    /// The scan (dot products included) runs under the read lock; the lock
    /// is released before the caller applies any policy adjustments.
    pub fn find_best_at(
        &self,
        intent: &Embedding,
        min_score: f64,
        now: f64,
    ) -> Option<RouteCandidate> {
        let inner = self.inner.read();
        let mut best: Option<RouteCandidate> = None;

        for entry in inner.entries.values() {
            if entry.is_expired(now, self.expire_secs) {
                continue;
            }
            let similarity = entry.vector.dot(intent) as f64;
            let confidence = if inner.offline_peers.contains(&entry.next_hop) {
                entry.degraded_confidence()
            } else {
                entry.confidence()
            };
            let adjusted = similarity * confidence;
            if adjusted < min_score {
                continue;
            }

            let better = match &best {
                None => true,
                Some(current) => {
                    // Deterministic: score, then hops, then latency, then id.
                    adjusted > current.adjusted
                        || (adjusted == current.adjusted
                            && (entry.hops < current.entry.hops
                                || (entry.hops == current.entry.hops
                                    && (entry.est_latency_ms < current.entry.est_latency_ms
                                        || (entry.est_latency_ms == current.entry.est_latency_ms
                                            && entry.capability_id
                                                < current.entry.capability_id)))))
                }
            };
            if better {
                best = Some(RouteCandidate {
                    entry: entry.clone(),
                    similarity,
                    adjusted,
                });
            }
        }
        best
    }

    /// All non-expired candidates above `min_score`, best first. The
    /// executor walks this list when a route times out.
    pub fn find_candidates_at(
        &self,
        intent: &Embedding,
        min_score: f64,
        now: f64,
    ) -> Vec<RouteCandidate> {
        let inner = self.inner.read();
        let mut candidates: Vec<RouteCandidate> = inner
            .entries
            .values()
            .filter(|e| !e.is_expired(now, self.expire_secs))
            .filter_map(|entry| {
                let similarity = entry.vector.dot(intent) as f64;
                let confidence = if inner.offline_peers.contains(&entry.next_hop) {
                    entry.degraded_confidence()
                } else {
                    entry.confidence()
                };
                let adjusted = similarity * confidence;
                (adjusted >= min_score).then(|| RouteCandidate {
                    entry: entry.clone(),
                    similarity,
                    adjusted,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.adjusted
                .partial_cmp(&a.adjusted)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.entry.hops.cmp(&b.entry.hops))
                .then(
                    a.entry
                        .est_latency_ms
                        .partial_cmp(&b.entry.est_latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.entry.capability_id.cmp(&b.entry.capability_id))
        });
        candidates
    }

    /// Looks up a single entry by id.
    pub fn get(&self, capability_id: &CapabilityId) -> Option<GradientEntry> {
        self.inner.read().entries.get(capability_id).cloned()
    }

    /// Entries whose capability id matches a glob (`*` wildcards) or whose
    /// type tag equals the hint. Used by the trigger pipeline's route-hint
    /// fast path.
    pub fn find_by_hint(&self, hint: &str, now: f64) -> Vec<GradientEntry> {
        let inner = self.inner.read();
        inner
            .entries
            .values()
            .filter(|e| !e.is_expired(now, self.expire_secs))
            .filter(|e| {
                glob_match(hint, e.capability_id.as_str()) || e.capability_id.cap_type() == hint
            })
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// A point-in-time copy of all entries, for diagnostics and the
    /// operator API.
    pub fn snapshot(&self) -> Vec<GradientEntry> {
        self.inner.read().entries.values().cloned().collect()
    }
}

/// Minimal `*` glob matcher over capability ids. Segments between stars
/// must appear in order.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let mut pos = 0usize;
    let parts: Vec<&str> = pattern.split('*').collect();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(found) => {
                // A leading literal must anchor at the start.
                if i == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }
    // A trailing literal must anchor at the end.
    if let Some(last) = parts.last() {
        if !last.is_empty() && !text.ends_with(last) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EMBEDDING_DIM;
    use crate::crypto::MeshKeypair;

    fn node(tag: u8) -> NodeId {
        NodeId::from_public_key(&MeshKeypair::from_seed(&[tag; 32]).public_key())
    }

    fn vec_for(seed: u64) -> Embedding {
        // Deterministic unit vectors that differ per seed.
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[(seed as usize) % EMBEDDING_DIM] = 1.0;
        v[(seed as usize + 7) % EMBEDDING_DIM] = 0.5;
        Embedding::new(v).unwrap()
    }

    fn cap(owner: &NodeId, name: &str) -> CapabilityId {
        CapabilityId::new(owner, "llm", name)
    }

    fn table(max: usize) -> GradientTable {
        GradientTable::with_limits(node(0), max, GRADIENT_EXPIRE_SECS)
    }

    #[test]
    fn insert_then_find() {
        let t = table(10);
        let owner = node(1);
        let id = cap(&owner, "chat");
        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 100.0));

        let hit = t.find_best_at(&vec_for(1), 0.5, 100.0).expect("found");
        assert_eq!(hit.entry.capability_id, id);
        assert!((hit.entry.confidence() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn empty_table_returns_none() {
        let t = table(10);
        assert!(t.find_best_at(&vec_for(1), 0.0, 0.0).is_none());
    }

    #[test]
    fn replacement_requires_strictly_fewer_hops() {
        let t = table(10);
        let owner = node(1);
        let relay = node(2);
        let id = cap(&owner, "chat");

        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 2, relay.clone(), owner.clone(), None, Constraints::default(), 100.0));
        // Equal hops: rejected.
        assert!(!t.update_at(id.clone(), "Chat".into(), vec_for(1), 2, owner.clone(), owner.clone(), None, Constraints::default(), 101.0));
        // More hops: rejected.
        assert!(!t.update_at(id.clone(), "Chat".into(), vec_for(1), 3, relay.clone(), owner.clone(), None, Constraints::default(), 102.0));
        // Strictly fewer: accepted.
        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 103.0));
        assert_eq!(t.get(&id).unwrap().hops, 1);
    }

    #[test]
    fn expired_incumbent_accepts_worse_route() {
        let t = table(10);
        let owner = node(1);
        let id = cap(&owner, "chat");

        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0));
        // 300.1 s later the incumbent has expired; 3 hops may replace 1.
        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 3, node(2), owner.clone(), None, Constraints::default(), 300.2));
        assert_eq!(t.get(&id).unwrap().hops, 3);
    }

    #[test]
    fn eviction_removes_exactly_the_expired_lowest_score() {
        // Eviction under pressure with a tiny bound.
        let t = table(3);
        let owner = node(1);

        assert!(t.update_at(cap(&owner, "cap1"), "1".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0));
        assert!(t.update_at(cap(&owner, "cap2"), "2".into(), vec_for(2), 1, owner.clone(), owner.clone(), None, Constraints::default(), 1.0));
        assert!(t.update_at(cap(&owner, "cap3"), "3".into(), vec_for(3), 1, owner.clone(), owner.clone(), None, Constraints::default(), 2.0));

        // At t = 300.1, cap1 is expired and has the lowest eviction score.
        assert!(t.update_at(cap(&owner, "cap4"), "4".into(), vec_for(4), 1, owner.clone(), owner.clone(), None, Constraints::default(), 300.1));

        assert_eq!(t.size(), 3);
        assert!(t.get(&cap(&owner, "cap1")).is_none());
        assert!(t.get(&cap(&owner, "cap2")).is_some());
        assert!(t.get(&cap(&owner, "cap3")).is_some());
        assert!(t.get(&cap(&owner, "cap4")).is_some());
    }

    #[test]
    fn size_never_exceeds_bound() {
        let t = table(5);
        let owner = node(1);
        for i in 0..50u64 {
            t.update_at(
                cap(&owner, &format!("c{i}")),
                format!("c{i}"),
                vec_for(i),
                1,
                owner.clone(),
                owner.clone(),
                None,
                Constraints::default(),
                i as f64,
            );
            assert!(t.size() <= 5);
        }
    }

    #[test]
    fn local_entries_are_never_evicted_or_expired() {
        let t = GradientTable::with_limits(node(0), 2, GRADIENT_EXPIRE_SECS);
        let me = node(0);
        let owner = node(1);

        t.insert_local(cap(&me, "local"), "Local".into(), vec_for(9), 5.0);
        t.update_at(cap(&owner, "r1"), "r1".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);
        // Full table: the remote entry is the only eviction candidate.
        t.update_at(cap(&owner, "r2"), "r2".into(), vec_for(2), 1, owner.clone(), owner.clone(), None, Constraints::default(), 1.0);

        assert!(t.get(&cap(&me, "local")).is_some());
        // Long after expiry, the local pin still routes.
        assert_eq!(t.prune_expired_at(10_000.0), 1);
        assert!(t.get(&cap(&me, "local")).is_some());
    }

    #[test]
    fn prune_removes_only_expired() {
        let t = table(10);
        let owner = node(1);
        t.update_at(cap(&owner, "old"), "old".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);
        t.update_at(cap(&owner, "new"), "new".into(), vec_for(2), 1, owner.clone(), owner.clone(), None, Constraints::default(), 200.0);

        assert_eq!(t.prune_expired_at(301.0), 1);
        assert!(t.get(&cap(&owner, "old")).is_none());
        assert!(t.get(&cap(&owner, "new")).is_some());
    }

    #[test]
    fn tombstone_blocks_stale_reannounce() {
        let t = table(10);
        let owner = node(1);
        let id = cap(&owner, "chat");

        t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);
        assert!(t.remove_at(&id, 10.0));

        // Within the tombstone window: rejected.
        assert!(!t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 30.0));
        // After the window: accepted again.
        assert!(t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 80.0));
    }

    #[test]
    fn heartbeat_refresh_is_monotonic() {
        let t = table(10);
        let owner = node(1);
        let id = cap(&owner, "chat");
        t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 100.0);

        assert!(t.refresh_at(&id, 150.0));
        assert_eq!(t.get(&id).unwrap().last_updated, 150.0);
        // An out-of-order heartbeat never rewinds the clock.
        assert!(t.refresh_at(&id, 120.0));
        assert_eq!(t.get(&id).unwrap().last_updated, 150.0);
        // Unknown ids refresh nothing.
        assert!(!t.refresh_at(&cap(&owner, "ghost"), 160.0));
    }

    #[test]
    fn offline_peer_degrades_but_keeps_routes() {
        let t = table(10);
        let owner = node(1);
        let id = cap(&owner, "chat");
        t.update_at(id.clone(), "Chat".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);

        let online = t.find_best_at(&vec_for(1), 0.0, 1.0).unwrap();
        t.set_peer_offline(&owner, true);
        let degraded = t.find_best_at(&vec_for(1), 0.0, 1.0).unwrap();
        assert!(degraded.adjusted < online.adjusted);
        // Route still present, just discounted.
        assert_eq!(degraded.entry.capability_id, id);

        t.set_peer_offline(&owner, false);
        let restored = t.find_best_at(&vec_for(1), 0.0, 1.0).unwrap();
        assert_eq!(restored.adjusted, online.adjusted);
    }

    #[test]
    fn purge_node_drops_routes_through_it() {
        let t = table(10);
        let owner = node(1);
        let other = node(2);
        t.update_at(cap(&owner, "a"), "a".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);
        t.update_at(cap(&other, "b"), "b".into(), vec_for(2), 2, owner.clone(), other.clone(), None, Constraints::default(), 0.0);
        t.update_at(cap(&other, "c"), "c".into(), vec_for(3), 1, other.clone(), other.clone(), None, Constraints::default(), 0.0);

        // Purging `owner` removes entries via it AND routed through it.
        assert_eq!(t.purge_node(&owner), 2);
        assert_eq!(t.size(), 1);
        assert!(t.get(&cap(&other, "c")).is_some());
    }

    #[test]
    fn min_score_is_respected() {
        let t = table(10);
        let owner = node(1);
        t.update_at(cap(&owner, "far"), "far".into(), vec_for(1), 1, owner.clone(), owner.clone(), None, Constraints::default(), 0.0);

        // Orthogonal intent: similarity ~0, below any positive threshold.
        assert!(t.find_best_at(&vec_for(100), 0.5, 1.0).is_none());
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*:automation:*", "aabb:automation:lights"));
        assert!(glob_match("aabb:*", "aabb:camera:porch"));
        assert!(!glob_match("*:automation:*", "aabb:camera:porch"));
        assert!(glob_match("exact:match:only", "exact:match:only"));
        assert!(!glob_match("exact:match:only", "exact:match:only2"));
        assert!(!glob_match("a*z", "abc"));
    }

    #[test]
    fn invariants_hold_on_snapshot() {
        let t = table(50);
        let owner = node(1);
        for i in 0..20u64 {
            t.update_at(
                cap(&owner, &format!("c{i}")),
                format!("c{i}"),
                vec_for(i),
                (i % 7) as u8,
                owner.clone(),
                owner.clone(),
                None,
                Constraints::default(),
                i as f64,
            );
        }
        let now = 100.0;
        for entry in t.snapshot() {
            assert!(entry.last_updated <= now);
            assert!((entry.vector.norm() - 1.0).abs() < 1e-5);
        }
    }
}
