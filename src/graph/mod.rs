//! Read-only interaction graph over dense integer indices.
//!
//! Users and items live in arenas addressed by `u32` handles so neighbor
//! sampling and multi-hop traversal stay allocation-light and the whole
//! graph can be shared read-only across scoring tasks behind an `Arc`.
//! Ingestion populates the graph; this core never writes item metadata.

use crate::models::TrustComponents;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Bounded per-user recency window, matching the serving-side cap on
/// retained history.
pub const INTERACTION_WINDOW: usize = 100;

/// Dense handle into the user arena.
pub type UserIdx = u32;
/// Dense handle into the item arena.
pub type ItemIdx = u32;

/// One recorded interaction. Immutable once recorded; freshness is applied
/// by the decay function at read time, never by mutation.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub to: u32,
    pub weight: f32,
    pub timestamp: DateTime<Utc>,
}

impl Edge {
    /// Exponential read-time decay with the given half-life in days.
    pub fn decayed_weight(&self, now: DateTime<Utc>, half_life_days: f32) -> f32 {
        let age_days = (now - self.timestamp).num_seconds().max(0) as f32 / 86_400.0;
        self.weight * (0.5f32).powf(age_days / half_life_days)
    }
}

/// A user's bounded interaction window entry.
#[derive(Debug, Clone, Copy)]
pub struct WindowEntry {
    pub item: ItemIdx,
    pub rating: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserNode {
    pub user_id: Uuid,
    /// Ring buffer of the most recent interactions, newest at the back.
    pub window: VecDeque<WindowEntry>,
    /// Differential-privacy budget consumed by federated participation.
    pub consumed_epsilon: f64,
}

#[derive(Debug, Clone)]
pub struct ItemNode {
    pub item_id: Uuid,
    pub tags: Vec<String>,
    pub trust: TrustComponents,
    pub popularity: f32,
}

/// Bipartite user-item interaction graph.
pub struct InteractionGraph {
    users: Vec<UserNode>,
    items: Vec<ItemNode>,
    user_index: HashMap<Uuid, UserIdx>,
    item_index: HashMap<Uuid, ItemIdx>,
    /// Adjacency: user -> item edges, item -> user edges.
    user_edges: Vec<Vec<Edge>>,
    item_edges: Vec<Vec<Edge>>,
}

impl InteractionGraph {
    pub fn new() -> Self {
        Self {
            users: Vec::new(),
            items: Vec::new(),
            user_index: HashMap::new(),
            item_index: HashMap::new(),
            user_edges: Vec::new(),
            item_edges: Vec::new(),
        }
    }

    /// Register a user on first interaction. Idempotent.
    pub fn upsert_user(&mut self, user_id: Uuid) -> UserIdx {
        if let Some(&idx) = self.user_index.get(&user_id) {
            return idx;
        }
        let idx = self.users.len() as UserIdx;
        self.users.push(UserNode {
            user_id,
            window: VecDeque::with_capacity(INTERACTION_WINDOW),
            consumed_epsilon: 0.0,
        });
        self.user_edges.push(Vec::new());
        self.user_index.insert(user_id, idx);
        idx
    }

    /// Register an item from ingestion metadata. Idempotent on id; metadata
    /// refresh replaces tags/trust/popularity in place.
    pub fn upsert_item(
        &mut self,
        item_id: Uuid,
        tags: Vec<String>,
        trust: TrustComponents,
        popularity: f32,
    ) -> ItemIdx {
        if let Some(&idx) = self.item_index.get(&item_id) {
            let node = &mut self.items[idx as usize];
            node.tags = tags;
            node.trust = trust;
            node.popularity = popularity;
            return idx;
        }
        let idx = self.items.len() as ItemIdx;
        self.items.push(ItemNode {
            item_id,
            tags,
            trust,
            popularity,
        });
        self.item_edges.push(Vec::new());
        self.item_index.insert(item_id, idx);
        idx
    }

    /// Record an interaction edge. The edge itself is append-only; the
    /// user's recency window is the only bounded, mutating view of history.
    pub fn record_interaction(
        &mut self,
        user_id: Uuid,
        item_id: Uuid,
        rating: f32,
        timestamp: DateTime<Utc>,
    ) {
        let user = self.upsert_user(user_id);
        let item = match self.item_index.get(&item_id) {
            Some(&idx) => idx,
            None => return, // unknown item: ingestion has not published it
        };

        // Engagement weight derived from rating, normalized to [0, 1].
        let weight = (rating / 5.0).clamp(0.0, 1.0);

        self.user_edges[user as usize].push(Edge {
            to: item,
            weight,
            timestamp,
        });
        self.item_edges[item as usize].push(Edge {
            to: user,
            weight,
            timestamp,
        });

        let window = &mut self.users[user as usize].window;
        if window.len() == INTERACTION_WINDOW {
            window.pop_front();
        }
        window.push_back(WindowEntry {
            item,
            rating,
            timestamp,
        });
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn user_idx(&self, user_id: Uuid) -> Option<UserIdx> {
        self.user_index.get(&user_id).copied()
    }

    pub fn item_idx(&self, item_id: Uuid) -> Option<ItemIdx> {
        self.item_index.get(&item_id).copied()
    }

    pub fn user(&self, idx: UserIdx) -> &UserNode {
        &self.users[idx as usize]
    }

    pub fn item(&self, idx: ItemIdx) -> &ItemNode {
        &self.items[idx as usize]
    }

    pub fn item_id(&self, idx: ItemIdx) -> Uuid {
        self.items[idx as usize].item_id
    }

    /// Outgoing edges of a user (user -> item).
    pub fn user_interactions(&self, idx: UserIdx) -> &[Edge] {
        &self.user_edges[idx as usize]
    }

    /// Incoming edges of an item (item -> user).
    pub fn item_interactions(&self, idx: ItemIdx) -> &[Edge] {
        &self.item_edges[idx as usize]
    }

    /// Item ids the user has already interacted with.
    pub fn seen_items(&self, idx: UserIdx) -> Vec<ItemIdx> {
        self.user_edges[idx as usize].iter().map(|e| e.to).collect()
    }

    pub fn items_iter(&self) -> impl Iterator<Item = (ItemIdx, &ItemNode)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, node)| (i as ItemIdx, node))
    }

    /// Popularity ranking over the catalog, excluding the given items.
    /// Used as the collaborative fallback when factorization degenerates.
    pub fn popularity_ranking(&self, k: usize, exclude: &[ItemIdx]) -> Vec<ItemIdx> {
        let mut ranked: Vec<(ItemIdx, f32)> = self
            .items
            .iter()
            .enumerate()
            .map(|(i, node)| (i as ItemIdx, node.popularity))
            .filter(|(i, _)| !exclude.contains(i))
            .collect();
        // Deterministic: popularity desc, then item id asc.
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.item_id(a.0).cmp(&self.item_id(b.0)))
        });
        ranked.into_iter().take(k).map(|(i, _)| i).collect()
    }
}

impl Default for InteractionGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trust_now() -> TrustComponents {
        TrustComponents {
            source_reliability: 0.9,
            metadata_accuracy: 0.9,
            availability_confidence: 0.9,
            feedback_quality: 0.9,
            preference_confidence: 0.9,
            last_verified: Utc::now(),
        }
    }

    #[test]
    fn window_is_bounded() {
        let mut graph = InteractionGraph::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        for i in 0..(INTERACTION_WINDOW + 20) {
            let item = Uuid::new_v4();
            graph.upsert_item(item, vec![], trust_now(), 0.5);
            graph.record_interaction(user, item, 4.0, now + Duration::seconds(i as i64));
        }
        let idx = graph.user_idx(user).unwrap();
        assert_eq!(graph.user(idx).window.len(), INTERACTION_WINDOW);
        // Edges remain append-only and unbounded.
        assert_eq!(graph.user_interactions(idx).len(), INTERACTION_WINDOW + 20);
    }

    #[test]
    fn decay_halves_at_half_life() {
        let now = Utc::now();
        let edge = Edge {
            to: 0,
            weight: 1.0,
            timestamp: now - Duration::days(30),
        };
        let decayed = edge.decayed_weight(now, 30.0);
        assert!((decayed - 0.5).abs() < 0.01);
    }

    #[test]
    fn popularity_ranking_excludes_and_orders() {
        let mut graph = InteractionGraph::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let ia = graph.upsert_item(a, vec![], trust_now(), 0.9);
        graph.upsert_item(b, vec![], trust_now(), 0.8);
        graph.upsert_item(c, vec![], trust_now(), 0.7);

        let ranked = graph.popularity_ranking(10, &[ia]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(graph.item_id(ranked[0]), b);
        assert_eq!(graph.item_id(ranked[1]), c);
    }
}
