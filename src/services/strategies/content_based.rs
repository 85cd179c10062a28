//! Content-based strategy: cosine similarity in the shared embedding space.
//!
//! Item embeddings are produced by the ingestion collaborator (already
//! L2-normalized). The user profile is a recency- and rating-weighted
//! average over the bounded interaction window, blended 70/30 with a
//! genre-preference vector built from interaction-frequency-weighted
//! taxonomy embeddings. A zero profile abstains instead of returning
//! meaningless near-ties.

use super::ScoringStrategy;
use crate::config::StrategyConfig;
use crate::embedding::{cosine_similarity, l2_normalize, EmbeddingStore, Namespace};
use crate::error::Result;
use crate::graph::InteractionGraph;
use crate::models::{AbstainReason, Candidate, StrategyKind, StrategyOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct ContentBasedStrategy {
    graph: Arc<InteractionGraph>,
    embeddings: Arc<EmbeddingStore>,
    history_weight: f32,
    half_life_days: f32,
}

impl ContentBasedStrategy {
    pub fn new(
        graph: Arc<InteractionGraph>,
        embeddings: Arc<EmbeddingStore>,
        config: &StrategyConfig,
    ) -> Self {
        Self {
            graph,
            embeddings,
            history_weight: config.profile_history_weight,
            half_life_days: config.decay_half_life_days,
        }
    }

    /// Aggregated preference embedding for a user, or `None` on cold start.
    pub fn build_profile(&self, user_idx: u32) -> Option<Vec<f32>> {
        let user = self.graph.user(user_idx);
        if user.window.is_empty() {
            return None;
        }
        let now = Utc::now();
        let dim = self.embeddings.dim();

        // History component: recency- and rating-weighted average.
        let mut history = vec![0.0f32; dim];
        let mut tag_counts: HashMap<&str, f32> = HashMap::new();
        let mut any = false;
        for entry in &user.window {
            let item_node = self.graph.item(entry.item);
            let age_days = (now - entry.timestamp).num_seconds().max(0) as f32 / 86_400.0;
            let recency = (0.5f32).powf(age_days / self.half_life_days);
            let weight = (entry.rating / 5.0).clamp(0.0, 1.0) * recency;

            if let Some(vector) = self.embeddings.vector(Namespace::Item, item_node.item_id) {
                for (acc, x) in history.iter_mut().zip(vector.iter()) {
                    *acc += weight * x;
                }
                any = true;
            }
            for tag in &item_node.tags {
                *tag_counts.entry(tag.as_str()).or_insert(0.0) += weight;
            }
        }
        if !any {
            return None;
        }
        l2_normalize(&mut history);

        // Genre component: interaction-frequency-weighted taxonomy vectors.
        let mut genre = vec![0.0f32; dim];
        let mut has_genre = false;
        for (tag, count) in tag_counts {
            if let Some(vector) = self.embeddings.taxonomy_vector(tag) {
                for (acc, x) in genre.iter_mut().zip(vector.iter()) {
                    *acc += count * x;
                }
                has_genre = true;
            }
        }

        let mut profile = if has_genre {
            l2_normalize(&mut genre);
            let hw = self.history_weight;
            history
                .iter()
                .zip(genre.iter())
                .map(|(h, g)| hw * h + (1.0 - hw) * g)
                .collect()
        } else {
            history
        };
        l2_normalize(&mut profile);

        if profile.iter().all(|x| *x == 0.0) {
            None
        } else {
            Some(profile)
        }
    }
}

#[async_trait]
impl ScoringStrategy for ContentBasedStrategy {
    async fn score(&self, user_id: Uuid, k: usize) -> Result<StrategyOutcome> {
        let Some(user_idx) = self.graph.user_idx(user_id) else {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart));
        };
        let Some(profile) = self.build_profile(user_idx) else {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart));
        };

        let seen = self.graph.seen_items(user_idx);
        let mut scored: Vec<(Uuid, f32)> = Vec::new();
        for (idx, node) in self.graph.items_iter() {
            if seen.contains(&idx) {
                continue;
            }
            let Some(vector) = self.embeddings.vector(Namespace::Item, node.item_id) else {
                continue;
            };
            let similarity = cosine_similarity(&profile, &vector);
            scored.push((node.item_id, similarity));
        }
        if scored.is_empty() {
            return Ok(StrategyOutcome::Abstain(AbstainReason::NoCandidates));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(StrategyOutcome::Ranked(
            scored
                .into_iter()
                .take(k)
                .map(|(item_id, score)| Candidate {
                    item_id,
                    score,
                    source: StrategyKind::ContentBased,
                })
                .collect(),
        ))
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::ContentBased
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrustComponents;

    fn trust() -> TrustComponents {
        TrustComponents {
            source_reliability: 0.9,
            metadata_accuracy: 0.9,
            availability_confidence: 0.9,
            feedback_quality: 0.9,
            preference_confidence: 0.9,
            last_verified: Utc::now(),
        }
    }

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    fn setup() -> (Arc<InteractionGraph>, Arc<EmbeddingStore>, Uuid, Vec<Uuid>) {
        let dim = 8;
        let store = EmbeddingStore::new(dim);
        let mut graph = InteractionGraph::new();
        let items: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        // Item 0 and 1 share an axis, 2 and 3 live elsewhere.
        store.put(Namespace::Item, items[0], axis(dim, 0));
        store.put(Namespace::Item, items[1], axis(dim, 0));
        store.put(Namespace::Item, items[2], axis(dim, 3));
        store.put(Namespace::Item, items[3], axis(dim, 5));
        for &item in &items {
            graph.upsert_item(item, vec!["jazz".to_string()], trust(), 0.5);
        }

        let user = Uuid::new_v4();
        graph.record_interaction(user, items[0], 5.0, Utc::now());
        (Arc::new(graph), Arc::new(store), user, items)
    }

    #[tokio::test]
    async fn ranks_similar_items_first_and_excludes_seen() {
        let (graph, store, user, items) = setup();
        let config = crate::config::Config::default();
        let strategy = ContentBasedStrategy::new(graph, store, &config.strategies);

        let outcome = strategy.score(user, 3).await.unwrap();
        let StrategyOutcome::Ranked(candidates) = outcome else {
            panic!("expected ranking");
        };
        // The interacted item itself must not come back.
        assert!(candidates.iter().all(|c| c.item_id != items[0]));
        // The embedding twin ranks first.
        assert_eq!(candidates[0].item_id, items[1]);
        assert!(candidates[0].score > candidates[1].score);
    }

    #[tokio::test]
    async fn cold_start_abstains() {
        let (graph, store, _, _) = setup();
        let config = crate::config::Config::default();
        let strategy = ContentBasedStrategy::new(graph, store, &config.strategies);

        let outcome = strategy.score(Uuid::new_v4(), 3).await.unwrap();
        assert!(matches!(
            outcome,
            StrategyOutcome::Abstain(AbstainReason::ColdStart)
        ));
    }

    #[tokio::test]
    async fn genre_blend_prefers_tagged_axis() {
        let dim = 8;
        let store = EmbeddingStore::new(dim);
        let mut graph = InteractionGraph::new();
        let liked = Uuid::new_v4();
        let genre_match = Uuid::new_v4();
        let unrelated = Uuid::new_v4();
        store.put(Namespace::Item, liked, axis(dim, 0));
        store.put(Namespace::Item, genre_match, axis(dim, 2));
        store.put(Namespace::Item, unrelated, axis(dim, 5));
        store.put_taxonomy("jazz", axis(dim, 2));

        graph.upsert_item(liked, vec!["jazz".to_string()], trust(), 0.5);
        graph.upsert_item(genre_match, vec![], trust(), 0.5);
        graph.upsert_item(unrelated, vec![], trust(), 0.5);
        let user = Uuid::new_v4();
        graph.record_interaction(user, liked, 5.0, Utc::now());

        let config = crate::config::Config::default();
        let strategy =
            ContentBasedStrategy::new(Arc::new(graph), Arc::new(store), &config.strategies);
        let outcome = strategy.score(user, 2).await.unwrap();
        let StrategyOutcome::Ranked(candidates) = outcome else {
            panic!("expected ranking");
        };
        // 30% genre share pulls the tag-axis item above the unrelated one.
        assert_eq!(candidates[0].item_id, genre_match);
    }
}
