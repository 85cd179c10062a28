//! Trust filter: drops fused candidates whose decayed composite trust falls
//! below the configured threshold.
//!
//! When every candidate fails the threshold the filter degrades instead of
//! returning an empty page: the single highest-trust candidate survives,
//! flagged low-confidence for the caller.

use crate::config::TrustConfig;
use crate::graph::InteractionGraph;
use crate::services::fusion::FusedCandidate;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A candidate that survived trust filtering.
#[derive(Debug, Clone)]
pub struct TrustedCandidate {
    pub candidate: FusedCandidate,
    pub trust_score: f32,
    pub low_confidence: bool,
}

pub struct TrustFilter {
    threshold: f32,
    graph: Arc<InteractionGraph>,
}

impl TrustFilter {
    pub fn new(config: &TrustConfig, graph: Arc<InteractionGraph>) -> Self {
        Self {
            threshold: config.threshold,
            graph,
        }
    }

    /// Decayed composite trust for an item at `now`. Items the graph does
    /// not know score 0 and never pass the threshold.
    pub fn trust_of(&self, item_id: Uuid, now: DateTime<Utc>) -> f32 {
        match self.graph.item_idx(item_id) {
            Some(idx) => self.graph.item(idx).trust.score_at(now),
            None => 0.0,
        }
    }

    /// Filter a fused page, preserving its order. Never returns an empty
    /// list for a non-empty input.
    pub fn filter(&self, candidates: Vec<FusedCandidate>) -> Vec<TrustedCandidate> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        let scored: Vec<(FusedCandidate, f32)> = candidates
            .into_iter()
            .map(|c| {
                let trust = self.trust_of(c.item_id, now);
                (c, trust)
            })
            .collect();

        let passing: Vec<TrustedCandidate> = scored
            .iter()
            .filter(|(_, trust)| *trust >= self.threshold)
            .map(|(c, trust)| TrustedCandidate {
                candidate: c.clone(),
                trust_score: *trust,
                low_confidence: false,
            })
            .collect();
        if !passing.is_empty() {
            return passing;
        }

        // All below threshold: degrade to the single most trustworthy
        // candidate rather than an empty page. Ties break by item id.
        let best = scored
            .into_iter()
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.0.item_id.cmp(&a.0.item_id))
            })
            .expect("non-empty input");
        debug!(
            item_id = %best.0.item_id,
            trust = best.1,
            threshold = self.threshold,
            "All candidates below trust threshold; degrading to best single item"
        );
        vec![TrustedCandidate {
            candidate: best.0,
            trust_score: best.1,
            low_confidence: true,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StrategyKind, TrustComponents};
    use chrono::Duration;
    use std::collections::HashMap;

    fn trust_with(base: f32, verified: DateTime<Utc>) -> TrustComponents {
        TrustComponents {
            source_reliability: base,
            metadata_accuracy: base,
            availability_confidence: base,
            feedback_quality: base,
            preference_confidence: base,
            last_verified: verified,
        }
    }

    fn fused(item_id: Uuid) -> FusedCandidate {
        FusedCandidate {
            item_id,
            fused_score: 0.5,
            contributions: HashMap::new(),
            best_rank: 1,
            best_rank_source: StrategyKind::Collaborative,
        }
    }

    fn filter_over(items: &[(Uuid, f32, i64)]) -> TrustFilter {
        let mut graph = InteractionGraph::new();
        for &(id, base, age_days) in items {
            graph.upsert_item(
                id,
                vec![],
                trust_with(base, Utc::now() - Duration::days(age_days)),
                0.5,
            );
        }
        let config = crate::config::Config::default();
        TrustFilter::new(&config.trust, Arc::new(graph))
    }

    #[test]
    fn passes_trusted_drops_untrusted() {
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        let filter = filter_over(&[(good, 0.9, 0), (bad, 0.3, 0)]);

        let out = filter.filter(vec![fused(bad), fused(good)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].candidate.item_id, good);
        assert!(!out[0].low_confidence);
    }

    #[test]
    fn stale_verification_decays_below_threshold() {
        let item = Uuid::new_v4();
        // Base 0.9 but verified 60 days ago: 0.9 × 0.4 = 0.36 < 0.6.
        let filter = filter_over(&[(item, 0.9, 60)]);
        let out = filter.filter(vec![fused(item)]);
        assert!(out[0].low_confidence);
        assert!(out[0].trust_score < 0.6);
    }

    #[test]
    fn all_low_trust_degrades_to_single_flagged_item() {
        let items: Vec<(Uuid, f32, i64)> = (0..10)
            .map(|i| (Uuid::new_v4(), 0.1 + 0.03 * i as f32, 0))
            .collect();
        let filter = filter_over(&items);
        let page: Vec<FusedCandidate> = items.iter().map(|&(id, _, _)| fused(id)).collect();

        let out = filter.filter(page);
        assert_eq!(out.len(), 1, "exactly one item survives");
        assert!(out[0].low_confidence);
        // The survivor is the highest-trust candidate.
        assert_eq!(out[0].candidate.item_id, items[9].0);
    }

    #[test]
    fn unknown_item_scores_zero_trust() {
        let known = Uuid::new_v4();
        let filter = filter_over(&[(known, 0.9, 0)]);
        assert_eq!(filter.trust_of(Uuid::new_v4(), Utc::now()), 0.0);
    }
}
