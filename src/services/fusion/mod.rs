//! Fusion engine: weighted reciprocal rank fusion over the strategy
//! rankings, followed by maximal-marginal-relevance diversity re-ranking.
//!
//! Abstaining strategies drop out and the remaining weights renormalize to
//! sum to 1; an item missing from one strategy's list simply collects no
//! contribution from it. All orderings break ties by item id so identical
//! inputs always fuse to the identical page.

use crate::config::FusionConfig;
use crate::graph::InteractionGraph;
use crate::models::{AbstainReason, StrategyKind, StrategyOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One fused candidate with per-strategy provenance.
#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub item_id: Uuid,
    pub fused_score: f32,
    /// Per-strategy RRF contribution (post-renormalization weights).
    pub contributions: HashMap<StrategyKind, f32>,
    /// Best (lowest) rank this item held in any contributing list.
    pub best_rank: usize,
    pub best_rank_source: StrategyKind,
}

pub struct FusionEngine {
    rrf_k: f32,
    weights: HashMap<StrategyKind, f32>,
    mmr_lambda: f32,
    graph: Arc<InteractionGraph>,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig, graph: Arc<InteractionGraph>) -> Self {
        let mut weights = HashMap::new();
        weights.insert(StrategyKind::Collaborative, config.collaborative_weight);
        weights.insert(StrategyKind::ContentBased, config.content_weight);
        weights.insert(StrategyKind::GraphNeural, config.graph_weight);
        Self {
            rrf_k: config.rrf_k,
            weights,
            mmr_lambda: config.mmr_lambda,
            graph,
        }
    }

    /// Weighted RRF merge of the strategy outcomes, sorted by fused score
    /// descending with item-id tie-breaking.
    pub fn fuse(&self, outcomes: &[(StrategyKind, StrategyOutcome)]) -> Vec<FusedCandidate> {
        let returned: Vec<&StrategyKind> = outcomes
            .iter()
            .filter_map(|(kind, outcome)| match outcome {
                StrategyOutcome::Ranked(list) if !list.is_empty() => Some(kind),
                _ => None,
            })
            .collect();
        if returned.is_empty() {
            return Vec::new();
        }

        // Renormalize the configured weights over the strategies that
        // actually returned a ranking.
        let weight_sum: f32 = returned
            .iter()
            .map(|kind| self.weights.get(kind).copied().unwrap_or(0.0))
            .sum();
        if weight_sum <= 0.0 {
            return Vec::new();
        }

        let mut fused: HashMap<Uuid, FusedCandidate> = HashMap::new();
        for (kind, outcome) in outcomes {
            let StrategyOutcome::Ranked(list) = outcome else {
                continue;
            };
            let weight = self.weights.get(kind).copied().unwrap_or(0.0) / weight_sum;
            if weight <= 0.0 {
                continue;
            }
            for (rank0, candidate) in list.iter().enumerate() {
                let rank = rank0 + 1;
                let contribution = weight / (self.rrf_k + rank as f32);
                let entry = fused
                    .entry(candidate.item_id)
                    .or_insert_with(|| FusedCandidate {
                        item_id: candidate.item_id,
                        fused_score: 0.0,
                        contributions: HashMap::new(),
                        best_rank: rank,
                        best_rank_source: *kind,
                    });
                entry.fused_score += contribution;
                *entry.contributions.entry(*kind).or_insert(0.0) += contribution;
                if rank < entry.best_rank {
                    entry.best_rank = rank;
                    entry.best_rank_source = *kind;
                }
            }
        }

        let mut merged: Vec<FusedCandidate> = fused.into_values().collect();
        merged.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        debug!(
            strategies = returned.len(),
            candidates = merged.len(),
            "RRF merge complete"
        );
        merged
    }

    /// Greedy MMR selection of up to `k` candidates. Relevance is the fused
    /// RRF score; redundancy is the maximum taxonomy-tag Jaccard overlap
    /// with anything already selected.
    pub fn rerank(&self, candidates: Vec<FusedCandidate>, k: usize) -> Vec<FusedCandidate> {
        let mut remaining = candidates;
        let mut selected: Vec<FusedCandidate> = Vec::with_capacity(k.min(remaining.len()));
        let mut selected_tags: Vec<HashSet<String>> = Vec::new();

        while selected.len() < k && !remaining.is_empty() {
            let mut best: Option<(usize, f32)> = None;
            for (i, candidate) in remaining.iter().enumerate() {
                let tags = self.tags_of(candidate.item_id);
                let max_similarity = selected_tags
                    .iter()
                    .map(|s| jaccard(&tags, s))
                    .fold(0.0f32, f32::max);
                let mmr = self.mmr_lambda * candidate.fused_score
                    - (1.0 - self.mmr_lambda) * max_similarity;
                let better = match best {
                    None => true,
                    Some((best_i, best_score)) => {
                        mmr > best_score
                            || (mmr == best_score
                                && candidate.item_id < remaining[best_i].item_id)
                    }
                };
                if better {
                    best = Some((i, mmr));
                }
            }
            let (idx, _) = best.expect("non-empty remaining");
            let chosen = remaining.swap_remove(idx);
            selected_tags.push(self.tags_of(chosen.item_id));
            selected.push(chosen);
        }
        selected
    }

    /// Full fuse + diversity pass. Also reports which strategies abstained,
    /// for logging and explanation provenance upstream.
    pub fn fuse_and_rerank(
        &self,
        outcomes: &[(StrategyKind, StrategyOutcome)],
        k: usize,
    ) -> Vec<FusedCandidate> {
        for (kind, outcome) in outcomes {
            if let StrategyOutcome::Abstain(reason) = outcome {
                debug!(
                    strategy = kind.as_str(),
                    reason = ?reason,
                    "Strategy abstained"
                );
            }
        }
        let fused = self.fuse(outcomes);
        self.rerank(fused, k)
    }

    fn tags_of(&self, item_id: Uuid) -> HashSet<String> {
        match self.graph.item_idx(item_id) {
            Some(idx) => self.graph.item(idx).tags.iter().cloned().collect(),
            None => HashSet::new(),
        }
    }
}

/// Jaccard overlap of two tag sets; empty sets share nothing.
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}
