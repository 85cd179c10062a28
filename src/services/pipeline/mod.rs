//! Scoring pipeline: the request-path orchestrator.
//!
//! Strategies run in parallel, each under its own timeout; a late or
//! failing strategy is degraded to an abstention so the page is still fused
//! from whatever returned in time. The response carries `partial: true`
//! whenever anything was degraded. Trust filtering and explanations run on
//! the fused page only.

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    AbstainReason, Recommendation, ScoringRequest, ScoringResponse, StrategyKind, StrategyOutcome,
};
use crate::services::explanation::ExplanationGenerator;
use crate::services::fusion::FusionEngine;
use crate::services::strategies::ScoringStrategy;
use crate::services::trust::TrustFilter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

/// Per-strategy over-fetch multiplier so MMR and the trust filter have
/// enough candidates to displace near-duplicates and low-trust items.
const FETCH_MULTIPLIER: usize = 3;

pub struct ScoringPipeline {
    strategies: Vec<Arc<dyn ScoringStrategy>>,
    fusion: FusionEngine,
    trust: TrustFilter,
    explanations: ExplanationGenerator,
    strategy_timeout: Duration,
    request_budget: Duration,
}

impl ScoringPipeline {
    pub fn new(
        strategies: Vec<Arc<dyn ScoringStrategy>>,
        fusion: FusionEngine,
        trust: TrustFilter,
        explanations: ExplanationGenerator,
        config: &Config,
    ) -> Self {
        Self {
            strategies,
            fusion,
            trust,
            explanations,
            strategy_timeout: Duration::from_millis(config.strategies.strategy_timeout_ms),
            request_budget: Duration::from_millis(config.strategies.request_budget_ms),
        }
    }

    /// Serve one scoring request end to end.
    pub async fn score(&self, request: &ScoringRequest) -> Result<ScoringResponse> {
        let fetch_k = request.k.saturating_mul(FETCH_MULTIPLIER).max(request.k);

        // The budget is a hard deadline on collection, not on the strategies
        // themselves: outcomes that settled before expiry are kept and only
        // the stragglers degrade to abstentions.
        let deadline = Instant::now() + self.request_budget;
        let (outcomes, partial) = self.gather(request, fetch_k, deadline).await;

        let page = self.fusion.fuse_and_rerank(&outcomes, request.k);
        let trusted = self.trust.filter(page);

        let items: Vec<Recommendation> = trusted
            .into_iter()
            .map(|selected| {
                let explanation = self.explanations.explain(request.user_id, &selected);
                let strategy_contributions: HashMap<String, f32> = selected
                    .candidate
                    .contributions
                    .iter()
                    .map(|(kind, share)| (kind.as_str().to_string(), *share))
                    .collect();
                Recommendation {
                    item_id: selected.candidate.item_id,
                    score: selected.candidate.fused_score,
                    trust_score: selected.trust_score,
                    explanation,
                    strategy_contributions,
                    low_confidence: selected.low_confidence,
                }
            })
            .collect();

        info!(
            user_id = %request.user_id,
            requested = request.k,
            returned = items.len(),
            partial,
            "Scoring request served"
        );
        Ok(ScoringResponse { items, partial })
    }

    /// Run all strategies concurrently under the per-strategy timeout and
    /// the request deadline. Returns outcomes plus whether anything was
    /// degraded to an abstention.
    async fn gather(
        &self,
        request: &ScoringRequest,
        fetch_k: usize,
        deadline: Instant,
    ) -> (Vec<(StrategyKind, StrategyOutcome)>, bool) {
        let mut handles = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let strategy = Arc::clone(strategy);
            let user_id = request.user_id;
            let per_strategy = self.strategy_timeout;
            let kind = strategy.kind();
            handles.push((
                kind,
                tokio::spawn(async move {
                    timeout(per_strategy, strategy.score(user_id, fetch_k)).await
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut degraded = false;
        for (kind, mut handle) in handles {
            let outcome = match timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(Ok(outcome)))) => outcome,
                Ok(Ok(Ok(Err(e)))) => {
                    warn!(strategy = kind.as_str(), error = %e, "Strategy failed; degrading");
                    degraded = true;
                    StrategyOutcome::Abstain(AbstainReason::NoCandidates)
                }
                Ok(Ok(Err(_elapsed))) => {
                    warn!(strategy = kind.as_str(), "Strategy timed out; degrading");
                    degraded = true;
                    StrategyOutcome::Abstain(AbstainReason::NoCandidates)
                }
                Ok(Err(join_error)) => {
                    warn!(strategy = kind.as_str(), error = %join_error, "Strategy task aborted");
                    degraded = true;
                    StrategyOutcome::Abstain(AbstainReason::NoCandidates)
                }
                Err(_elapsed) => {
                    handle.abort();
                    warn!(strategy = kind.as_str(), "Request budget exhausted; degrading");
                    degraded = true;
                    StrategyOutcome::Abstain(AbstainReason::NoCandidates)
                }
            };
            outcomes.push((kind, outcome));
        }
        (outcomes, degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InteractionGraph;
    use crate::models::{Candidate, TrustComponents};
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct FixedStrategy {
        kind: StrategyKind,
        items: Vec<Uuid>,
        delay: Duration,
    }

    #[async_trait]
    impl ScoringStrategy for FixedStrategy {
        async fn score(&self, _user_id: Uuid, k: usize) -> Result<StrategyOutcome> {
            tokio::time::sleep(self.delay).await;
            Ok(StrategyOutcome::Ranked(
                self.items
                    .iter()
                    .take(k)
                    .enumerate()
                    .map(|(i, &item_id)| Candidate {
                        item_id,
                        score: 1.0 - i as f32 * 0.1,
                        source: self.kind,
                    })
                    .collect(),
            ))
        }

        fn kind(&self) -> StrategyKind {
            self.kind
        }
    }

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

    fn pipeline_over(
        items: &[Uuid],
        strategies: Vec<Arc<dyn ScoringStrategy>>,
        config: &Config,
    ) -> ScoringPipeline {
        let mut graph = InteractionGraph::new();
        for &item in items {
            graph.upsert_item(item, vec![], trust(), 0.5);
        }
        let graph = Arc::new(graph);
        ScoringPipeline::new(
            strategies,
            FusionEngine::new(&config.fusion, Arc::clone(&graph)),
            TrustFilter::new(&config.trust, Arc::clone(&graph)),
            ExplanationGenerator::new(graph),
            config,
        )
    }

    #[tokio::test]
    async fn fuses_parallel_strategies() {
        let items: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let config = Config::default();
        let strategies: Vec<Arc<dyn ScoringStrategy>> = vec![
            Arc::new(FixedStrategy {
                kind: StrategyKind::Collaborative,
                items: items.clone(),
                delay: Duration::from_millis(0),
            }),
            Arc::new(FixedStrategy {
                kind: StrategyKind::ContentBased,
                items: items.clone(),
                delay: Duration::from_millis(0),
            }),
        ];
        let pipeline = pipeline_over(&items, strategies, &config);

        let response = pipeline
            .score(&ScoringRequest {
                user_id: Uuid::new_v4(),
                context: None,
                k: 3,
            })
            .await
            .unwrap();
        assert!(!response.partial);
        assert_eq!(response.items.len(), 3);
        assert!(response.items.iter().all(|r| !r.explanation.is_empty()));
        assert!(response
            .items
            .iter()
            .all(|r| !r.strategy_contributions.is_empty()));
    }

    #[tokio::test]
    async fn slow_strategy_degrades_to_partial() {
        let items: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut config = Config::default();
        config.strategies.strategy_timeout_ms = 20;
        let strategies: Vec<Arc<dyn ScoringStrategy>> = vec![
            Arc::new(FixedStrategy {
                kind: StrategyKind::Collaborative,
                items: items.clone(),
                delay: Duration::from_millis(0),
            }),
            Arc::new(FixedStrategy {
                kind: StrategyKind::GraphNeural,
                items: items.clone(),
                delay: Duration::from_millis(200),
            }),
        ];
        let pipeline = pipeline_over(&items, strategies, &config);

        let response = pipeline
            .score(&ScoringRequest {
                user_id: Uuid::new_v4(),
                context: None,
                k: 3,
            })
            .await
            .unwrap();
        // The fast strategy still fills the page.
        assert!(response.partial);
        assert!(!response.items.is_empty());
    }

    #[tokio::test]
    async fn budget_expiry_keeps_settled_outcomes() {
        let items: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut config = Config::default();
        // Per-strategy timeout far beyond the budget: only the request
        // deadline can cut the slow strategy off.
        config.strategies.strategy_timeout_ms = 1_000;
        config.strategies.request_budget_ms = 50;
        let strategies: Vec<Arc<dyn ScoringStrategy>> = vec![
            Arc::new(FixedStrategy {
                kind: StrategyKind::Collaborative,
                items: items.clone(),
                delay: Duration::from_millis(0),
            }),
            Arc::new(FixedStrategy {
                kind: StrategyKind::ContentBased,
                items: items.clone(),
                delay: Duration::from_millis(400),
            }),
        ];
        let pipeline = pipeline_over(&items, strategies, &config);

        let response = pipeline
            .score(&ScoringRequest {
                user_id: Uuid::new_v4(),
                context: None,
                k: 3,
            })
            .await
            .unwrap();
        assert!(response.partial);
        assert!(
            !response.items.is_empty(),
            "the fast strategy's page survives budget expiry"
        );
        assert!(response
            .items
            .iter()
            .all(|r| r.strategy_contributions.contains_key("collaborative")));
    }

    #[tokio::test]
    async fn all_abstain_yields_empty_page() {
        struct Abstainer;
        #[async_trait]
        impl ScoringStrategy for Abstainer {
            async fn score(&self, _user_id: Uuid, _k: usize) -> Result<StrategyOutcome> {
                Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart))
            }
            fn kind(&self) -> StrategyKind {
                StrategyKind::Collaborative
            }
        }
        let config = Config::default();
        let pipeline = pipeline_over(&[], vec![Arc::new(Abstainer)], &config);
        let response = pipeline
            .score(&ScoringRequest {
                user_id: Uuid::new_v4(),
                context: None,
                k: 5,
            })
            .await
            .unwrap();
        assert!(response.items.is_empty());
        assert!(!response.partial);
    }
}
