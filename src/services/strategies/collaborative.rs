//! Collaborative strategy: alternating least squares on implicit feedback.
//!
//! Training alternately fixes one factor matrix and solves a regularized
//! normal equation per user/item. Users and items with zero interactions
//! are skipped entirely and surface as cold-start at serving time. A
//! degenerate solve (non-finite factors despite regularization) makes the
//! strategy fall back to popularity ranking instead of emitting NaN scores.

use super::ScoringStrategy;
use crate::config::StrategyConfig;
use crate::error::Result;
use crate::graph::InteractionGraph;
use crate::models::{
    AbstainReason, Candidate, ModelParameters, StrategyKind, StrategyOutcome, TrainingMetrics,
};
use crate::services::registry::ModelRegistry;
use async_trait::async_trait;
use chrono::Utc;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Trained matrix-factorization parameters. Users/items absent from these
/// maps had no interactions at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlsParameters {
    pub factors: usize,
    pub user_factors: HashMap<Uuid, Vec<f32>>,
    pub item_factors: HashMap<Uuid, Vec<f32>>,
}

impl AlsParameters {
    pub fn predict(&self, user_id: Uuid, item_id: Uuid) -> Option<f32> {
        let u = self.user_factors.get(&user_id)?;
        let v = self.item_factors.get(&item_id)?;
        Some(u.iter().zip(v.iter()).map(|(a, b)| a * b).sum())
    }
}

pub struct AlsTrainer {
    factors: usize,
    regularization: f32,
    max_epochs: usize,
    convergence_tol: f64,
    half_life_days: f32,
}

impl AlsTrainer {
    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            factors: config.als_factors,
            regularization: config.als_regularization,
            max_epochs: config.als_max_epochs,
            convergence_tol: config.als_convergence_tol,
            half_life_days: config.decay_half_life_days,
        }
    }

    /// Train on the observed (decayed) interaction matrix.
    pub fn train(&self, graph: &InteractionGraph) -> (AlsParameters, TrainingMetrics) {
        let now = Utc::now();
        let n_users = graph.user_count();
        let n_items = graph.item_count();

        // Observed ratings per side; zero-interaction rows stay empty and
        // their factors are never solved.
        let mut by_user: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n_users];
        let mut by_item: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n_items];
        let mut samples = 0u64;
        for u in 0..n_users {
            for edge in graph.user_interactions(u as u32) {
                let r = edge.decayed_weight(now, self.half_life_days);
                by_user[u].push((edge.to as usize, r));
                by_item[edge.to as usize].push((u, r));
                samples += 1;
            }
        }

        let mut rng = StdRng::seed_from_u64(42);
        let scale = 1.0 / (self.factors as f32).sqrt();
        let mut user_f: Vec<Array1<f64>> = (0..n_users)
            .map(|_| random_factors(&mut rng, self.factors, scale))
            .collect();
        let mut item_f: Vec<Array1<f64>> = (0..n_items)
            .map(|_| random_factors(&mut rng, self.factors, scale))
            .collect();

        let lambda = self.regularization as f64;
        let mut previous_loss = f64::MAX;
        let mut final_loss = f64::MAX;
        let mut epochs_run = 0;

        for epoch in 0..self.max_epochs {
            solve_side(&by_user, &item_f, &mut user_f, self.factors, lambda);
            solve_side(&by_item, &user_f, &mut item_f, self.factors, lambda);

            let loss = self.loss(&by_user, &user_f, &item_f, lambda);
            epochs_run = epoch + 1;
            final_loss = loss;
            if (previous_loss - loss).abs() < self.convergence_tol {
                break;
            }
            previous_loss = loss;
        }

        let mut user_factors = HashMap::new();
        for (u, factors) in user_f.iter().enumerate() {
            if !by_user[u].is_empty() {
                user_factors.insert(
                    graph.user(u as u32).user_id,
                    factors.iter().map(|&x| x as f32).collect(),
                );
            }
        }
        let mut item_factors = HashMap::new();
        for (i, factors) in item_f.iter().enumerate() {
            if !by_item[i].is_empty() {
                item_factors.insert(
                    graph.item_id(i as u32),
                    factors.iter().map(|&x| x as f32).collect(),
                );
            }
        }

        info!(
            users = user_factors.len(),
            items = item_factors.len(),
            epochs = epochs_run,
            loss = final_loss,
            "ALS training finished"
        );

        (
            AlsParameters {
                factors: self.factors,
                user_factors,
                item_factors,
            },
            TrainingMetrics {
                final_loss: final_loss as f32,
                epochs_run: epochs_run as u32,
                sample_count: samples,
                validation_loss: None,
            },
        )
    }

    fn loss(
        &self,
        by_user: &[Vec<(usize, f32)>],
        user_f: &[Array1<f64>],
        item_f: &[Array1<f64>],
        lambda: f64,
    ) -> f64 {
        let mut loss = 0.0;
        for (u, ratings) in by_user.iter().enumerate() {
            for &(i, r) in ratings {
                let pred = user_f[u].dot(&item_f[i]);
                loss += (r as f64 - pred).powi(2);
            }
            if !ratings.is_empty() {
                loss += lambda * user_f[u].dot(&user_f[u]);
            }
        }
        for (i, factors) in item_f.iter().enumerate() {
            let _ = i;
            loss += lambda * factors.dot(factors);
        }
        loss
    }
}

fn random_factors(rng: &mut StdRng, k: usize, scale: f32) -> Array1<f64> {
    Array1::from_iter((0..k).map(|_| (rng.gen::<f32>() * scale) as f64))
}

/// Solve the regularized normal equations for every row on one side,
/// holding the other side fixed. Rows with no observations are skipped.
fn solve_side(
    observed: &[Vec<(usize, f32)>],
    fixed: &[Array1<f64>],
    target: &mut [Array1<f64>],
    k: usize,
    lambda: f64,
) {
    for (row, ratings) in observed.iter().enumerate() {
        if ratings.is_empty() {
            continue;
        }
        let mut a = Array2::<f64>::eye(k) * lambda;
        let mut b = Array1::<f64>::zeros(k);
        for &(other, r) in ratings {
            let v = &fixed[other];
            for p in 0..k {
                b[p] += r as f64 * v[p];
                for q in 0..k {
                    a[[p, q]] += v[p] * v[q];
                }
            }
        }
        match cholesky_solve(&a, &b) {
            Some(x) => target[row] = x,
            None => {
                // λ should have regularized this away; keep the previous
                // factors rather than propagating a singular solve.
                warn!(row, "Singular normal-equation matrix, factors left unchanged");
            }
        }
    }
}

/// Cholesky factorization solve for a symmetric positive-definite system.
/// Returns `None` when the matrix is not positive definite.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for p in 0..j {
                sum -= l[[i, p]] * l[[j, p]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    // Forward substitution: L y = b.
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for p in 0..i {
            sum -= l[[i, p]] * y[p];
        }
        y[i] = sum / l[[i, i]];
    }
    // Back substitution: Lᵀ x = y.
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for p in (i + 1)..n {
            sum -= l[[p, i]] * x[p];
        }
        x[i] = sum / l[[i, i]];
    }
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(x)
}

pub struct CollaborativeStrategy {
    graph: Arc<InteractionGraph>,
    registry: Arc<ModelRegistry>,
    min_interactions: usize,
}

impl CollaborativeStrategy {
    pub fn new(
        graph: Arc<InteractionGraph>,
        registry: Arc<ModelRegistry>,
        config: &StrategyConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            min_interactions: config.min_interactions,
        }
    }

    fn popularity_fallback(&self, user_idx: u32, k: usize) -> StrategyOutcome {
        let seen = self.graph.seen_items(user_idx);
        let ranked = self.graph.popularity_ranking(k, &seen);
        if ranked.is_empty() {
            return StrategyOutcome::Abstain(AbstainReason::NoCandidates);
        }
        let candidates = ranked
            .into_iter()
            .map(|idx| Candidate {
                item_id: self.graph.item_id(idx),
                score: self.graph.item(idx).popularity,
                source: StrategyKind::Collaborative,
            })
            .collect();
        StrategyOutcome::Ranked(candidates)
    }
}

#[async_trait]
impl ScoringStrategy for CollaborativeStrategy {
    async fn score(&self, user_id: Uuid, k: usize) -> Result<StrategyOutcome> {
        let Some(user_idx) = self.graph.user_idx(user_id) else {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart));
        };
        if self.graph.user(user_idx).window.len() < self.min_interactions {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart));
        }

        let Some(model) = self.registry.current(StrategyKind::Collaborative) else {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ModelUnavailable));
        };
        let ModelParameters::Als(ref params) = *model.params else {
            return Ok(StrategyOutcome::Abstain(AbstainReason::ModelUnavailable));
        };

        let Some(user_vec) = params.user_factors.get(&user_id) else {
            // Interacted since the model was trained: cold start for CF.
            return Ok(StrategyOutcome::Abstain(AbstainReason::ColdStart));
        };
        if user_vec.iter().any(|x| !x.is_finite()) {
            warn!(user_id = %user_id, "Non-finite user factors, using popularity fallback");
            return Ok(self.popularity_fallback(user_idx, k));
        }

        let seen = self.graph.seen_items(user_idx);
        let mut scored: Vec<(Uuid, f32)> = Vec::new();
        let mut degenerate = false;
        for (idx, node) in self.graph.items_iter() {
            if seen.contains(&idx) {
                continue;
            }
            let Some(item_vec) = params.item_factors.get(&node.item_id) else {
                continue; // zero-interaction item: cold start by definition
            };
            let score: f32 = user_vec
                .iter()
                .zip(item_vec.iter())
                .map(|(a, b)| a * b)
                .sum();
            if !score.is_finite() {
                degenerate = true;
                break;
            }
            scored.push((node.item_id, score));
        }
        if degenerate {
            warn!(user_id = %user_id, "Non-finite affinity score, using popularity fallback");
            return Ok(self.popularity_fallback(user_idx, k));
        }
        if scored.is_empty() {
            return Ok(StrategyOutcome::Abstain(AbstainReason::NoCandidates));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let candidates = scored
            .into_iter()
            .take(k)
            .map(|(item_id, score)| Candidate {
                item_id,
                score,
                source: StrategyKind::Collaborative,
            })
            .collect();
        Ok(StrategyOutcome::Ranked(candidates))
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Collaborative
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrustComponents;
    use chrono::Utc;

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

    fn small_graph() -> (InteractionGraph, Vec<Uuid>, Vec<Uuid>) {
        let mut graph = InteractionGraph::new();
        let users: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let items: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for &item in &items {
            graph.upsert_item(item, vec![], trust(), 0.5);
        }
        let now = Utc::now();
        // Two taste clusters.
        for &u in &users[..2] {
            for &i in &items[..3] {
                graph.record_interaction(u, i, 5.0, now);
            }
        }
        for &u in &users[2..] {
            for &i in &items[3..] {
                graph.record_interaction(u, i, 5.0, now);
            }
        }
        (graph, users, items)
    }

    fn trainer() -> AlsTrainer {
        AlsTrainer {
            factors: 8,
            regularization: 0.01,
            max_epochs: 50,
            convergence_tol: 1e-4,
            half_life_days: 30.0,
        }
    }

    #[test]
    fn als_converges_and_fits_observed_entries() {
        let (graph, users, items) = small_graph();
        let (params, metrics) = trainer().train(&graph);

        assert!(metrics.final_loss.is_finite());
        assert!(metrics.epochs_run >= 1);
        assert_eq!(params.user_factors.len(), 4);
        assert_eq!(params.item_factors.len(), 6);

        // Observed entry should be predicted close to its rating weight.
        let pred = params.predict(users[0], items[0]).unwrap();
        assert!(pred.is_finite());
        assert!(pred > 0.5, "observed positive entry underfit: {}", pred);
    }

    #[test]
    fn zero_interaction_rows_are_skipped() {
        let (mut graph, _, _) = small_graph();
        let orphan_user = Uuid::new_v4();
        let orphan_item = Uuid::new_v4();
        graph.upsert_user(orphan_user);
        graph.upsert_item(orphan_item, vec![], trust(), 0.1);

        let (params, _) = trainer().train(&graph);
        assert!(!params.user_factors.contains_key(&orphan_user));
        assert!(!params.item_factors.contains_key(&orphan_item));
    }

    #[test]
    fn cholesky_solves_spd_system() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let b = ndarray::arr1(&[2.0, 1.0]);
        let x = cholesky_solve(&a, &b).unwrap();
        // Verify A x == b.
        let r0 = 4.0 * x[0] + 2.0 * x[1];
        let r1 = 2.0 * x[0] + 3.0 * x[1];
        assert!((r0 - 2.0).abs() < 1e-9);
        assert!((r1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cholesky_rejects_singular() {
        let a = ndarray::arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        let b = ndarray::arr1(&[1.0, 1.0]);
        assert!(cholesky_solve(&a, &b).is_none());
    }

    #[tokio::test]
    async fn single_interaction_user_abstains() {
        let (mut graph, _, items) = small_graph();
        let sparse_user = Uuid::new_v4();
        graph.record_interaction(sparse_user, items[0], 5.0, Utc::now());

        let (params, metrics) = trainer().train(&graph);
        let registry = Arc::new(ModelRegistry::new(std::time::Duration::from_millis(10)));
        let artifact = crate::models::ModelArtifact {
            name: StrategyKind::Collaborative.as_str().to_string(),
            version: 1,
            blob: bincode::serialize(&ModelParameters::Als(params)).unwrap(),
            metrics,
            created_at: Utc::now(),
        };
        registry.activate(&artifact).unwrap();

        let config = crate::config::Config::default();
        let strategy =
            CollaborativeStrategy::new(Arc::new(graph), registry, &config.strategies);
        let outcome = strategy.score(sparse_user, 5).await.unwrap();
        assert!(matches!(
            outcome,
            StrategyOutcome::Abstain(AbstainReason::ColdStart)
        ));
    }
}
