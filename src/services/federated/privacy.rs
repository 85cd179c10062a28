//! Differential-privacy primitives: L2 clipping, Gaussian perturbation and
//! the cross-round budget accountant.
//!
//! The accountant uses the advanced composition bound, which grows faster
//! than linearly in the round count; once the configured total (ε, δ)
//! ceiling would be exceeded the coordinator halts as a terminal,
//! operator-visible condition.

use crate::config::FederatedConfig;
use crate::error::{RecError, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::info;

/// Clip a gradient to the given L2 norm in place. Returns the pre-clip
/// norm.
pub fn clip_l2(gradient: &mut [f32], clip_norm: f32) -> f32 {
    let norm = gradient.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > clip_norm && norm > 0.0 {
        let scale = clip_norm / norm;
        for g in gradient.iter_mut() {
            *g *= scale;
        }
    }
    norm
}

/// Gaussian mechanism scale: σ = C·z/n.
pub fn noise_sigma(clip_norm: f32, noise_multiplier: f32, min_clients: usize) -> f32 {
    clip_norm * noise_multiplier / min_clients.max(1) as f32
}

/// Perturb a clipped gradient with i.i.d. Gaussian noise of scale `sigma`.
pub fn add_gaussian_noise<R: Rng>(gradient: &mut [f32], sigma: f32, rng: &mut R) {
    if sigma <= 0.0 {
        return;
    }
    let normal = Normal::new(0.0f32, sigma).expect("sigma is positive and finite");
    for g in gradient.iter_mut() {
        *g += normal.sample(rng);
    }
}

/// Tracks cumulative privacy spend across applied rounds.
#[derive(Debug)]
pub struct PrivacyAccountant {
    round_epsilon: f64,
    round_delta: f64,
    total_epsilon: f64,
    total_delta: f64,
    rounds_applied: u32,
}

impl PrivacyAccountant {
    pub fn new(config: &FederatedConfig) -> Self {
        Self {
            round_epsilon: config.round_epsilon,
            round_delta: config.round_delta,
            total_epsilon: config.total_epsilon,
            total_delta: config.total_delta,
            rounds_applied: 0,
        }
    }

    /// Advanced composition over `t` rounds of an (ε, δ) mechanism, with
    /// slack δ' = total_delta / 2:
    /// ε(t) = ε·√(2t·ln(1/δ')) + t·ε·(e^ε − 1), δ(t) = t·δ + δ'.
    fn composed(&self, rounds: u32) -> (f64, f64) {
        let t = rounds as f64;
        let slack = self.total_delta / 2.0;
        let eps = self.round_epsilon * (2.0 * t * (1.0 / slack).ln()).sqrt()
            + t * self.round_epsilon * (self.round_epsilon.exp() - 1.0);
        let delta = t * self.round_delta + slack;
        (eps, delta)
    }

    /// Whether one more applied round stays inside the ceiling.
    pub fn can_afford_round(&self) -> bool {
        let (eps, delta) = self.composed(self.rounds_applied + 1);
        eps <= self.total_epsilon && delta <= self.total_delta
    }

    /// Reserve budget for starting a round. Terminal once exhausted.
    pub fn ensure_budget(&self) -> Result<()> {
        if self.can_afford_round() {
            Ok(())
        } else {
            let (eps, delta) = self.composed(self.rounds_applied + 1);
            Err(RecError::PrivacyBudgetExhausted(format!(
                "next round would compose to (ε={:.3}, δ={:.2e}) exceeding ceiling (ε={}, δ={:.2e})",
                eps, delta, self.total_epsilon, self.total_delta
            )))
        }
    }

    /// Record one applied round. Cancelled rounds release no noised data
    /// and must not be charged.
    pub fn charge_round(&mut self) {
        self.rounds_applied += 1;
        let (eps, delta) = self.composed(self.rounds_applied);
        info!(
            rounds = self.rounds_applied,
            consumed_epsilon = eps,
            consumed_delta = delta,
            "Privacy budget charged"
        );
    }

    pub fn rounds_applied(&self) -> u32 {
        self.rounds_applied
    }

    /// Current composed spend.
    pub fn consumed(&self) -> (f64, f64) {
        self.composed(self.rounds_applied)
    }
}
