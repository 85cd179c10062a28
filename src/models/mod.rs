use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Shared embedding dimension for users, items and taxonomy nodes.
pub const EMBEDDING_DIM: usize = 512;

/// The three scoring strategies fused by the pipeline. Closed set: fusion
/// stays strategy-agnostic without open-ended dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Collaborative,
    ContentBased,
    GraphNeural,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Collaborative => "collaborative",
            StrategyKind::ContentBased => "content_based",
            StrategyKind::GraphNeural => "graph_neural",
        }
    }

    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Collaborative,
        StrategyKind::ContentBased,
        StrategyKind::GraphNeural,
    ];

    /// Inverse of `as_str`, for resolving artifact names to serving slots.
    /// Artifacts under other names (e.g. the federated preference model)
    /// have no slot and are never activated by the registry.
    pub fn from_name(name: &str) -> Option<StrategyKind> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

/// One strategy's scored candidate. Rank is implied by list position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub item_id: Uuid,
    pub score: f32,
    pub source: StrategyKind,
}

/// Why a strategy produced no ranking. Not an error: the fusion engine
/// renormalizes remaining weights over the strategies that did return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstainReason {
    /// Insufficient history for this user.
    ColdStart,
    /// The strategy ran but found nothing to rank.
    NoCandidates,
    /// No model version is active for this strategy.
    ModelUnavailable,
}

/// Explicit outcome variants instead of exception-style control flow.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    Ranked(Vec<Candidate>),
    Abstain(AbstainReason),
}

/// Scoring request from the presentation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRequest {
    pub user_id: Uuid,
    pub context: Option<String>,
    pub k: usize,
}

/// One selected item in the response page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub item_id: Uuid,
    pub score: f32,
    pub trust_score: f32,
    pub explanation: String,
    /// Per-strategy RRF contribution to the fused score.
    pub strategy_contributions: HashMap<String, f32>,
    /// Set when this item survived only via the all-below-threshold
    /// fallback of the trust filter.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResponse {
    pub items: Vec<Recommendation>,
    /// True when a strategy timed out or the request budget expired and the
    /// page was fused from partial inputs.
    pub partial: bool,
}

/// Trust metadata supplied by the ingestion collaborator per item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrustComponents {
    pub source_reliability: f32,
    pub metadata_accuracy: f32,
    pub availability_confidence: f32,
    pub feedback_quality: f32,
    pub preference_confidence: f32,
    pub last_verified: DateTime<Utc>,
}

impl TrustComponents {
    /// Composite trust before decay: fixed component weighting.
    pub fn base_score(&self) -> f32 {
        0.25 * self.source_reliability
            + 0.25 * self.metadata_accuracy
            + 0.20 * self.availability_confidence
            + 0.15 * self.feedback_quality
            + 0.15 * self.preference_confidence
    }

    /// trust(t) = base × (1 − 0.01 × days_since_verification), floored at 0.
    pub fn score_at(&self, now: DateTime<Utc>) -> f32 {
        let days = (now - self.last_verified).num_days().max(0) as f32;
        let decay = (1.0 - 0.01 * days).max(0.0);
        (self.base_score() * decay).clamp(0.0, 1.0)
    }
}

/// Immutable training metrics recorded on every published artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub final_loss: f32,
    pub epochs_run: u32,
    pub sample_count: u64,
    pub validation_loss: Option<f32>,
}

/// Versioned, immutable model parameters. Owned by the artifact store /
/// registry; strategies hold `Arc` snapshots of the decoded form only.
/// `name` matches a `StrategyKind` for servable models; the federated
/// preference model is stored under its own name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: u64,
    /// bincode-encoded `ModelParameters`.
    pub blob: Vec<u8>,
    pub metrics: TrainingMetrics,
    pub created_at: DateTime<Utc>,
}

/// Typed form of an artifact's parameter blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelParameters {
    Als(crate::services::strategies::AlsParameters),
    Gnn(crate::services::strategies::GnnParameters),
    /// Flat parameter vector used by the federated global model.
    Flat(Vec<f32>),
}

/// Federated round kickoff sent to sampled cohort members.
#[derive(Debug, Clone)]
pub struct RoundInit {
    pub round_id: u64,
    pub model_version: u64,
    pub cohort_size: usize,
    pub deadline: DateTime<Utc>,
}

/// Encrypted, masked client update for one round. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct ClientUpload {
    pub round_id: u64,
    pub client_id: Uuid,
    /// AES-256-GCM ciphertext of the bincode-encoded masked update.
    pub encrypted_payload: crate::services::federated::SealedPayload,
    pub claimed_sample_count: u64,
}

/// Outcome of a completed (applied) federated round.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub new_version: u64,
    pub metrics: TrainingMetrics,
}
