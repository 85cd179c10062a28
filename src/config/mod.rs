use serde::Deserialize;
use std::env;

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> T
where
    T::Err: std::fmt::Debug,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|e| panic!("{} must be a valid value: {:?}", key, e))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub fusion: FusionConfig,
    pub trust: TrustConfig,
    pub strategies: StrategyConfig,
    pub registry: RegistryConfig,
    pub federated: FederatedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// RRF smoothing constant.
    pub rrf_k: f32,
    pub collaborative_weight: f32,
    pub content_weight: f32,
    pub graph_weight: f32,
    /// Reserved share for the optional context strategy; renormalized away
    /// when absent.
    pub context_weight: f32,
    /// MMR relevance/diversity balance.
    pub mmr_lambda: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    pub threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Per-strategy timeout inside a scoring request (milliseconds).
    pub strategy_timeout_ms: u64,
    /// Whole-pipeline budget (milliseconds).
    pub request_budget_ms: u64,
    /// Below this many interactions the collaborative strategy abstains.
    pub min_interactions: usize,
    /// ALS hyperparameters.
    pub als_factors: usize,
    pub als_regularization: f32,
    pub als_max_epochs: usize,
    pub als_convergence_tol: f64,
    /// Content profile blend: history share vs genre-preference share.
    pub profile_history_weight: f32,
    /// Interaction decay half-life in days, applied at read time.
    pub decay_half_life_days: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// How long a retiring version is kept for in-flight readers (ms).
    pub retire_grace_ms: u64,
    /// Artifact store poll interval (ms).
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederatedConfig {
    /// Minimum client uploads for a round to aggregate.
    pub min_clients: usize,
    /// Cohort sampled per round.
    pub cohort_size: usize,
    /// Round collection deadline (ms).
    pub round_deadline_ms: u64,
    /// L2 clipping norm C.
    pub clip_norm: f32,
    /// Gaussian noise multiplier z.
    pub noise_multiplier: f32,
    /// Per-round privacy cost.
    pub round_epsilon: f64,
    pub round_delta: f64,
    /// Total budget ceiling; rounds halt once it would be exceeded.
    pub total_epsilon: f64,
    pub total_delta: f64,
    /// Server learning rate applied to the aggregated delta.
    pub server_learning_rate: f32,
    /// Cap on claimed sample counts during weighted averaging.
    pub max_claimed_samples: u64,
    /// Dimension of the flat federated model.
    pub model_dim: usize,
}

impl Config {
    pub fn from_env() -> Config {
        dotenv::dotenv().ok();

        Config {
            fusion: FusionConfig {
                rrf_k: env_parse("FUSION_RRF_K", "60.0"),
                collaborative_weight: env_parse("FUSION_COLLABORATIVE_WEIGHT", "0.35"),
                content_weight: env_parse("FUSION_CONTENT_WEIGHT", "0.25"),
                graph_weight: env_parse("FUSION_GRAPH_WEIGHT", "0.30"),
                context_weight: env_parse("FUSION_CONTEXT_WEIGHT", "0.10"),
                mmr_lambda: env_parse("FUSION_MMR_LAMBDA", "0.85"),
            },
            trust: TrustConfig {
                threshold: env_parse("TRUST_THRESHOLD", "0.6"),
            },
            strategies: StrategyConfig {
                strategy_timeout_ms: env_parse("STRATEGY_TIMEOUT_MS", "150"),
                request_budget_ms: env_parse("REQUEST_BUDGET_MS", "500"),
                min_interactions: env_parse("MIN_INTERACTIONS", "2"),
                als_factors: env_parse("ALS_FACTORS", "64"),
                als_regularization: env_parse("ALS_REGULARIZATION", "0.01"),
                als_max_epochs: env_parse("ALS_MAX_EPOCHS", "50"),
                als_convergence_tol: env_parse("ALS_CONVERGENCE_TOL", "0.0001"),
                profile_history_weight: env_parse("PROFILE_HISTORY_WEIGHT", "0.7"),
                decay_half_life_days: env_parse("DECAY_HALF_LIFE_DAYS", "30.0"),
            },
            registry: RegistryConfig {
                retire_grace_ms: env_parse("REGISTRY_RETIRE_GRACE_MS", "5000"),
                poll_interval_ms: env_parse("REGISTRY_POLL_INTERVAL_MS", "10000"),
            },
            federated: FederatedConfig {
                min_clients: env_parse("FED_MIN_CLIENTS", "1000"),
                cohort_size: env_parse("FED_COHORT_SIZE", "1200"),
                round_deadline_ms: env_parse("FED_ROUND_DEADLINE_MS", "30000"),
                clip_norm: env_parse("FED_CLIP_NORM", "1.0"),
                noise_multiplier: env_parse("FED_NOISE_MULTIPLIER", "1.1"),
                round_epsilon: env_parse("FED_ROUND_EPSILON", "1.0"),
                round_delta: env_parse("FED_ROUND_DELTA", "0.00001"),
                total_epsilon: env_parse("FED_TOTAL_EPSILON", "8.0"),
                total_delta: env_parse("FED_TOTAL_DELTA", "0.0001"),
                server_learning_rate: env_parse("FED_SERVER_LR", "1.0"),
                max_claimed_samples: env_parse("FED_MAX_CLAIMED_SAMPLES", "10000"),
                model_dim: env_parse("FED_MODEL_DIM", "512"),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fusion: FusionConfig {
                rrf_k: 60.0,
                collaborative_weight: 0.35,
                content_weight: 0.25,
                graph_weight: 0.30,
                context_weight: 0.10,
                mmr_lambda: 0.85,
            },
            trust: TrustConfig { threshold: 0.6 },
            strategies: StrategyConfig {
                strategy_timeout_ms: 150,
                request_budget_ms: 500,
                min_interactions: 2,
                als_factors: 64,
                als_regularization: 0.01,
                als_max_epochs: 50,
                als_convergence_tol: 1e-4,
                profile_history_weight: 0.7,
                decay_half_life_days: 30.0,
            },
            registry: RegistryConfig {
                retire_grace_ms: 5000,
                poll_interval_ms: 10000,
            },
            federated: FederatedConfig {
                min_clients: 1000,
                cohort_size: 1200,
                round_deadline_ms: 30000,
                clip_norm: 1.0,
                noise_multiplier: 1.1,
                round_epsilon: 1.0,
                round_delta: 1e-5,
                total_epsilon: 8.0,
                total_delta: 1e-4,
                server_learning_rate: 1.0,
                max_claimed_samples: 10000,
                model_dim: 512,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fusion_weights_sum_to_one() {
        let config = Config::default();
        let sum = config.fusion.collaborative_weight
            + config.fusion.content_weight
            + config.fusion.graph_weight
            + config.fusion.context_weight;
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
