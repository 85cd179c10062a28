mod collaborative;
mod content_based;
mod graph_neural;

use crate::error::Result;
use crate::models::{StrategyKind, StrategyOutcome};
use async_trait::async_trait;
use uuid::Uuid;

pub use collaborative::{AlsParameters, AlsTrainer, CollaborativeStrategy};
pub use content_based::ContentBasedStrategy;
pub use graph_neural::{GnnParameters, GnnTrainer, GraphNeuralStrategy};

/// Uniform scoring capability over the closed strategy set. Each strategy
/// returns a ranked candidate list or abstains; abstention is an expected
/// outcome the fusion engine handles, never an error.
#[async_trait]
pub trait ScoringStrategy: Send + Sync {
    async fn score(&self, user_id: Uuid, k: usize) -> Result<StrategyOutcome>;
    fn kind(&self) -> StrategyKind;
}
