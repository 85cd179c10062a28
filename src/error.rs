use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecError>;

/// Core error taxonomy.
///
/// Cold-start and per-strategy timeouts are NOT errors: they are recovered
/// inside the scoring pipeline as `StrategyOutcome::Abstain` / degraded
/// fusion and never surface to the caller. The variants here are either
/// operator-visible faults or per-message conditions isolated by the
/// federated round loop.
#[derive(Debug, Error)]
pub enum RecError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Privacy budget exhausted: {0}")]
    PrivacyBudgetExhausted(String),

    #[error("Aggregation quorum not met: received {received}, minimum {required}")]
    QuorumNotMet { received: usize, required: usize },

    #[error("Malformed client upload: {0}")]
    MalformedUpload(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RecError {
    fn from(err: anyhow::Error) -> Self {
        RecError::Internal(err.to_string())
    }
}

impl From<bincode::Error> for RecError {
    fn from(err: bincode::Error) -> Self {
        RecError::ModelLoad(format!("Parameter blob codec error: {}", err))
    }
}
