//! Privacy-preserving federated training: differential-privacy primitives,
//! pairwise secure aggregation, the client-side trainer and the round
//! coordinator.

pub mod client;
pub mod coordinator;
pub mod privacy;
pub mod secure_agg;

pub use client::FederatedClient;
pub use coordinator::{FederatedCoordinator, RoundPhase, FEDERATED_MODEL_NAME};
pub use privacy::PrivacyAccountant;
pub use secure_agg::{MaskedUpdate, SealedPayload};
