pub mod explanation;
pub mod federated;
pub mod fusion;
pub mod pipeline;
pub mod registry;
pub mod strategies;
pub mod trust;
