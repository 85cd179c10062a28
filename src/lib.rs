//! Hybrid recommendation scoring core.
//!
//! Three scoring strategies (collaborative ALS, content-based similarity,
//! graph-neural aggregation) are fused with weighted reciprocal rank
//! fusion, diversified with MMR, trust-filtered and explained. Model
//! versions hot-swap through the registry; new versions of the global
//! preference model are produced offline by the privacy-preserving
//! federated training coordinator.

pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{RecError, Result};
