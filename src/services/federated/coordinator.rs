//! Federated training coordinator: the server side of a round.
//!
//! Runs as a long-lived background component, fully decoupled from the
//! scoring path. Each round moves through an explicit state machine
//! (`Collecting → Aggregating → Applied | Cancelled`); uploads arrive over
//! an mpsc channel, unordered and possibly late, duplicated or malformed,
//! and the round tolerates all three. Cancellation is a strict no-op: no
//! partial aggregate ever touches the global model.

use super::client::FederatedClient;
use super::privacy::PrivacyAccountant;
use super::secure_agg;
use crate::config::FederatedConfig;
use crate::error::{RecError, Result};
use crate::models::{ClientUpload, ModelArtifact, ModelParameters, RoundInit, RoundResult, TrainingMetrics};
use crate::services::registry::ArtifactStore;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

/// Artifact name for the federated preference model. Not a serving
/// strategy: the registry never activates it, but it is versioned and
/// published like any other artifact.
pub const FEDERATED_MODEL_NAME: &str = "federated_preference";

/// Completed-round phases kept for introspection before eviction.
const PHASE_RETENTION_ROUNDS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Collecting,
    Aggregating,
    Applied,
    Cancelled,
}

pub struct FederatedCoordinator {
    config: FederatedConfig,
    secret: StaticSecret,
    public: PublicKey,
    global: RwLock<Arc<Vec<f32>>>,
    version: AtomicU64,
    next_round: AtomicU64,
    accountant: Mutex<PrivacyAccountant>,
    phases: DashMap<u64, RoundPhase>,
    store: Arc<ArtifactStore>,
}

impl FederatedCoordinator {
    pub fn new(config: FederatedConfig, store: Arc<ArtifactStore>) -> Self {
        let mut key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key_bytes);
        let secret = StaticSecret::from(key_bytes);
        let public = PublicKey::from(&secret);
        let accountant = PrivacyAccountant::new(&config);
        let global = Arc::new(vec![0.0f32; config.model_dim]);
        Self {
            config,
            secret,
            public,
            global: RwLock::new(global),
            version: AtomicU64::new(0),
            next_round: AtomicU64::new(0),
            accountant: Mutex::new(accountant),
            phases: DashMap::new(),
            store,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Immutable snapshot of the current global model.
    pub fn global_model(&self) -> Arc<Vec<f32>> {
        let guard = self
            .global
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn phase_of(&self, round_id: u64) -> Option<RoundPhase> {
        self.phases.get(&round_id).map(|p| *p)
    }

    /// Record a round's terminal phase and evict bookkeeping for rounds
    /// past the retention horizon, keeping the map bounded over the life of
    /// the process.
    fn set_terminal_phase(&self, round_id: u64, phase: RoundPhase) {
        self.phases.insert(round_id, phase);
        self.phases
            .retain(|&r, _| r + PHASE_RETENTION_ROUNDS > round_id);
    }

    /// Cumulative privacy spend, for operator dashboards.
    pub fn privacy_consumed(&self) -> (f64, f64) {
        self.accountant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .consumed()
    }

    /// Run one complete round against an in-process client population.
    /// Cohort members train and upload concurrently; stragglers past the
    /// deadline are discarded.
    pub async fn run_round(&self, population: &[Arc<FederatedClient>]) -> Result<RoundResult> {
        self.accountant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ensure_budget()?;

        let round_id = self.next_round.fetch_add(1, Ordering::SeqCst) + 1;
        let round = RoundInit {
            round_id,
            model_version: self.current_version(),
            cohort_size: self.config.cohort_size.min(population.len()),
            deadline: Utc::now()
                + ChronoDuration::milliseconds(self.config.round_deadline_ms as i64),
        };

        // Uniform random cohort without replacement.
        let mut rng = StdRng::from_entropy();
        let cohort: Vec<Arc<FederatedClient>> = population
            .choose_multiple(&mut rng, round.cohort_size)
            .cloned()
            .collect();
        let roster: Vec<PublicKey> = cohort.iter().map(|c| c.public_key()).collect();
        info!(
            round_id,
            cohort = cohort.len(),
            model_version = round.model_version,
            "Round started"
        );
        self.phases.insert(round_id, RoundPhase::Collecting);

        let (tx, mut rx) = mpsc::channel::<ClientUpload>(cohort.len().max(1));
        let global = self.global_model();
        for client in &cohort {
            let client = Arc::clone(client);
            let tx = tx.clone();
            let round = round.clone();
            let roster = roster.clone();
            let aggregator = self.public;
            let config = self.config.clone();
            let global = Arc::clone(&global);
            tokio::spawn(async move {
                match client.participate(&round, &global, &roster, &aggregator, &config) {
                    Ok(upload) => {
                        let _ = tx.send(upload).await;
                    }
                    Err(e) => {
                        warn!(client_id = %client.client_id, error = %e, "Client failed locally")
                    }
                }
            });
        }
        drop(tx);

        let uploads = self
            .collect(cohort.len(), &mut rx, Duration::from_millis(self.config.round_deadline_ms))
            .await;
        self.finalize(&round, &cohort, uploads)
    }

    /// Drain the upload channel until the cohort is complete, the channel
    /// closes, or the deadline passes. Raw uploads only; validation happens
    /// during aggregation.
    async fn collect(
        &self,
        expected: usize,
        rx: &mut mpsc::Receiver<ClientUpload>,
        deadline: Duration,
    ) -> Vec<ClientUpload> {
        let cutoff = Instant::now() + deadline;
        let mut uploads = Vec::with_capacity(expected);
        while uploads.len() < expected {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(upload) => uploads.push(upload),
                    None => break,
                },
                _ = tokio::time::sleep_until(cutoff) => {
                    warn!(
                        received = uploads.len(),
                        expected,
                        "Round deadline reached; discarding stragglers"
                    );
                    break;
                }
            }
        }
        uploads
    }

    /// Validate, aggregate and apply a round's uploads. Public so failure
    /// paths (quorum, dropouts, duplicates, tampering) can be driven
    /// directly.
    pub fn finalize(
        &self,
        round: &RoundInit,
        cohort: &[Arc<FederatedClient>],
        uploads: Vec<ClientUpload>,
    ) -> Result<RoundResult> {
        let cohort_by_id: HashMap<Uuid, &Arc<FederatedClient>> =
            cohort.iter().map(|c| (c.client_id, c)).collect();

        // Admission: dedup first-wins, malformed dropped, round isolated.
        let mut admitted: HashMap<Uuid, (Vec<i64>, u64)> = HashMap::new();
        for upload in uploads {
            if upload.round_id != round.round_id {
                warn!(client_id = %upload.client_id, "Upload for a different round; dropped");
                continue;
            }
            if !cohort_by_id.contains_key(&upload.client_id) {
                warn!(client_id = %upload.client_id, "Upload from outside the cohort; dropped");
                continue;
            }
            if admitted.contains_key(&upload.client_id) {
                warn!(client_id = %upload.client_id, "Duplicate upload; first wins");
                continue;
            }
            if upload.claimed_sample_count == 0
                || upload.claimed_sample_count > self.config.max_claimed_samples
            {
                warn!(
                    client_id = %upload.client_id,
                    claimed = upload.claimed_sample_count,
                    "Implausible sample count; dropped"
                );
                continue;
            }
            let update = match secure_agg::open(&self.secret, &upload.encrypted_payload) {
                Ok(update) if update.round_id == round.round_id => update,
                Ok(_) => {
                    warn!(client_id = %upload.client_id, "Sealed round id mismatch; dropped");
                    continue;
                }
                Err(e) => {
                    warn!(client_id = %upload.client_id, error = %e, "Malformed upload; dropped");
                    continue;
                }
            };
            if update.values.len() != self.config.model_dim {
                warn!(client_id = %upload.client_id, "Wrong update dimension; dropped");
                continue;
            }
            admitted.insert(upload.client_id, (update.values, upload.claimed_sample_count));
        }

        if admitted.len() < self.config.min_clients {
            self.set_terminal_phase(round.round_id, RoundPhase::Cancelled);
            warn!(
                round_id = round.round_id,
                received = admitted.len(),
                required = self.config.min_clients,
                "Quorum not met; round cancelled without model update"
            );
            return Err(RecError::QuorumNotMet {
                received: admitted.len(),
                required: self.config.min_clients,
            });
        }
        self.phases.insert(round.round_id, RoundPhase::Aggregating);

        // Sum of masked updates; survivor-pair masks cancel by construction.
        let mut aggregate = vec![0i64; self.config.model_dim];
        let mut total_samples = 0u64;
        for (values, claimed) in admitted.values() {
            for (acc, v) in aggregate.iter_mut().zip(values.iter()) {
                *acc = acc.wrapping_add(*v);
            }
            total_samples += claimed;
        }

        // Dangling masks toward dropped cohort members are cancelled with
        // seeds revealed by the survivors.
        for dropped in cohort.iter().filter(|c| !admitted.contains_key(&c.client_id)) {
            let dropped_public = dropped.public_key();
            for survivor_id in admitted.keys() {
                let survivor = cohort_by_id[survivor_id];
                let (seed, survivor_adds) =
                    survivor.recovery_seed(round.round_id, &dropped_public);
                secure_agg::remove_pair_mask(&mut aggregate, seed, survivor_adds);
            }
        }

        // Sample-count-weighted average: clients pre-scaled by their capped
        // counts, so dividing by the total completes the weighting.
        let summed = secure_agg::dequantize(&aggregate);
        let average: Vec<f32> = summed
            .iter()
            .map(|v| v / total_samples as f32)
            .collect();
        if average.iter().any(|v| !v.is_finite()) {
            self.set_terminal_phase(round.round_id, RoundPhase::Cancelled);
            return Err(RecError::Internal(
                "aggregated update contains non-finite values".to_string(),
            ));
        }

        let eta = self.config.server_learning_rate;
        let previous = self.global_model();
        let updated: Arc<Vec<f32>> = Arc::new(
            previous
                .iter()
                .zip(average.iter())
                .map(|(w, d)| w + eta * d)
                .collect(),
        );
        {
            let mut guard = self
                .global
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Arc::clone(&updated);
        }
        let new_version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

        let mut accountant = self
            .accountant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accountant.charge_round();
        let update_norm = average.iter().map(|v| v * v).sum::<f32>().sqrt();
        let metrics = TrainingMetrics {
            final_loss: update_norm,
            epochs_run: accountant.rounds_applied(),
            sample_count: total_samples,
            validation_loss: None,
        };
        drop(accountant);

        self.store.publish(ModelArtifact {
            name: FEDERATED_MODEL_NAME.to_string(),
            version: new_version,
            blob: bincode::serialize(&ModelParameters::Flat(updated.as_ref().clone()))?,
            metrics: metrics.clone(),
            created_at: Utc::now(),
        })?;

        self.set_terminal_phase(round.round_id, RoundPhase::Applied);
        info!(
            round_id = round.round_id,
            new_version,
            clients = admitted.len(),
            samples = total_samples,
            update_norm,
            "Round applied"
        );
        Ok(RoundResult {
            new_version,
            metrics,
        })
    }
}
