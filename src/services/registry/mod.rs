//! Model registry and hot-swap controller.
//!
//! Artifacts are published append-only to the `ArtifactStore`; the registry
//! decodes and warms a new version, then installs it with a single pointer
//! swap. Readers take a cheap `Arc` clone under a short read lock and can
//! never observe a half-updated model: the previously active version keeps
//! serving in-flight requests while it retires.

use crate::error::{RecError, Result};
use crate::models::{ModelArtifact, ModelParameters, StrategyKind, TrainingMetrics};
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Lifecycle of one (strategy, version) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Loading,
    Warming,
    Active,
    Retiring,
    Unloaded,
    Failed,
}

/// Decoded, immutable model snapshot handed to scoring readers.
#[derive(Debug)]
pub struct LoadedModel {
    pub version: u64,
    pub params: Arc<ModelParameters>,
    pub metrics: TrainingMetrics,
}

/// Append-only versioned artifact storage keyed by (name, version).
pub struct ArtifactStore {
    artifacts: DashMap<(String, u64), Arc<ModelArtifact>>,
    latest: DashMap<String, u64>,
    notify_tx: watch::Sender<u64>,
    publish_seq: std::sync::atomic::AtomicU64,
}

impl ArtifactStore {
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(0);
        Self {
            artifacts: DashMap::new(),
            latest: DashMap::new(),
            notify_tx,
            publish_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Publish a new artifact. Versions are immutable: republishing an
    /// existing (name, version) key is rejected.
    pub fn publish(&self, artifact: ModelArtifact) -> Result<()> {
        let key = (artifact.name.clone(), artifact.version);
        if self.artifacts.contains_key(&key) {
            return Err(RecError::Internal(format!(
                "Artifact {}/{} already published",
                artifact.name, artifact.version
            )));
        }
        info!(
            name = %artifact.name,
            version = artifact.version,
            blob_bytes = artifact.blob.len(),
            "Artifact published"
        );
        self.artifacts.insert(key.clone(), Arc::new(artifact));
        let mut latest = self.latest.entry(key.0).or_insert(0);
        if key.1 > *latest {
            *latest = key.1;
        }
        drop(latest);
        let seq = self
            .publish_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let _ = self.notify_tx.send(seq);
        Ok(())
    }

    pub fn get(&self, name: &str, version: u64) -> Option<Arc<ModelArtifact>> {
        self.artifacts
            .get(&(name.to_string(), version))
            .map(|a| a.clone())
    }

    pub fn latest_version(&self, name: &str) -> Option<u64> {
        self.latest.get(name).map(|v| *v)
    }

    pub fn latest(&self, name: &str) -> Option<Arc<ModelArtifact>> {
        let version = self.latest_version(name)?;
        self.get(name, version)
    }

    /// Notification channel bumped on every publish, for push-style sync.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify_tx.subscribe()
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

type Slot = Arc<RwLock<Option<Arc<LoadedModel>>>>;

pub struct ModelRegistry {
    slots: DashMap<StrategyKind, Slot>,
    states: Arc<DashMap<(StrategyKind, u64), ModelState>>,
    retire_grace: Duration,
}

impl ModelRegistry {
    pub fn new(retire_grace: Duration) -> Self {
        let slots = DashMap::new();
        for kind in StrategyKind::ALL {
            slots.insert(kind, Arc::new(RwLock::new(None)) as Slot);
        }
        Self {
            slots,
            states: Arc::new(DashMap::new()),
            retire_grace,
        }
    }

    pub fn from_config(config: &crate::config::RegistryConfig) -> Self {
        Self::new(Duration::from_millis(config.retire_grace_ms))
    }

    fn slot(&self, strategy: StrategyKind) -> Slot {
        self.slots
            .entry(strategy)
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone()
    }

    /// Current active model for a strategy. Short read lock, cheap clone;
    /// the returned snapshot stays valid across concurrent swaps.
    pub fn current(&self, strategy: StrategyKind) -> Option<Arc<LoadedModel>> {
        let slot = self.slot(strategy);
        let guard = slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().cloned()
    }

    pub fn state_of(&self, strategy: StrategyKind, version: u64) -> Option<ModelState> {
        self.states.get(&(strategy, version)).map(|s| *s)
    }

    fn set_state(&self, strategy: StrategyKind, version: u64, state: ModelState) {
        self.states.insert((strategy, version), state);
    }

    /// Load, warm and activate a published artifact.
    ///
    /// On any failure the previously active version keeps serving and the
    /// new version is marked `Failed` (operator-visible fault).
    pub fn activate(&self, artifact: &ModelArtifact) -> Result<()> {
        let Some(strategy) = StrategyKind::from_name(&artifact.name) else {
            return Err(RecError::ModelLoad(format!(
                "artifact {} has no serving slot",
                artifact.name
            )));
        };
        let version = artifact.version;
        self.set_state(strategy, version, ModelState::Loading);

        let params: ModelParameters = match bincode::deserialize(&artifact.blob) {
            Ok(p) => p,
            Err(e) => {
                self.set_state(strategy, version, ModelState::Failed);
                error!(
                    strategy = strategy.as_str(),
                    version,
                    error = %e,
                    "Model load failed; previous version remains active"
                );
                return Err(RecError::ModelLoad(format!(
                    "{}/{}: {}",
                    strategy.as_str(),
                    version,
                    e
                )));
            }
        };

        self.set_state(strategy, version, ModelState::Warming);
        if let Err(e) = warm(&params) {
            self.set_state(strategy, version, ModelState::Failed);
            error!(
                strategy = strategy.as_str(),
                version,
                error = %e,
                "Model warmup failed; previous version remains active"
            );
            return Err(e);
        }

        let loaded = Arc::new(LoadedModel {
            version,
            params: Arc::new(params),
            metrics: artifact.metrics.clone(),
        });

        // Atomic pointer swap: writers hold the lock only for the replace.
        let slot = self.slot(strategy);
        let previous = {
            let mut guard = slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.replace(loaded)
        };
        self.set_state(strategy, version, ModelState::Active);
        info!(strategy = strategy.as_str(), version, "Model activated");

        if let Some(old) = previous {
            self.set_state(strategy, old.version, ModelState::Retiring);
            let states = Arc::clone(&self.states);
            let grace = self.retire_grace;
            let old_version = old.version;
            // In-flight readers hold their own Arc; after the grace period
            // the retired version is only bookkeeping.
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                states.insert((strategy, old_version), ModelState::Unloaded);
                // Bookkeeping for versions older than the one just unloaded
                // is evicted so long-lived processes stay bounded.
                states.retain(|&(s, v), _| s != strategy || v >= old_version);
                info!(
                    strategy = strategy.as_str(),
                    version = old_version,
                    "Model unloaded"
                );
            });
        }

        Ok(())
    }

    /// Pull any newer artifacts from the store. Returns the number of
    /// successful activations.
    pub fn sync_from(&self, store: &ArtifactStore) -> usize {
        let mut activated = 0;
        for kind in StrategyKind::ALL {
            let Some(latest) = store.latest(kind.as_str()) else {
                continue;
            };
            let current_version = self.current(kind).map(|m| m.version).unwrap_or(0);
            if latest.version > current_version {
                match self.activate(&latest) {
                    Ok(()) => activated += 1,
                    Err(e) => warn!(
                        strategy = kind.as_str(),
                        version = latest.version,
                        error = %e,
                        "Activation skipped"
                    ),
                }
            }
        }
        activated
    }

    /// Long-lived sync loop: reacts to publish notifications and polls as a
    /// fallback. Runs until the store side of the watch channel is dropped.
    pub async fn run_sync(self: Arc<Self>, store: Arc<ArtifactStore>, poll_interval: Duration) {
        let mut notify = store.subscribe();
        loop {
            self.sync_from(&store);
            tokio::select! {
                changed = notify.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Run representative inputs through freshly decoded parameters so the first
/// real request does not pay cold-cache costs.
fn warm(params: &ModelParameters) -> Result<()> {
    match params {
        ModelParameters::Als(als) => {
            let mut acc = 0.0f32;
            for (user, factors) in als.user_factors.iter().take(8) {
                for item_factors in als.item_factors.values().take(32) {
                    acc += factors
                        .iter()
                        .zip(item_factors.iter())
                        .map(|(a, b)| a * b)
                        .sum::<f32>();
                }
                let _ = user;
            }
            if !acc.is_finite() {
                return Err(RecError::ModelLoad(
                    "ALS warmup produced non-finite scores".to_string(),
                ));
            }
            Ok(())
        }
        ModelParameters::Gnn(gnn) => {
            let probe = vec![0.1f32; gnn.input_dim()];
            let out = gnn.forward_self_only(&probe);
            if out.iter().any(|x| !x.is_finite()) {
                return Err(RecError::ModelLoad(
                    "GNN warmup produced non-finite embedding".to_string(),
                ));
            }
            Ok(())
        }
        ModelParameters::Flat(v) => {
            if v.iter().any(|x| !x.is_finite()) {
                return Err(RecError::ModelLoad(
                    "Flat model contains non-finite parameters".to_string(),
                ));
            }
            Ok(())
        }
    }
}
