//! Client-side half of a federated round.
//!
//! A client trains briefly on its own bounded interaction window, clips and
//! noises the resulting delta, weights it by its sample count, then masks
//! and seals it. Raw interactions never leave the client; only the sealed,
//! masked update does.

use super::privacy::{add_gaussian_noise, clip_l2, noise_sigma};
use super::secure_agg::{self, MaskedUpdate};
use crate::config::FederatedConfig;
use crate::error::Result;
use crate::models::{ClientUpload, RoundInit};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

pub struct FederatedClient {
    pub client_id: Uuid,
    secret: StaticSecret,
    public: PublicKey,
    /// Bounded local window: (feature vector, rating target).
    examples: Vec<(Vec<f32>, f32)>,
    local_epochs: usize,
    batch_size: usize,
    learning_rate: f32,
    seed: u64,
}

impl FederatedClient {
    pub fn new(client_id: Uuid, examples: Vec<(Vec<f32>, f32)>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key_bytes = [0u8; 32];
        rng.fill_bytes(&mut key_bytes);
        let secret = StaticSecret::from(key_bytes);
        let public = PublicKey::from(&secret);
        Self {
            client_id,
            secret,
            public,
            examples,
            local_epochs: 2,
            batch_size: 8,
            learning_rate: 0.05,
            seed,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn sample_count(&self) -> u64 {
        self.examples.len() as u64
    }

    /// Few epochs of mini-batch SGD on the local window against a squared
    /// prediction error. Returns the weight delta relative to the global
    /// parameters.
    pub(super) fn local_delta(&self, global: &[f32]) -> Vec<f32> {
        let mut weights = global.to_vec();
        for _ in 0..self.local_epochs {
            for batch in self.examples.chunks(self.batch_size) {
                let mut gradient = vec![0.0f32; weights.len()];
                for (features, target) in batch {
                    let prediction: f32 = weights
                        .iter()
                        .zip(features.iter())
                        .map(|(w, x)| w * x)
                        .sum();
                    let error = prediction - target;
                    for (g, x) in gradient.iter_mut().zip(features.iter()) {
                        *g += error * x;
                    }
                }
                let scale = self.learning_rate / batch.len() as f32;
                for (w, g) in weights.iter_mut().zip(gradient.iter()) {
                    *w -= scale * g;
                }
            }
        }
        weights
            .iter()
            .zip(global.iter())
            .map(|(w, g)| w - g)
            .collect()
    }

    /// Produce this client's sealed upload for a round.
    pub fn participate(
        &self,
        round: &RoundInit,
        global: &[f32],
        cohort: &[PublicKey],
        aggregator: &PublicKey,
        config: &FederatedConfig,
    ) -> Result<ClientUpload> {
        let mut delta = self.local_delta(global);
        clip_l2(&mut delta, config.clip_norm);

        let sigma = noise_sigma(config.clip_norm, config.noise_multiplier, config.min_clients);
        let mut noise_rng = StdRng::seed_from_u64(self.seed ^ round.round_id);
        add_gaussian_noise(&mut delta, sigma, &mut noise_rng);

        // Sample-count weighting happens client-side so the coordinator can
        // average without ever seeing an individual update.
        let claimed = self.sample_count().min(config.max_claimed_samples);
        for d in delta.iter_mut() {
            *d *= claimed as f32;
        }

        let mut values = secure_agg::quantize(&delta);
        let mask = secure_agg::combined_mask(
            &self.secret,
            &self.public,
            cohort,
            round.round_id,
            values.len(),
        );
        secure_agg::apply_mask(&mut values, &mask);

        let sealed = secure_agg::seal(
            aggregator,
            &MaskedUpdate {
                round_id: round.round_id,
                values,
            },
        )?;
        Ok(ClientUpload {
            round_id: round.round_id,
            client_id: self.client_id,
            encrypted_payload: sealed,
            claimed_sample_count: claimed,
        })
    }

    /// Reveal the pairwise seed shared with a dropped cohort member so the
    /// coordinator can cancel the dangling mask. Returns the seed and
    /// whether this survivor added (vs subtracted) that mask.
    pub fn recovery_seed(&self, round_id: u64, dropped: &PublicKey) -> ([u8; 32], bool) {
        let seed = secure_agg::pairwise_seed(&self.secret, dropped, round_id);
        let survivor_adds = self.public.as_bytes() < dropped.as_bytes();
        (seed, survivor_adds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn round() -> RoundInit {
        RoundInit {
            round_id: 1,
            model_version: 1,
            cohort_size: 2,
            deadline: Utc::now() + Duration::seconds(30),
        }
    }

    #[test]
    fn local_training_reduces_prediction_error() {
        // Target weights [1, -1]: examples are exact.
        let examples: Vec<(Vec<f32>, f32)> = vec![
            (vec![1.0, 0.0], 1.0),
            (vec![0.0, 1.0], -1.0),
            (vec![1.0, 1.0], 0.0),
            (vec![0.5, 0.0], 0.5),
        ];
        let client = FederatedClient::new(Uuid::new_v4(), examples.clone(), 4);
        let global = vec![0.0f32, 0.0];
        let delta = client.local_delta(&global);

        let error_before: f32 = examples
            .iter()
            .map(|(x, y)| {
                let p: f32 = global.iter().zip(x.iter()).map(|(w, v)| w * v).sum();
                (p - y) * (p - y)
            })
            .sum();
        let updated: Vec<f32> = global.iter().zip(delta.iter()).map(|(g, d)| g + d).collect();
        let error_after: f32 = examples
            .iter()
            .map(|(x, y)| {
                let p: f32 = updated.iter().zip(x.iter()).map(|(w, v)| w * v).sum();
                (p - y) * (p - y)
            })
            .sum();
        assert!(error_after < error_before);
    }

    #[test]
    fn upload_is_sealed_and_claims_window_size() {
        let config = crate::config::Config::default().federated;
        let client = FederatedClient::new(
            Uuid::new_v4(),
            vec![(vec![1.0, 0.0], 1.0), (vec![0.0, 1.0], 0.5)],
            8,
        );
        let mut agg_rng = StdRng::seed_from_u64(99);
        let mut agg_bytes = [0u8; 32];
        agg_rng.fill_bytes(&mut agg_bytes);
        let agg_secret = StaticSecret::from(agg_bytes);
        let agg_public = PublicKey::from(&agg_secret);

        let upload = client
            .participate(
                &round(),
                &[0.0, 0.0],
                &[client.public_key()],
                &agg_public,
                &config,
            )
            .unwrap();
        assert_eq!(upload.claimed_sample_count, 2);
        // The payload opens back to a two-element masked update.
        let opened = secure_agg::open(&agg_secret, &upload.encrypted_payload).unwrap();
        assert_eq!(opened.values.len(), 2);
        assert_eq!(opened.round_id, 1);
    }
}
