//! Pairwise secure-aggregation masking and upload sealing.
//!
//! Masks live in fixed-point i64 with wrapping arithmetic so that the sum
//! over all cohort members cancels every pairwise term exactly; floating
//! point would leave residue. Each ordered pair derives a round-scoped seed
//! from an x25519 agreement, and the lexicographically smaller public key
//! adds the mask while the larger subtracts it.
//!
//! Uploads are sealed ECIES-style: a fresh AES-256-GCM payload key is
//! wrapped under a key derived from an ephemeral x25519 agreement with the
//! aggregator's public key.

use crate::error::{RecError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

/// Fixed-point scale: 2^24 fractional bits.
const FIXED_POINT_SCALE: f64 = (1u64 << 24) as f64;

const PAIRWISE_INFO: &[u8] = b"nova-secure-agg-pairwise";
const SEAL_INFO: &[u8] = b"nova-secure-agg-seal";

/// Quantize a float vector into the wrapping fixed-point domain.
pub fn quantize(values: &[f32]) -> Vec<i64> {
    values
        .iter()
        .map(|&v| (v as f64 * FIXED_POINT_SCALE).round() as i64)
        .collect()
}

/// Inverse of [`quantize`], applied after mask cancellation.
pub fn dequantize(values: &[i64]) -> Vec<f32> {
    values
        .iter()
        .map(|&v| (v as f64 / FIXED_POINT_SCALE) as f32)
        .collect()
}

/// Round-scoped pairwise seed from an x25519 agreement. Symmetric in the
/// pair: both sides derive the same seed.
pub fn pairwise_seed(
    my_secret: &StaticSecret,
    their_public: &PublicKey,
    round_id: u64,
) -> [u8; 32] {
    let shared = my_secret.diffie_hellman(their_public);
    let hk = Hkdf::<Sha256>::new(Some(&round_id.to_le_bytes()), shared.as_bytes());
    let mut seed = [0u8; 32];
    hk.expand(PAIRWISE_INFO, &mut seed)
        .expect("32 bytes is a valid HKDF output length");
    seed
}

/// Expand a pairwise seed into a full-width mask vector.
pub fn mask_from_seed(seed: [u8; 32], dim: usize) -> Vec<i64> {
    let mut rng = StdRng::from_seed(seed);
    (0..dim).map(|_| rng.gen::<i64>()).collect()
}

/// Signed sum of this client's pairwise masks against every cohort peer.
/// The smaller public key adds, the larger subtracts, so each pair's two
/// contributions cancel when all uploads are summed.
pub fn combined_mask(
    my_secret: &StaticSecret,
    my_public: &PublicKey,
    peers: &[PublicKey],
    round_id: u64,
    dim: usize,
) -> Vec<i64> {
    let mut mask = vec![0i64; dim];
    for peer in peers {
        if peer.as_bytes() == my_public.as_bytes() {
            continue;
        }
        let pair_mask = mask_from_seed(pairwise_seed(my_secret, peer, round_id), dim);
        let add = my_public.as_bytes() < peer.as_bytes();
        for (acc, m) in mask.iter_mut().zip(pair_mask.iter()) {
            *acc = if add {
                acc.wrapping_add(*m)
            } else {
                acc.wrapping_sub(*m)
            };
        }
    }
    mask
}

/// Apply a combined mask to a quantized update.
pub fn apply_mask(values: &mut [i64], mask: &[i64]) {
    for (v, m) in values.iter_mut().zip(mask.iter()) {
        *v = v.wrapping_add(*m);
    }
}

/// Remove one dangling pairwise mask from an aggregate, used when a cohort
/// member dropped out and a survivor reveals their shared seed.
pub fn remove_pair_mask(
    aggregate: &mut [i64],
    seed: [u8; 32],
    survivor_adds: bool,
) {
    let mask = mask_from_seed(seed, aggregate.len());
    for (acc, m) in aggregate.iter_mut().zip(mask.iter()) {
        *acc = if survivor_adds {
            acc.wrapping_sub(*m)
        } else {
            acc.wrapping_add(*m)
        };
    }
}

/// The plaintext a client seals: its masked, sample-weighted update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskedUpdate {
    pub round_id: u64,
    pub values: Vec<i64>,
}

/// Sealed client upload: AES-256-GCM ciphertext with the payload key
/// wrapped under an ephemeral x25519 agreement with the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedPayload {
    pub ephemeral_public: [u8; 32],
    pub key_nonce: [u8; 12],
    pub encrypted_key: Vec<u8>,
    pub payload_nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

fn wrap_key_cipher(shared_secret: &[u8; 32]) -> Result<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut kek = [0u8; 32];
    hk.expand(SEAL_INFO, &mut kek)
        .map_err(|_| RecError::Encryption("KEK derivation failed".to_string()))?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek)))
}

/// Seal an update for the aggregator.
pub fn seal(aggregator_public: &PublicKey, update: &MaskedUpdate) -> Result<SealedPayload> {
    let plaintext = bincode::serialize(update)?;

    let mut payload_key = [0u8; 32];
    OsRng.fill_bytes(&mut payload_key);
    let mut payload_nonce = [0u8; 12];
    OsRng.fill_bytes(&mut payload_nonce);
    let mut key_nonce = [0u8; 12];
    OsRng.fill_bytes(&mut key_nonce);

    let payload_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&payload_key));
    let ciphertext = payload_cipher
        .encrypt(Nonce::from_slice(&payload_nonce), plaintext.as_ref())
        .map_err(|_| RecError::Encryption("payload encryption failed".to_string()))?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(aggregator_public);
    let kek = wrap_key_cipher(shared.as_bytes())?;
    let encrypted_key = kek
        .encrypt(Nonce::from_slice(&key_nonce), payload_key.as_ref())
        .map_err(|_| RecError::Encryption("key wrap failed".to_string()))?;

    Ok(SealedPayload {
        ephemeral_public: *ephemeral_public.as_bytes(),
        key_nonce,
        encrypted_key,
        payload_nonce,
        ciphertext,
    })
}

/// Open a sealed upload with the aggregator's secret. Any tampering fails
/// authentication and surfaces as a malformed upload.
pub fn open(aggregator_secret: &StaticSecret, sealed: &SealedPayload) -> Result<MaskedUpdate> {
    let ephemeral_public = PublicKey::from(sealed.ephemeral_public);
    let shared = aggregator_secret.diffie_hellman(&ephemeral_public);
    let kek = wrap_key_cipher(shared.as_bytes())?;
    let payload_key = kek
        .decrypt(
            Nonce::from_slice(&sealed.key_nonce),
            sealed.encrypted_key.as_ref(),
        )
        .map_err(|_| RecError::MalformedUpload("key unwrap failed".to_string()))?;
    if payload_key.len() != 32 {
        return Err(RecError::MalformedUpload(
            "unwrapped key has wrong length".to_string(),
        ));
    }

    let payload_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&payload_key));
    let plaintext = payload_cipher
        .decrypt(
            Nonce::from_slice(&sealed.payload_nonce),
            sealed.ciphertext.as_ref(),
        )
        .map_err(|_| RecError::MalformedUpload("payload decryption failed".to_string()))?;
    Ok(bincode::deserialize(&plaintext)?)
}
