//! Versioned embedding store for users, items and taxonomy nodes.
//!
//! Append-only with versioned overwrite: a put never mutates the stored
//! vector in place, it installs a new `Versioned` entry with a bumped
//! version so concurrent readers keep whatever snapshot they already hold.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Versioned {
    pub version: u64,
    pub vector: Arc<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    User,
    Item,
    Taxonomy,
}

/// Shared read-mostly vector store.
pub struct EmbeddingStore {
    dim: usize,
    entries: DashMap<(Namespace, Uuid), Versioned>,
    /// Taxonomy tag name -> node id, so genre vectors can be looked up by tag.
    taxonomy_ids: DashMap<String, Uuid>,
}

impl EmbeddingStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: DashMap::new(),
            taxonomy_ids: DashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Install or overwrite a vector, bumping the per-key version. Existing
    /// readers keep the `Arc` snapshot they already cloned.
    pub fn put(&self, ns: Namespace, id: Uuid, vector: Vec<f32>) -> u64 {
        debug_assert_eq!(vector.len(), self.dim);
        let mut slot = self.entries.entry((ns, id)).or_insert_with(|| Versioned {
            version: 0,
            vector: Arc::new(Vec::new()),
        });
        let version = slot.version + 1;
        *slot = Versioned {
            version,
            vector: Arc::new(vector),
        };
        version
    }

    pub fn get(&self, ns: Namespace, id: Uuid) -> Option<Versioned> {
        self.entries.get(&(ns, id)).map(|v| v.clone())
    }

    pub fn vector(&self, ns: Namespace, id: Uuid) -> Option<Arc<Vec<f32>>> {
        self.entries.get(&(ns, id)).map(|v| v.vector.clone())
    }

    /// Register a taxonomy tag with its node embedding.
    pub fn put_taxonomy(&self, tag: &str, vector: Vec<f32>) -> Uuid {
        let id = *self
            .taxonomy_ids
            .entry(tag.to_string())
            .or_insert_with(Uuid::new_v4);
        self.put(Namespace::Taxonomy, id, vector);
        id
    }

    pub fn taxonomy_vector(&self, tag: &str) -> Option<Arc<Vec<f32>>> {
        let id = self.taxonomy_ids.get(tag)?;
        self.vector(Namespace::Taxonomy, *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cosine similarity between two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// L2-normalize in place; zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_bumps_version() {
        let store = EmbeddingStore::new(4);
        let id = Uuid::new_v4();
        assert_eq!(store.put(Namespace::Item, id, vec![1.0, 0.0, 0.0, 0.0]), 1);
        assert_eq!(store.put(Namespace::Item, id, vec![0.0, 1.0, 0.0, 0.0]), 2);
        let current = store.get(Namespace::Item, id).unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.vector[1], 1.0);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn taxonomy_roundtrip() {
        let store = EmbeddingStore::new(2);
        store.put_taxonomy("jazz", vec![0.6, 0.8]);
        let v = store.taxonomy_vector("jazz").unwrap();
        assert_eq!(v.len(), 2);
        assert!(store.taxonomy_vector("metal").is_none());
    }
}
