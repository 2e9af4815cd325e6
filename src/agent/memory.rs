//! Three-tier memory store: working (key/value scratch), episodic (vector
//! indexed history), and semantic (facts with confidence).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from memory operations.
#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    #[error("episodic memory is full ({capacity} entries)")]
    #[diagnostic(
        code(evo::memory::capacity),
        help("Raise the episodic capacity or consolidate old episodes.")
    )]
    CapacityExceeded { capacity: usize },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(evo::memory::dimension),
        help("All episodic feature vectors must have the same length.")
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("memory serialization failed: {message}")]
    #[diagnostic(code(evo::memory::serialization))]
    Serialization { message: String },
}

/// Result type for memory operations.
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// One stored episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEntry {
    /// Assigned by the store on append.
    pub id: u64,
    pub summary: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

impl EpisodicEntry {
    pub fn new(summary: impl Into<String>, vector: Vec<f32>, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            summary: summary.into(),
            vector,
            payload,
        }
    }
}

/// A semantic fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
    pub confidence: f32,
}

/// Storage contract the feedback processor writes through.
pub trait MemoryStore: Send + Sync {
    fn working_get(&self, key: &str) -> Option<serde_json::Value>;
    fn working_set(&self, key: &str, value: serde_json::Value) -> MemoryResult<()>;

    /// Append an episode and return its id.
    fn episodic_append(&self, entry: EpisodicEntry) -> MemoryResult<u64>;
    /// The `k` episodes most similar to `vector`, best first.
    fn episodic_query_similar(&self, vector: &[f32], k: usize) -> MemoryResult<Vec<EpisodicEntry>>;
    fn episodic_len(&self) -> usize;

    fn semantic_upsert(&self, fact: Fact) -> MemoryResult<()>;
    fn semantic_lookup(&self, key: &str) -> Option<Fact>;
}

/// Process-local memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    working: RwLock<HashMap<String, serde_json::Value>>,
    episodic: RwLock<Vec<EpisodicEntry>>,
    semantic: RwLock<HashMap<String, Fact>>,
    episodic_capacity: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the episodic tier; appends past `capacity` fail.
    pub fn with_episodic_capacity(capacity: usize) -> Self {
        Self {
            episodic_capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn semantic_len(&self) -> usize {
        self.semantic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl MemoryStore for InMemoryStore {
    fn working_get(&self, key: &str) -> Option<serde_json::Value> {
        self.working
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn working_set(&self, key: &str, value: serde_json::Value) -> MemoryResult<()> {
        self.working
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn episodic_append(&self, mut entry: EpisodicEntry) -> MemoryResult<u64> {
        let mut episodes = self.episodic.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(capacity) = self.episodic_capacity {
            if episodes.len() >= capacity {
                return Err(MemoryError::CapacityExceeded { capacity });
            }
        }
        if let Some(first) = episodes.first() {
            if first.vector.len() != entry.vector.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected: first.vector.len(),
                    actual: entry.vector.len(),
                });
            }
        }
        let id = episodes.len() as u64 + 1;
        entry.id = id;
        episodes.push(entry);
        Ok(id)
    }

    fn episodic_query_similar(&self, vector: &[f32], k: usize) -> MemoryResult<Vec<EpisodicEntry>> {
        let episodes = self.episodic.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = episodes.first() {
            if first.vector.len() != vector.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected: first.vector.len(),
                    actual: vector.len(),
                });
            }
        }
        let mut scored: Vec<(f32, &EpisodicEntry)> = episodes
            .iter()
            .map(|e| (cosine_similarity(vector, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.id.cmp(&b.1.id)));
        Ok(scored.into_iter().take(k).map(|(_, e)| e.clone()).collect())
    }

    fn episodic_len(&self) -> usize {
        self.episodic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn semantic_upsert(&self, fact: Fact) -> MemoryResult<()> {
        self.semantic
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fact.key.clone(), fact);
        Ok(())
    }

    fn semantic_lookup(&self, key: &str) -> Option<Fact> {
        self.semantic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Cosine similarity, 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
