use crate::error::Error;

use super::Chunk;

/// A stored chunk with its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: Chunk,
}

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub chunk: Chunk,
    pub score: f64,
}

/// In-memory cosine-similarity index. Lives as long as the session that
/// built it; there is no eviction.
///
/// Every vector must have the index's dimension. An index built with
/// [`VectorIndex::new`] takes it from the first vector added.
#[derive(Debug, Default)]
pub struct VectorIndex {
    records: Vec<EmbeddingRecord>,
    dimension: Option<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            records: Vec::new(),
            dimension: Some(dimension),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pair each chunk with its embedding. Counts must match and every
    /// vector must have the index's dimension; nothing is added otherwise.
    pub fn add(&mut self, chunks: Vec<Chunk>, embeddings: Vec<Vec<f32>>) -> Result<(), Error> {
        if chunks.len() != embeddings.len() {
            return Err(Error::Embedding(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            )));
        }
        let Some(expected) = self.dimension.or_else(|| embeddings.first().map(Vec::len)) else {
            return Ok(());
        };
        if let Some(bad) = embeddings.iter().find(|v| v.len() != expected) {
            return Err(Error::Embedding(format!(
                "embedding has {} dimensions, index expects {expected}",
                bad.len()
            )));
        }
        self.dimension = Some(expected);
        self.records
            .extend(chunks.into_iter().zip(embeddings).map(|(chunk, vector)| {
                EmbeddingRecord {
                    chunk_id: chunk.id.clone(),
                    vector,
                    metadata: chunk,
                }
            }));
        Ok(())
    }

    /// Top `k` records by cosine similarity, best first. Equal scores keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Hit> {
        let mut scored: Vec<(usize, f64)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, cosine_similarity(query, &r.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| Hit {
                chunk: self.records[i].metadata.clone(),
                score,
            })
            .collect()
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector is empty, the lengths differ, or either has
/// zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut mag_a = 0.0_f64;
    let mut mag_b = 0.0_f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    dot / denom
}
