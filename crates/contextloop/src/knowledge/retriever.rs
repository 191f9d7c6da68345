use std::collections::HashSet;

use tracing::debug;

use crate::error::Error;

use super::Chunk;
use super::embedding::EmbeddingProvider;
use super::index::{Hit, VectorIndex};

/// Top-K used when compressing an oversized message.
pub const COMPRESSION_LIMIT: usize = 48;
/// Top-K used for light filtering.
pub const FILTER_LIMIT: usize = 12;

/// Retrieval pipeline over one [`VectorIndex`].
///
/// ```ignore
/// let hits = Rag::new(embedder, &mut index)
///     .limit(48)
///     .only_unique()
///     .sort_by_index()
///     .query("what the next step needs")
///     .await?;
/// ```
pub struct Rag<'a> {
    embedder: &'a dyn EmbeddingProvider,
    index: &'a mut VectorIndex,
    limit: usize,
    only_unique: bool,
    sort_by_index: bool,
    min_score: Option<f64>,
}

impl<'a> Rag<'a> {
    pub fn new(embedder: &'a dyn EmbeddingProvider, index: &'a mut VectorIndex) -> Self {
        Self {
            embedder,
            index,
            limit: FILTER_LIMIT,
            only_unique: false,
            sort_by_index: false,
            min_score: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Keep one hit per parent (the best-scoring one).
    pub fn only_unique(mut self) -> Self {
        self.only_unique = true;
        self
    }

    /// Return hits in source order instead of relevance order.
    pub fn sort_by_index(mut self) -> Self {
        self.sort_by_index = true;
        self
    }

    pub fn min_score(mut self, score: f64) -> Self {
        self.min_score = Some(score);
        self
    }

    /// Embed and index `chunks`.
    pub async fn ingest(&mut self, chunks: Vec<Chunk>) -> Result<(), Error> {
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        debug!(chunks = chunks.len(), "indexed chunks");
        self.index.add(chunks, embeddings)
    }

    /// Run the pipeline for `text`. No match is an empty result, not an error.
    pub async fn query(&self, text: &str) -> Result<Vec<Hit>, Error> {
        if self.index.is_empty() || self.limit == 0 {
            return Ok(vec![]);
        }
        let query = self
            .embedder
            .embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("no embedding returned for query".into()))?;

        if let Some(dimension) = self.index.dimension()
            && query.len() != dimension
        {
            return Err(Error::Embedding(format!(
                "query embedding has {} dimensions, index expects {dimension}",
                query.len()
            )));
        }

        let mut hits = self.index.search(&query, self.limit);

        if let Some(min) = self.min_score {
            hits.retain(|h| h.score >= min);
        }
        if self.only_unique {
            // Hits arrive best-first, so the first per parent is the best.
            let mut seen = HashSet::new();
            hits.retain(|h| seen.insert(h.chunk.parent_index));
        }
        if self.sort_by_index {
            hits.sort_by_key(|h| h.chunk.original_index);
        }
        Ok(hits)
    }
}

/// Concatenate parent texts in hit order, stopping before the first parent
/// that would push the preview past `max_chars`. A parent is never split,
/// and an empty preview is a valid result.
pub fn preview_chunks(hits: &[Hit], max_chars: usize) -> String {
    let mut preview = String::new();
    let mut used = 0;
    for hit in hits {
        let len = hit.chunk.parent_text.chars().count();
        if used + len > max_chars {
            break;
        }
        preview.push_str(&hit.chunk.parent_text);
        used += len;
    }
    preview
}
