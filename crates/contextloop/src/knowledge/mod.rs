pub mod chunker;
pub mod embedding;
pub mod index;
pub mod retriever;

/// Retrieval unit: a child window of a sentence-level parent.
///
/// Retrieval matches on the small `text` window but hands back the whole
/// `parent_text`, so a hit always reads as complete sentences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Deterministic ID derived from parent index, child index and text.
    pub id: String,
    /// The child window.
    pub text: String,
    /// The parent this window was cut from.
    pub parent_text: String,
    /// Position of the parent in the source text (0-based).
    pub parent_index: usize,
    /// Position of this chunk in the full chunk sequence (0-based).
    pub original_index: usize,
}
