use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::Error;
use crate::llm::types::Message;

use super::Chunk;

/// Configuration for two-level chunking. All sizes are in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Parents longer than this are cut further at whitespace.
    pub max_parent_chars: usize,
    /// Length of each child window.
    pub child_chars: usize,
    /// Chars shared by consecutive child windows.
    pub child_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_parent_chars: 600,
            child_chars: 100,
            child_overlap: 15,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_parent_chars == 0 || self.child_chars == 0 {
            return Err(Error::Config(
                "max_parent_chars and child_chars must be greater than 0".into(),
            ));
        }
        if self.child_overlap >= self.child_chars {
            return Err(Error::Config(format!(
                "child_overlap ({}) must be smaller than child_chars ({})",
                self.child_overlap, self.child_chars
            )));
        }
        Ok(())
    }
}

/// Chunk-worthiness threshold in chars for a context window.
pub fn chunk_threshold(max_context_tokens: u32, ratio: f32) -> usize {
    (max_context_tokens as f64 * ratio as f64).floor() as usize
}

/// Splits oversized message content into parent/child chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
    threshold_chars: usize,
}

impl Chunker {
    pub fn new(config: ChunkConfig, threshold_chars: usize) -> Self {
        Self {
            config,
            threshold_chars,
        }
    }

    pub fn threshold_chars(&self) -> usize {
        self.threshold_chars
    }

    /// True when the content is longer than the threshold.
    pub fn should_chunk(&self, message: &Message) -> bool {
        message.content_str().chars().count() > self.threshold_chars
    }

    /// Pure function of `text` and the config.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return vec![];
        }

        let mut chunks = Vec::new();
        for (parent_index, parent) in split_parents(text, self.config.max_parent_chars)
            .into_iter()
            .enumerate()
        {
            let windows = child_windows(parent, self.config.child_chars, self.config.child_overlap);
            for (child_index, window) in windows.into_iter().enumerate() {
                chunks.push(Chunk {
                    id: chunk_id(parent_index, child_index, window),
                    text: window.to_string(),
                    parent_text: parent.to_string(),
                    parent_index,
                    original_index: chunks.len(),
                });
            }
        }
        chunks
    }
}

fn chunk_id(parent_index: usize, child_index: usize, text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    parent_index.hash(&mut hasher);
    child_index.hash(&mut hasher);
    text.hash(&mut hasher);
    format!("{:016x}-{parent_index}-{child_index}", hasher.finish())
}

/// Contiguous parent slices covering `text` exactly.
///
/// A parent ends after terminal punctuation followed by whitespace, or after
/// a newline; the trailing whitespace run belongs to the parent it ends.
pub fn split_parents(text: &str, max_parent_chars: usize) -> Vec<&str> {
    let mut parents = Vec::new();
    for (start, end) in sentence_spans(text) {
        split_long(text, start, end, max_parent_chars.max(1), &mut parents);
    }
    parents
}

fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().is_some_and(|&(_, next)| next.is_whitespace()),
            _ => false,
        };
        if !boundary {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }
        spans.push((start, end));
        start = end;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Cut `text[start..end]` into pieces of at most `max_chars` chars, preferring
/// to cut right after the last whitespace in each window.
fn split_long<'a>(text: &'a str, start: usize, end: usize, max_chars: usize, out: &mut Vec<&'a str>) {
    let mut pos = start;
    while pos < end {
        let rest = &text[pos..end];
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            out.push(rest);
            break;
        };
        let cut = rest[..limit]
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map_or(limit, |(j, c)| j + c.len_utf8());
        out.push(&rest[..cut]);
        pos += cut;
    }
}

/// Overlapping windows of `size` chars; the last window ends at the end of
/// `parent`. A parent no longer than `size` is its own single window.
fn child_windows(parent: &str, size: usize, overlap: usize) -> Vec<&str> {
    let offsets: Vec<usize> = parent
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(parent.len()))
        .collect();
    let char_count = offsets.len() - 1;
    if char_count <= size {
        return vec![parent];
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(char_count);
        windows.push(&parent[offsets[start]..offsets[end]]);
        if end == char_count {
            break;
        }
        start += step;
    }
    windows
}
