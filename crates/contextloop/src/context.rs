use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info};

use crate::budget::{Budget, ContextLimits};
use crate::chat::{ChatLog, Partition};
use crate::error::Error;
use crate::knowledge::chunker::{ChunkConfig, Chunker, chunk_threshold};
use crate::knowledge::embedding::EmbeddingProvider;
use crate::knowledge::index::VectorIndex;
use crate::knowledge::retriever::{COMPRESSION_LIMIT, FILTER_LIMIT, Rag, preview_chunks};
use crate::llm::LlmProvider;
use crate::llm::types::{CompletionRequest, Message};

const REWRITE_INSTRUCTIONS: &str = "Rewrite the text to better achieve the goal. \
Filter out unnecessary information. Do not add new information. \
Respond only with the new text.";

/// Compression policy. Every ratio here is tunable; none is a correctness
/// requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSettings {
    /// Chars assumed per token when turning token ceilings into char allowances.
    pub chars_per_token: u32,
    /// Share of the remaining allowance one message may take.
    pub max_message_share: f32,
    /// Rewrite reply ceiling as a share of `max_context_tokens`.
    pub rewrite_response_ratio: f32,
    /// Allowance multiplier applied on each retry pass.
    pub shrink_factor: f32,
    /// Retry passes only touch messages longer than this.
    pub min_compress_chars: usize,
    pub max_attempts: u32,
    /// Trailing temporary messages that are always candidates.
    pub anchor_tail: usize,
    /// Leading temporary messages skipped by the full sweep.
    pub protected_window: usize,
    /// Chunk-worthiness threshold as chars per context token.
    pub chunk_threshold_ratio: f32,
    pub compression_limit: usize,
    /// Most retrieved chars handed to one rewrite call.
    pub preview_chars: usize,
    pub chunk: ChunkConfig,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            max_message_share: 0.5,
            rewrite_response_ratio: 0.06,
            shrink_factor: 0.5,
            min_compress_chars: 64,
            max_attempts: 4,
            anchor_tail: 2,
            protected_window: 2,
            chunk_threshold_ratio: 0.25,
            compression_limit: COMPRESSION_LIMIT,
            preview_chars: 8000,
            chunk: ChunkConfig::default(),
        }
    }
}

impl ContextSettings {
    pub fn validate(&self) -> Result<(), Error> {
        let unit = |name: &str, v: f32| {
            if v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(Error::Config(format!("{name} must be in (0, 1], got {v}")))
            }
        };
        unit("max_message_share", self.max_message_share)?;
        unit("rewrite_response_ratio", self.rewrite_response_ratio)?;
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(Error::Config(format!(
                "shrink_factor must be in (0, 1), got {}",
                self.shrink_factor
            )));
        }
        if !(self.chunk_threshold_ratio > 0.0) {
            return Err(Error::Config(format!(
                "chunk_threshold_ratio must be positive, got {}",
                self.chunk_threshold_ratio
            )));
        }
        if self.chars_per_token == 0 || self.compression_limit == 0 || self.preview_chars == 0 {
            return Err(Error::Config(
                "chars_per_token, compression_limit and preview_chars must be greater than 0"
                    .into(),
            ));
        }
        self.chunk.validate()
    }
}

/// How a selected message is shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Retrieve, then have the model rewrite toward the target.
    Rewrite,
    /// Retrieve only; no model call.
    Excerpt,
}

/// Produces budget-compliant, goal-directed copies of a chat log.
///
/// Owns the vector indexes built for the messages it compressed, keyed by
/// content hash. An index not used by the latest call is evicted at the end
/// of that call, so one contextualizer is scoped to one session.
pub struct Contextualizer<P> {
    llm: Arc<P>,
    embedder: Arc<dyn EmbeddingProvider>,
    limits: ContextLimits,
    settings: ContextSettings,
    chunker: Chunker,
    indexes: HashMap<u64, VectorIndex>,
    touched: HashSet<u64>,
}

impl<P: LlmProvider> Contextualizer<P> {
    pub fn new(
        llm: Arc<P>,
        embedder: Arc<dyn EmbeddingProvider>,
        limits: ContextLimits,
        settings: ContextSettings,
    ) -> Self {
        let chunker = Chunker::new(
            settings.chunk.clone(),
            chunk_threshold(limits.max_context_tokens, settings.chunk_threshold_ratio),
        );
        Self {
            llm,
            embedder,
            limits,
            settings,
            chunker,
            indexes: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    pub fn budget(&self) -> Result<Budget, Error> {
        Budget::derive(&self.limits)
    }

    /// Number of cached vector indexes.
    pub fn cached_indexes(&self) -> usize {
        self.indexes.len()
    }

    /// Clone `chat`, compress it toward `target` until each partition fits
    /// `budget`, then insert `persona` at the front of the persistent
    /// partition. Persona tokens come out of the persistent ceiling.
    pub async fn contextualize(
        &mut self,
        chat: &ChatLog,
        target: &str,
        budget: Budget,
        persona: &[Message],
    ) -> Result<ChatLog, Error> {
        self.run(chat, target, budget, persona, Mode::Rewrite).await
    }

    /// Like [`Contextualizer::contextualize`] but without model rewrites:
    /// oversized messages are replaced by their most relevant excerpts.
    /// Used where a rough view is enough, e.g. for predicting the next step.
    pub async fn filter(
        &mut self,
        chat: &ChatLog,
        query: &str,
        budget: Budget,
    ) -> Result<ChatLog, Error> {
        self.run(chat, query, budget, &[], Mode::Excerpt).await
    }

    async fn run(
        &mut self,
        chat: &ChatLog,
        target: &str,
        budget: Budget,
        persona: &[Message],
        mode: Mode,
    ) -> Result<ChatLog, Error> {
        let persona_tokens: u32 = persona
            .iter()
            .map(|m| chat.tokenizer().count_message(m))
            .sum();
        let budget = budget.reserve_persistent(persona_tokens)?;
        self.touched.clear();

        let mut view = chat.clone();
        for partition in [Partition::Persistent, Partition::Temporary] {
            self.fit_partition(&mut view, partition, target, budget, mode)
                .await?;
        }

        self.indexes.retain(|key, _| self.touched.contains(key));
        view.insert(Partition::Persistent, persona.to_vec(), 0);
        debug!(
            persistent = view.tokens(Partition::Persistent),
            temporary = view.tokens(Partition::Temporary),
            "contextualized"
        );
        Ok(view)
    }

    async fn fit_partition(
        &mut self,
        view: &mut ChatLog,
        partition: Partition,
        target: &str,
        budget: Budget,
        mode: Mode,
    ) -> Result<(), Error> {
        let ceiling = budget.ceiling(partition);
        let base_allowance = ceiling as usize * self.settings.chars_per_token as usize;

        let first_pass: Vec<usize> = self
            .anchors(view, partition)
            .into_iter()
            .filter(|&i| self.chunker.should_chunk(&view.entries(partition)[i].message))
            .collect();
        if !first_pass.is_empty() {
            self.compress(view, partition, &first_pass, target, base_allowance, mode, true)
                .await?;
        }

        let mut allowance = base_allowance as f64;
        let mut attempt = 0;
        while view.tokens(partition) > ceiling {
            let candidates: Vec<usize> = view
                .entries(partition)
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.message.content_str().chars().count() > self.settings.min_compress_chars
                })
                .map(|(i, _)| i)
                .collect();
            if attempt >= self.settings.max_attempts || candidates.is_empty() {
                return Err(Error::BudgetExceeded {
                    partition,
                    tokens: view.tokens(partition),
                    ceiling,
                });
            }
            attempt += 1;
            allowance *= self.settings.shrink_factor as f64;
            debug!(%partition, attempt, allowance, "partition over budget, retrying");
            self.compress(view, partition, &candidates, target, allowance as usize, mode, false)
                .await?;
        }
        Ok(())
    }

    /// First-pass candidates: the last persistent message, or the trailing
    /// temporary messages plus everything past the protected window.
    fn anchors(&self, view: &ChatLog, partition: Partition) -> Vec<usize> {
        let len = view.len(partition);
        match partition {
            Partition::Persistent => len.checked_sub(1).into_iter().collect(),
            Partition::Temporary => {
                let sweep_from = self
                    .settings
                    .protected_window
                    .min(len.saturating_sub(self.settings.anchor_tail));
                (sweep_from..len).collect()
            }
        }
    }

    /// Shrink the messages at `indices`, biggest first, each to a share of
    /// what is left of `allowance` chars. With `always` set every message is
    /// compressed even when it already fits its share; otherwise only those
    /// over it are.
    ///
    /// A message whose share is zero is left alone. The retry loop reports
    /// the partition as over budget instead of blanking it.
    #[allow(clippy::too_many_arguments)]
    async fn compress(
        &mut self,
        view: &mut ChatLog,
        partition: Partition,
        indices: &[usize],
        target: &str,
        allowance: usize,
        mode: Mode,
        always: bool,
    ) -> Result<(), Error> {
        let untouched: usize = (0..view.len(partition))
            .filter(|i| !indices.contains(i))
            .map(|i| content_chars(view, partition, i))
            .sum();
        let mut remaining = allowance.saturating_sub(untouched);

        let mut order = indices.to_vec();
        order.sort_by_key(|&i| std::cmp::Reverse(content_chars(view, partition, i)));

        let before = view.tokens(partition);
        let mut rewritten = 0;
        for i in order {
            let current = content_chars(view, partition, i);
            let share = (remaining as f64 * self.settings.max_message_share as f64) as usize;
            if share == 0 {
                debug!(%partition, index = i, "no allowance left for message, skipping");
                continue;
            }
            if !always && current <= share {
                remaining = remaining.saturating_sub(current);
                continue;
            }
            let text = view.entries(partition)[i].message.content_str().to_string();
            let compressed = self.compress_text(&text, target, share, mode).await?;
            remaining = remaining.saturating_sub(compressed.chars().count());
            view.replace_content(partition, i, compressed)?;
            rewritten += 1;
        }

        if rewritten > 0 {
            info!(
                %partition,
                messages = rewritten,
                tokens_before = before,
                tokens_after = view.tokens(partition),
                "compressed history"
            );
        }
        Ok(())
    }

    /// Retrieve the parts of `text` relevant to `query` and, in rewrite
    /// mode, have the model rewrite them. The result has at most `max_chars`
    /// chars.
    async fn compress_text(
        &mut self,
        text: &str,
        query: &str,
        max_chars: usize,
        mode: Mode,
    ) -> Result<String, Error> {
        let key = content_hash(text);
        self.touched.insert(key);
        let limit = match mode {
            Mode::Rewrite => self.settings.compression_limit,
            Mode::Excerpt => FILTER_LIMIT,
        };

        let index = match self.indexes.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let mut index = VectorIndex::with_dimension(self.embedder.dimension());
                Rag::new(self.embedder.as_ref(), &mut index)
                    .ingest(self.chunker.chunk(text))
                    .await?;
                e.insert(index)
            }
        };
        let hits = Rag::new(self.embedder.as_ref(), index)
            .limit(limit)
            .only_unique()
            .sort_by_index()
            .query(query)
            .await?;
        let preview_cap = match mode {
            Mode::Rewrite => self.settings.preview_chars,
            Mode::Excerpt => self.chunker.threshold_chars(),
        };
        let preview = preview_chunks(&hits, max_chars.min(preview_cap));

        let output = match mode {
            Mode::Excerpt => preview,
            Mode::Rewrite => self.rewrite(&preview, query).await?,
        };
        Ok(truncate_chars(output, max_chars))
    }

    async fn rewrite(&self, text: &str, goal: &str) -> Result<String, Error> {
        let max_tokens = (self.limits.max_context_tokens as f64
            * self.settings.rewrite_response_ratio as f64)
            .ceil() as u32;
        let request = CompletionRequest {
            messages: vec![
                Message::system(format!("{REWRITE_INSTRUCTIONS}\n\nGoal: {goal}")),
                Message::user(text),
            ],
            functions: vec![],
            max_tokens,
        };
        let response = self.llm.complete(request).await?;
        if response.requested_call().is_some() {
            return Err(Error::MalformedResponse(
                "rewrite came back as a function call".into(),
            ));
        }
        let rewritten = response.message.content_str().trim();
        if rewritten.is_empty() {
            return Err(Error::MalformedResponse("rewrite came back empty".into()));
        }
        Ok(rewritten.to_string())
    }
}

fn content_chars(view: &ChatLog, partition: Partition, index: usize) -> usize {
    view.entries(partition)[index]
        .message
        .content_str()
        .chars()
        .count()
}

fn content_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Keep at most `max_chars` chars.
fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
    }
    text
}
