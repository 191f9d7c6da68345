use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::llm::types::Message;
use crate::tokenizer::Tokenizer;

/// Which half of the chat log a message lives in.
///
/// Persistent messages (goal, persona, seeded context) are short and
/// long-lived. Temporary messages (turns, function results) are the ones
/// that get summarized when the budget is tight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Persistent,
    Temporary,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Persistent => f.write_str("persistent"),
            Partition::Temporary => f.write_str("temporary"),
        }
    }
}

/// A message together with its token count.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: Message,
    pub tokens: u32,
}

/// Ordered, partitioned message store with incrementally maintained
/// per-partition token sums.
///
/// Every mutation adjusts the counters by the delta it causes; reads never
/// sum. Content only leaves through [`ChatLog::replace_content`] or by
/// building a new log with [`ChatLog::filtered`] / [`ChatLog::clone_empty`].
#[derive(Clone)]
pub struct ChatLog {
    tokenizer: Arc<dyn Tokenizer>,
    persistent: Vec<ChatEntry>,
    temporary: Vec<ChatEntry>,
    persistent_tokens: u32,
    temporary_tokens: u32,
}

impl fmt::Debug for ChatLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatLog")
            .field("persistent", &self.persistent.len())
            .field("temporary", &self.temporary.len())
            .field("persistent_tokens", &self.persistent_tokens)
            .field("temporary_tokens", &self.temporary_tokens)
            .finish()
    }
}

impl ChatLog {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            persistent: Vec::new(),
            temporary: Vec::new(),
            persistent_tokens: 0,
            temporary_tokens: 0,
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Same tokenizer, no messages. Used to give a delegated sub-agent its
    /// own history.
    pub fn clone_empty(&self) -> Self {
        Self::new(Arc::clone(&self.tokenizer))
    }

    fn parts_mut(&mut self, partition: Partition) -> (&mut Vec<ChatEntry>, &mut u32) {
        match partition {
            Partition::Persistent => (&mut self.persistent, &mut self.persistent_tokens),
            Partition::Temporary => (&mut self.temporary, &mut self.temporary_tokens),
        }
    }

    fn entry(&self, message: Message) -> ChatEntry {
        let tokens = self.tokenizer.count_message(&message);
        ChatEntry { message, tokens }
    }

    pub fn append(&mut self, partition: Partition, message: Message) {
        let entry = self.entry(message);
        let (entries, counter) = self.parts_mut(partition);
        *counter += entry.tokens;
        entries.push(entry);
    }

    /// Insert `messages` before position `at`, keeping their order and the
    /// relative order of everything already there. `at` past the end appends.
    pub fn insert(&mut self, partition: Partition, messages: Vec<Message>, at: usize) {
        let new_entries: Vec<ChatEntry> = messages.into_iter().map(|m| self.entry(m)).collect();
        let added: u32 = new_entries.iter().map(|e| e.tokens).sum();
        let (entries, counter) = self.parts_mut(partition);
        let at = at.min(entries.len());
        entries.splice(at..at, new_entries);
        *counter += added;
    }

    /// Replace the content of one message with a new value. The old message
    /// is not mutated; a copy with the new content takes its slot.
    ///
    /// Returns the new token count of that message.
    pub fn replace_content(
        &mut self,
        partition: Partition,
        index: usize,
        content: impl Into<String>,
    ) -> Result<u32, Error> {
        let len = self.len(partition);
        let Some(existing) = self.entries(partition).get(index) else {
            return Err(Error::Agent(format!(
                "no {partition} message at index {index} (len {len})"
            )));
        };
        let replacement = self.entry(existing.message.with_content(content));
        let (entries, counter) = self.parts_mut(partition);
        let slot = &mut entries[index];
        *counter = *counter - slot.tokens + replacement.tokens;
        *slot = replacement;
        Ok(slot.tokens)
    }

    pub fn entries(&self, partition: Partition) -> &[ChatEntry] {
        match partition {
            Partition::Persistent => &self.persistent,
            Partition::Temporary => &self.temporary,
        }
    }

    /// The last `offset_from_end` entries of a partition (all of them when
    /// the partition is shorter).
    pub fn messages_since(&self, partition: Partition, offset_from_end: usize) -> &[ChatEntry] {
        let entries = self.entries(partition);
        &entries[entries.len().saturating_sub(offset_from_end)..]
    }

    /// All messages in request order: persistent first, then temporary.
    pub fn messages(&self) -> Vec<Message> {
        self.persistent
            .iter()
            .chain(&self.temporary)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Most recent message: last temporary, else last persistent.
    pub fn last(&self) -> Option<&Message> {
        self.temporary
            .last()
            .or_else(|| self.persistent.last())
            .map(|e| &e.message)
    }

    pub fn tokens(&self, partition: Partition) -> u32 {
        match partition {
            Partition::Persistent => self.persistent_tokens,
            Partition::Temporary => self.temporary_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.persistent_tokens + self.temporary_tokens
    }

    pub fn len(&self, partition: Partition) -> usize {
        self.entries(partition).len()
    }

    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.temporary.is_empty()
    }

    /// New log holding only the messages that pass `keep`.
    pub fn filtered(&self, mut keep: impl FnMut(Partition, &Message) -> bool) -> Self {
        let mut out = self.clone_empty();
        for partition in [Partition::Persistent, Partition::Temporary] {
            for entry in self.entries(partition) {
                if keep(partition, &entry.message) {
                    let (entries, counter) = out.parts_mut(partition);
                    *counter += entry.tokens;
                    entries.push(entry.clone());
                }
            }
        }
        out
    }

    /// Sum of stored entry counts per partition `(persistent, temporary)`.
    ///
    /// For verification only; the live counters never come from here.
    pub fn recount(&self) -> (u32, u32) {
        let sum = |entries: &[ChatEntry]| entries.iter().map(|e| e.tokens).sum();
        (sum(&self.persistent), sum(&self.temporary))
    }
}
