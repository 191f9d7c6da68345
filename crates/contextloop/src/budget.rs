use crate::chat::{ChatLog, Partition};
use crate::error::Error;

/// Model context limits and the persistent/temporary split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextLimits {
    pub max_context_tokens: u32,
    /// Reserved for the model's reply.
    pub max_response_tokens: u32,
    /// Slack for tokenizer estimate error.
    pub safety_margin: u32,
    /// Share of the usable window given to the persistent partition.
    pub persistent_ratio: f32,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            max_response_tokens: 1000,
            safety_margin: 200,
            persistent_ratio: 0.25,
        }
    }
}

impl ContextLimits {
    pub fn validate(&self) -> Result<(), Error> {
        let reserved = self.max_response_tokens as u64 + self.safety_margin as u64;
        if reserved >= self.max_context_tokens as u64 {
            return Err(Error::Config(format!(
                "max_response_tokens ({}) + safety_margin ({}) leaves no room in a {}-token context",
                self.max_response_tokens, self.safety_margin, self.max_context_tokens
            )));
        }
        if !(self.persistent_ratio > 0.0 && self.persistent_ratio < 1.0) {
            return Err(Error::Config(format!(
                "persistent_ratio must be in (0, 1), got {}",
                self.persistent_ratio
            )));
        }
        Ok(())
    }

    /// Tokens left for history once the reply and margin are reserved.
    pub fn usable_tokens(&self) -> u32 {
        self.max_context_tokens
            .saturating_sub(self.max_response_tokens)
            .saturating_sub(self.safety_margin)
    }
}

/// Per-partition token ceilings for one LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub persistent_tokens: u32,
    pub temporary_tokens: u32,
}

impl Budget {
    /// Split the usable window: persistent gets `persistent_ratio` (rounded
    /// down), temporary gets the rest, so the two always sum to the usable
    /// total.
    pub fn derive(limits: &ContextLimits) -> Result<Self, Error> {
        limits.validate()?;
        let usable = limits.usable_tokens();
        let persistent = (usable as f64 * limits.persistent_ratio as f64).floor() as u32;
        Ok(Self {
            persistent_tokens: persistent,
            temporary_tokens: usable - persistent,
        })
    }

    pub fn ceiling(&self, partition: Partition) -> u32 {
        match partition {
            Partition::Persistent => self.persistent_tokens,
            Partition::Temporary => self.temporary_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.persistent_tokens + self.temporary_tokens
    }

    /// Copy with `tokens` taken out of the persistent ceiling, e.g. for a
    /// persona that will be inserted after compression.
    pub fn reserve_persistent(&self, tokens: u32) -> Result<Self, Error> {
        if tokens > self.persistent_tokens {
            return Err(Error::BudgetExceeded {
                partition: Partition::Persistent,
                tokens,
                ceiling: self.persistent_tokens,
            });
        }
        Ok(Self {
            persistent_tokens: self.persistent_tokens - tokens,
            ..*self
        })
    }

    /// First partition over its ceiling, if any.
    pub fn overflow(&self, chat: &ChatLog) -> Option<Partition> {
        [Partition::Persistent, Partition::Temporary]
            .into_iter()
            .find(|&p| chat.tokens(p) > self.ceiling(p))
    }

    pub fn check(&self, chat: &ChatLog) -> Result<(), Error> {
        match self.overflow(chat) {
            Some(partition) => Err(Error::BudgetExceeded {
                partition,
                tokens: chat.tokens(partition),
                ceiling: self.ceiling(partition),
            }),
            None => Ok(()),
        }
    }
}
