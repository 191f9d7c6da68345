use crate::llm::types::Message;

/// Fixed per-message cost for role and separators.
pub const MESSAGE_OVERHEAD: u32 = 4;

/// Token counting contract.
///
/// Counts are opaque integers: the chat log only adds and compares them, so
/// any monotone estimate works as long as the same tokenizer is used for the
/// whole session.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> u32;

    /// Tokens for a whole message: overhead, content, function name on
    /// results, and the name plus arguments of a function call.
    fn count_message(&self, message: &Message) -> u32 {
        let content = message.content.as_deref().map_or(0, |c| self.count(c));
        let name = message.name.as_deref().map_or(0, |n| self.count(n));
        let call = message
            .function_call
            .as_ref()
            .map_or(0, |fc| self.count(&fc.name) + self.count(&fc.arguments));
        MESSAGE_OVERHEAD + content + name + call
    }
}

/// Estimate using 4 bytes per token.
///
/// A fast, dependency-free approximation that is reasonable for English and
/// code. Counts bytes, so multi-byte text is over-estimated, never under.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl Tokenizer for CharEstimator {
    fn count(&self, text: &str) -> u32 {
        (text.len() as u32).div_ceil(4)
    }
}
