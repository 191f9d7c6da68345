use std::sync::Arc;

use tracing::debug;

use super::prompts::{GENERIC_PERSONA, NEXT_STEP_QUESTION};
use crate::chat::ChatLog;
use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{CompletionRequest, Message};

/// Asks the model what the assistant should do next, before any agent is
/// chosen. The answer drives both routing and retrieval.
pub struct NextStepPredictor<P> {
    llm: Arc<P>,
    max_tokens: u32,
}

impl<P: LlmProvider> NextStepPredictor<P> {
    pub fn new(llm: Arc<P>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// `view` should already fit the budget; it is sent as is.
    pub async fn predict(&self, view: &ChatLog) -> Result<String, Error> {
        let mut messages = vec![Message::system(GENERIC_PERSONA)];
        messages.extend(view.messages());
        messages.push(Message::user(NEXT_STEP_QUESTION));

        let response = self
            .llm
            .complete(CompletionRequest {
                messages,
                functions: vec![],
                max_tokens: self.max_tokens,
            })
            .await?;
        let predicted = response.message.content_str().trim().to_string();
        if predicted.is_empty() {
            return Err(Error::MalformedResponse(
                "next-step prediction came back empty".into(),
            ));
        }
        debug!(predicted = %predicted, "predicted next step");
        Ok(predicted)
    }
}
