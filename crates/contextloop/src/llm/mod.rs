pub mod error_class;
pub mod openai;
pub mod types;

use crate::llm::types::{CompletionRequest, CompletionResponse};

/// Trait for LLM providers.
///
/// Implementors must be thread-safe (`Send + Sync`) so one provider can be
/// shared by the planner, the contextualizer and delegated sub-agents.
/// Retry policy, if any, belongs to the implementor.
pub trait LlmProvider: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, crate::error::Error>> + Send;
}
