pub mod agent;
pub mod budget;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod function;
pub mod knowledge;
pub mod llm;
pub mod tokenizer;
mod util;
pub mod workspace;

pub use agent::events::{LoopEvent, OnEvent};
pub use agent::execution::{
    ExecutionLoop, LoopState, Phase, RunFailure, RunOutput, RunResult, TerminationReason,
};
pub use agent::planner::{AdaptivePlanner, FixedPlanner, FocusedPlanner, TurnPlan, TurnPlanner};
pub use agent::routing::{AgentRouter, RoutedAgent};
pub use agent::{AgentDescriptor, LoopConfig, TerminationPredicate, seed_session};
pub use budget::{Budget, ContextLimits};
pub use chat::{ChatEntry, ChatLog, Partition};
pub use config::ContextloopConfig;
pub use context::{ContextSettings, Contextualizer};
pub use error::Error;
pub use function::{AgentFunction, FunctionOutput, FunctionSet};
pub use knowledge::Chunk;
pub use knowledge::embedding::{EmbeddingProvider, OpenAiEmbedding};
pub use llm::LlmProvider;
pub use llm::openai::OpenAiProvider;
pub use llm::types::{
    CompletionRequest, CompletionResponse, FunctionCall, FunctionDefinition, Message, Role,
    TokenUsage,
};
pub use tokenizer::{CharEstimator, Tokenizer};
pub use workspace::Workspace;
