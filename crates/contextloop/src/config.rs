use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::agent::events::OnEvent;
use crate::agent::prompts::DEFAULT_LOOP_PREVENTION;
use crate::agent::{AgentDescriptor, LoopConfig, TerminationPredicate};
use crate::budget::ContextLimits;
use crate::context::ContextSettings;
use crate::function::FunctionSet;
use crate::function::builtins::{
    Delegate, DelegateContext, GOAL_ACHIEVED, GOAL_FAILED, WORKSPACE_FUNCTIONS, delegate_name, workspace_function,
};
use crate::knowledge::chunker::ChunkConfig;
use crate::knowledge::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;
use crate::tokenizer::Tokenizer;
use crate::util::closest;
use crate::workspace::Workspace;

const SUPPORTED_PROVIDERS: [&str; 1] = ["openai"];

/// Top-level configuration loaded from `contextloop.toml`.
#[derive(Debug, Deserialize)]
pub struct ContextloopConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default, rename = "loop")]
    pub run: LoopTable,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// LLM and embedding provider configuration.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    /// Override for OpenAI-compatible gateways.
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Needed only for models whose dimension is not the adapter default.
    pub embedding_dimension: Option<usize>,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

/// `[context]`: limits, compression ratios and chunking parameters.
/// Missing keys take the library defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_tokens: u32,
    pub max_response_tokens: u32,
    pub safety_margin: u32,
    pub persistent_ratio: f32,
    pub chars_per_token: u32,
    pub max_message_share: f32,
    pub rewrite_response_ratio: f32,
    pub shrink_factor: f32,
    pub min_compress_chars: usize,
    pub max_attempts: u32,
    pub anchor_tail: usize,
    pub protected_window: usize,
    pub chunk_threshold_ratio: f32,
    pub compression_limit: usize,
    pub preview_chars: usize,
    pub max_parent_chars: usize,
    pub child_chars: usize,
    pub child_overlap: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let limits = ContextLimits::default();
        let settings = ContextSettings::default();
        Self {
            max_context_tokens: limits.max_context_tokens,
            max_response_tokens: limits.max_response_tokens,
            safety_margin: limits.safety_margin,
            persistent_ratio: limits.persistent_ratio,
            chars_per_token: settings.chars_per_token,
            max_message_share: settings.max_message_share,
            rewrite_response_ratio: settings.rewrite_response_ratio,
            shrink_factor: settings.shrink_factor,
            min_compress_chars: settings.min_compress_chars,
            max_attempts: settings.max_attempts,
            anchor_tail: settings.anchor_tail,
            protected_window: settings.protected_window,
            chunk_threshold_ratio: settings.chunk_threshold_ratio,
            compression_limit: settings.compression_limit,
            preview_chars: settings.preview_chars,
            max_parent_chars: settings.chunk.max_parent_chars,
            child_chars: settings.chunk.child_chars,
            child_overlap: settings.chunk.child_overlap,
        }
    }
}

impl ContextConfig {
    pub fn limits(&self) -> ContextLimits {
        ContextLimits {
            max_context_tokens: self.max_context_tokens,
            max_response_tokens: self.max_response_tokens,
            safety_margin: self.safety_margin,
            persistent_ratio: self.persistent_ratio,
        }
    }

    pub fn settings(&self) -> ContextSettings {
        ContextSettings {
            chars_per_token: self.chars_per_token,
            max_message_share: self.max_message_share,
            rewrite_response_ratio: self.rewrite_response_ratio,
            shrink_factor: self.shrink_factor,
            min_compress_chars: self.min_compress_chars,
            max_attempts: self.max_attempts,
            anchor_tail: self.anchor_tail,
            protected_window: self.protected_window,
            chunk_threshold_ratio: self.chunk_threshold_ratio,
            compression_limit: self.compression_limit,
            preview_chars: self.preview_chars,
            chunk: ChunkConfig {
                max_parent_chars: self.max_parent_chars,
                child_chars: self.child_chars,
                child_overlap: self.child_overlap,
            },
        }
    }
}

/// `[loop]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopTable {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub max_iterations: Option<usize>,
    pub loop_prevention_prompt: Option<String>,
    /// 0 disables truncation.
    #[serde(default = "default_max_function_output_bytes")]
    pub max_function_output_bytes: usize,
}

impl Default for LoopTable {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_iterations: None,
            loop_prevention_prompt: None,
            max_function_output_bytes: default_max_function_output_bytes(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_max_function_output_bytes() -> usize {
    16 * 1024
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub expertise: String,
    pub persona: String,
    /// Built-in function names: workspace functions or `delegate_<agent>`.
    #[serde(default)]
    pub functions: Vec<String>,
}

impl ContextloopConfig {
    /// Parse and validate a TOML config string.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<(), Error> {
        if !SUPPORTED_PROVIDERS.contains(&self.provider.name.as_str()) {
            return Err(Error::Config(format!(
                "unknown provider '{}': supported providers are {}",
                self.provider.name,
                SUPPORTED_PROVIDERS.join(", ")
            )));
        }
        if self.provider.model.trim().is_empty() {
            return Err(Error::Config("provider.model must not be empty".into()));
        }
        if self.provider.embedding_dimension == Some(0) {
            return Err(Error::Config(
                "provider.embedding_dimension must be at least 1".into(),
            ));
        }
        self.context.limits().validate()?;
        self.context.settings().validate()?;

        if self.run.timeout_seconds == 0 {
            return Err(Error::Config("loop.timeout_seconds must be at least 1".into()));
        }
        if self.run.max_iterations == Some(0) {
            return Err(Error::Config("loop.max_iterations must be at least 1".into()));
        }

        self.validate_agents()
    }

    fn validate_agents(&self) -> Result<(), Error> {
        if self.agents.is_empty() {
            return Err(Error::Config("at least one [[agents]] entry is required".into()));
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(Error::Config("agent name must not be empty".into()));
            }
            if !names.insert(agent.name.to_lowercase()) {
                return Err(Error::Config(format!("duplicate agent name '{}'", agent.name)));
            }
            if agent.persona.trim().is_empty() {
                return Err(Error::Config(format!(
                    "agent '{}' has an empty persona",
                    agent.name
                )));
            }
        }

        let delegates: Vec<String> = self.agents.iter().map(|a| delegate_name(&a.name)).collect();
        let mut known: Vec<&str> = WORKSPACE_FUNCTIONS.to_vec();
        known.extend([GOAL_ACHIEVED, GOAL_FAILED]);
        known.extend(delegates.iter().map(String::as_str));

        for agent in &self.agents {
            for function in &agent.functions {
                if !known.contains(&function.as_str()) {
                    let hint = closest(function, known.iter().copied())
                        .map(|h| format!(" (did you mean '{h}'?)"))
                        .unwrap_or_default();
                    return Err(Error::Config(format!(
                        "agent '{}' lists unknown function '{function}'{hint}",
                        agent.name
                    )));
                }
                if *function == delegate_name(&agent.name) {
                    return Err(Error::Config(format!(
                        "agent '{}' cannot delegate to itself",
                        agent.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            timeout: Duration::from_secs(self.run.timeout_seconds),
            max_iterations: self.run.max_iterations,
            loop_prevention_prompt: self
                .run
                .loop_prevention_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_LOOP_PREVENTION.to_string()),
            max_function_output_bytes: self.run.max_function_output_bytes,
            max_response_tokens: self.context.max_response_tokens,
            termination: TerminationPredicate::default(),
        }
    }

    /// Build the agent roster. Workspace functions are bound to
    /// `workspace`; a `delegate_<agent>` function runs that agent with its
    /// own workspace functions only, so delegation is one level deep.
    ///
    /// Delegated runs are contextualized with this config's `[context]`
    /// table, stop when `cancel` fires and report to `on_event`.
    pub fn build_agents<P: LlmProvider + 'static>(
        &self,
        llm: &Arc<P>,
        embedder: Arc<dyn EmbeddingProvider>,
        workspace: &Arc<Workspace>,
        tokenizer: Arc<dyn Tokenizer>,
        cancel: &CancellationToken,
        on_event: Option<&Arc<OnEvent>>,
    ) -> Vec<AgentDescriptor> {
        let base: Vec<AgentDescriptor> = self
            .agents
            .iter()
            .map(|agent| {
                let functions: FunctionSet = agent
                    .functions
                    .iter()
                    .filter_map(|name| workspace_function(name, workspace))
                    .collect();
                AgentDescriptor::new(&agent.name, &agent.expertise, &agent.persona)
                    .with_functions(functions)
            })
            .collect();

        let loop_config = self.loop_config();
        let context = DelegateContext {
            tokenizer,
            embedder,
            limits: self.context.limits(),
            settings: self.context.settings(),
        };
        self.agents
            .iter()
            .zip(&base)
            .map(|(agent, descriptor)| {
                let mut functions = descriptor.functions.clone();
                for target in &base {
                    if agent.functions.contains(&delegate_name(&target.name)) {
                        let mut delegate = Delegate::new(
                            Arc::clone(llm),
                            target.clone(),
                            loop_config.clone(),
                            context.clone(),
                        )
                        .cancel_token(cancel.clone());
                        if let Some(callback) = on_event {
                            delegate = delegate.on_event(Arc::clone(callback));
                        }
                        functions.insert(Arc::new(delegate));
                    }
                }
                descriptor.clone().with_functions(functions)
            })
            .collect()
    }
}
