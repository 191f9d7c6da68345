//! Agent selection by LLM classification.
//!
//! Every turn the predicted next step is shown to the model together with
//! each registered agent's name and expertise; the reply must name exactly
//! one of them. Anything else is an error, never a guess.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::AgentDescriptor;
use super::prompts::ROUTER_INSTRUCTIONS;
use crate::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{CompletionRequest, FunctionDefinition, Message};

const ROUTER_MAX_TOKENS: u32 = 32;

/// The agent chosen for one turn.
#[derive(Debug, Clone)]
pub struct RoutedAgent {
    pub agent: AgentDescriptor,
    /// Definitions of the agent's own functions.
    pub functions: Vec<FunctionDefinition>,
    pub persona: String,
    /// Every known function name mapped to its owning agent.
    pub all_functions: Arc<HashMap<String, String>>,
}

/// Chooses among a fixed set of agents.
pub struct AgentRouter<P> {
    llm: Arc<P>,
    agents: Vec<AgentDescriptor>,
    owners: Arc<HashMap<String, String>>,
}

impl<P: LlmProvider> AgentRouter<P> {
    /// Agent names must be non-empty and unique ignoring case.
    pub fn new(llm: Arc<P>, agents: Vec<AgentDescriptor>) -> Result<Self, Error> {
        if agents.is_empty() {
            return Err(Error::Config("router needs at least one agent".into()));
        }
        let mut seen = HashMap::new();
        let mut owners = HashMap::new();
        for agent in &agents {
            if agent.name.trim().is_empty() {
                return Err(Error::Config("agent name must not be empty".into()));
            }
            if seen.insert(agent.name.to_lowercase(), ()).is_some() {
                return Err(Error::Config(format!("duplicate agent name '{}'", agent.name)));
            }
            for function in agent.functions.names() {
                owners
                    .entry(function.to_string())
                    .or_insert_with(|| agent.name.clone());
            }
        }
        Ok(Self {
            llm,
            agents,
            owners: Arc::new(owners),
        })
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    /// Owning agent of a function, if any agent has it.
    pub fn owner_of(&self, function: &str) -> Option<&str> {
        self.owners.get(function).map(String::as_str)
    }

    /// Pick the agent for `predicted_step`. With a single registered agent
    /// no model call is made.
    pub async fn find_best_agent(&self, predicted_step: &str) -> Result<RoutedAgent, Error> {
        let agent = match self.agents.as_slice() {
            [only] => {
                debug!(agent = %only.name, "single agent registered, skipping classification");
                only
            }
            _ => {
                let response = self.llm.complete(self.classification_request(predicted_step)).await?;
                let reply = response.message.content_str();
                self.match_reply(reply).ok_or_else(|| {
                    let known: Vec<&str> = self.agents.iter().map(|a| a.name.as_str()).collect();
                    Error::Routing(format!(
                        "model replied '{}', which is not one of: {}",
                        reply.trim(),
                        known.join(", ")
                    ))
                })?
            }
        };

        info!(agent = %agent.name, "routed turn");
        Ok(RoutedAgent {
            agent: agent.clone(),
            functions: agent.functions.definitions(),
            persona: agent.persona.clone(),
            all_functions: Arc::clone(&self.owners),
        })
    }

    fn classification_request(&self, predicted_step: &str) -> CompletionRequest {
        let roster: Vec<String> = self
            .agents
            .iter()
            .map(|a| format!("- {}: {}", a.name, a.expertise))
            .collect();
        CompletionRequest {
            messages: vec![
                Message::system(format!(
                    "{ROUTER_INSTRUCTIONS}\n\nAgents:\n{}",
                    roster.join("\n")
                )),
                Message::user(format!("Next step: {predicted_step}")),
            ],
            functions: vec![],
            max_tokens: ROUTER_MAX_TOKENS,
        }
    }

    /// Case-insensitive match ignoring surrounding quotes and punctuation.
    fn match_reply(&self, reply: &str) -> Option<&AgentDescriptor> {
        let cleaned = reply
            .trim()
            .trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .to_lowercase();
        self.agents
            .iter()
            .find(|a| a.name.to_lowercase() == cleaned)
    }
}
