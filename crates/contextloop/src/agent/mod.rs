pub mod events;
pub mod execution;
pub mod planner;
pub mod prediction;
pub mod prompts;
pub mod routing;

use std::collections::HashSet;
use std::time::Duration;

use crate::chat::{ChatLog, Partition};
use crate::function::FunctionSet;
use crate::function::builtins::{GOAL_ACHIEVED, GOAL_FAILED};
use crate::llm::types::Message;

use self::execution::TerminationReason;
use self::prompts::{DEFAULT_LOOP_PREVENTION, EXHAUST_ALL_APPROACHES};

/// A specialized agent: who it is and what it may call.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub name: String,
    /// One line shown to the router.
    pub expertise: String,
    pub persona: String,
    pub functions: FunctionSet,
}

impl AgentDescriptor {
    pub fn new(
        name: impl Into<String>,
        expertise: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            expertise: expertise.into(),
            persona: persona.into(),
            functions: FunctionSet::new(),
        }
    }

    pub fn with_functions(mut self, functions: FunctionSet) -> Self {
        self.functions = functions;
        self
    }

    /// Messages inserted at the front of every view this agent sees.
    pub fn persona_messages(&self) -> Vec<Message> {
        vec![Message::system(self.persona.clone())]
    }
}

/// Decides, from the name of the last successfully executed function,
/// whether and why the loop stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationPredicate {
    pub achieved: HashSet<String>,
    pub failed: HashSet<String>,
}

impl Default for TerminationPredicate {
    fn default() -> Self {
        Self {
            achieved: HashSet::from([GOAL_ACHIEVED.to_string()]),
            failed: HashSet::from([GOAL_FAILED.to_string()]),
        }
    }
}

impl TerminationPredicate {
    pub fn evaluate(&self, function: &str) -> Option<TerminationReason> {
        if self.achieved.contains(function) {
            Some(TerminationReason::GoalAchieved)
        } else if self.failed.contains(function) {
            Some(TerminationReason::GoalFailed)
        } else {
            None
        }
    }
}

/// Knobs of one execution loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Wall-clock limit for the whole run.
    pub timeout: Duration,
    pub max_iterations: Option<usize>,
    /// Appended as a user message after every plain-text response.
    pub loop_prevention_prompt: String,
    /// 0 disables truncation.
    pub max_function_output_bytes: usize,
    pub max_response_tokens: u32,
    pub termination: TerminationPredicate,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_iterations: None,
            loop_prevention_prompt: DEFAULT_LOOP_PREVENTION.to_string(),
            max_function_output_bytes: 16 * 1024,
            max_response_tokens: 1000,
            termination: TerminationPredicate::default(),
        }
    }
}

/// Seed a fresh session: the workspace preview as a system message, the
/// directive to exhaust all approaches, then the goal. All persistent.
pub fn seed_session(chat: &mut ChatLog, directory_preview: &str, goal: &str) {
    chat.append(Partition::Persistent, Message::system(directory_preview));
    chat.append(Partition::Persistent, Message::user(EXHAUST_ALL_APPROACHES));
    chat.append(Partition::Persistent, Message::user(goal));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Role;
    use crate::tokenizer::CharEstimator;
    use std::sync::Arc;

    #[test]
    fn default_predicate_uses_goal_functions() {
        let predicate = TerminationPredicate::default();
        assert_eq!(
            predicate.evaluate("on_goal_achieved"),
            Some(TerminationReason::GoalAchieved)
        );
        assert_eq!(
            predicate.evaluate("on_goal_failed"),
            Some(TerminationReason::GoalFailed)
        );
        assert_eq!(predicate.evaluate("read_file"), None);
    }

    #[test]
    fn custom_predicate() {
        let predicate = TerminationPredicate {
            achieved: HashSet::from(["submit".to_string()]),
            failed: HashSet::new(),
        };
        assert_eq!(predicate.evaluate("submit"), Some(TerminationReason::GoalAchieved));
        assert_eq!(predicate.evaluate("on_goal_achieved"), None);
    }

    #[test]
    fn seeded_session_is_persistent() {
        let mut chat = ChatLog::new(Arc::new(CharEstimator));
        seed_session(&mut chat, "The workspace directory is empty.", "Write a haiku");
        let persistent = chat.entries(Partition::Persistent);
        assert_eq!(persistent.len(), 3);
        assert_eq!(persistent[0].message.role, Role::System);
        assert_eq!(persistent[1].message.content_str(), EXHAUST_ALL_APPROACHES);
        assert_eq!(persistent[2].message.content_str(), "Write a haiku");
        assert_eq!(chat.len(Partition::Temporary), 0);
    }

    #[test]
    fn persona_messages_are_one_system_message() {
        let agent = AgentDescriptor::new("dev", "code", "You write code.");
        let persona = agent.persona_messages();
        assert_eq!(persona.len(), 1);
        assert_eq!(persona[0].role, Role::System);
        assert_eq!(persona[0].content_str(), "You write code.");
    }
}
