//! Turn planners: what the model sees and may call on each iteration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use super::AgentDescriptor;
use super::prediction::NextStepPredictor;
use super::routing::AgentRouter;
use crate::chat::{ChatLog, Partition};
use crate::context::Contextualizer;
use crate::error::Error;
use crate::function::FunctionSet;
use crate::function::builtins::terminal_functions;
use crate::llm::LlmProvider;

/// One turn's plan.
#[derive(Debug, Clone)]
pub struct TurnPlan {
    /// Agent acting this turn.
    pub agent: String,
    /// Bounded copy of the chat, persona first.
    pub view: ChatLog,
    /// Functions offered to the model; anything else is rejected.
    pub functions: FunctionSet,
}

/// Produces a [`TurnPlan`] from the session chat before each completion.
///
/// Uses `Pin<Box<dyn Future>>` so the loop can hold `&mut dyn TurnPlanner`.
pub trait TurnPlanner: Send {
    fn plan<'a>(
        &'a mut self,
        chat: &'a ChatLog,
    ) -> Pin<Box<dyn Future<Output = Result<TurnPlan, Error>> + Send + 'a>>;

    /// Agent that owns `function`, for explaining rejected calls.
    fn owner_of(&self, _function: &str) -> Option<&str> {
        None
    }
}

/// Always the same agent, no routing or compression.
pub struct FixedPlanner {
    agent: AgentDescriptor,
    functions: FunctionSet,
}

impl FixedPlanner {
    pub fn new(agent: AgentDescriptor) -> Self {
        let functions = agent.functions.clone();
        Self { agent, functions }
    }

    /// Offer `extra` on top of the agent's own functions.
    pub fn with_functions(mut self, extra: FunctionSet) -> Self {
        self.functions = self.functions.merged(&extra);
        self
    }
}

impl TurnPlanner for FixedPlanner {
    fn plan<'a>(
        &'a mut self,
        chat: &'a ChatLog,
    ) -> Pin<Box<dyn Future<Output = Result<TurnPlan, Error>> + Send + 'a>> {
        Box::pin(async move {
            let mut view = chat.clone();
            view.insert(Partition::Persistent, self.agent.persona_messages(), 0);
            Ok(TurnPlan {
                agent: self.agent.name.clone(),
                view,
                functions: self.functions.clone(),
            })
        })
    }
}

/// One agent whose view is contextualized toward a fixed target every turn.
/// Used for delegated tasks, where the task is the target.
pub struct FocusedPlanner<P> {
    agent: AgentDescriptor,
    functions: FunctionSet,
    contextualizer: Contextualizer<P>,
    target: String,
}

impl<P: LlmProvider> FocusedPlanner<P> {
    pub fn new(
        agent: AgentDescriptor,
        contextualizer: Contextualizer<P>,
        target: impl Into<String>,
    ) -> Self {
        let functions = agent.functions.clone();
        let target = format!("{}\n{}", agent.persona, target.into());
        Self {
            agent,
            functions,
            contextualizer,
            target,
        }
    }

    /// Offer `extra` on top of the agent's own functions.
    pub fn with_functions(mut self, extra: FunctionSet) -> Self {
        self.functions = self.functions.merged(&extra);
        self
    }
}

impl<P: LlmProvider> TurnPlanner for FocusedPlanner<P> {
    fn plan<'a>(
        &'a mut self,
        chat: &'a ChatLog,
    ) -> Pin<Box<dyn Future<Output = Result<TurnPlan, Error>> + Send + 'a>> {
        Box::pin(async move {
            let budget = self.contextualizer.budget()?;
            let view = self
                .contextualizer
                .contextualize(chat, &self.target, budget, &self.agent.persona_messages())
                .await?;
            Ok(TurnPlan {
                agent: self.agent.name.clone(),
                view,
                functions: self.functions.clone(),
            })
        })
    }
}

/// Predict the next step, route it to an agent, then contextualize the chat
/// toward that agent and step.
///
/// The prediction itself runs on an excerpt-only view filtered against the
/// previous prediction (the goal on the first turn).
pub struct AdaptivePlanner<P> {
    contextualizer: Contextualizer<P>,
    predictor: NextStepPredictor<P>,
    router: AgentRouter<P>,
    terminal: FunctionSet,
    goal: String,
    last_query: Option<String>,
}

impl<P: LlmProvider> AdaptivePlanner<P> {
    pub fn new(
        llm: Arc<P>,
        contextualizer: Contextualizer<P>,
        agents: Vec<AgentDescriptor>,
        goal: impl Into<String>,
    ) -> Result<Self, Error> {
        let max_tokens = contextualizer.limits().max_response_tokens;
        Ok(Self {
            predictor: NextStepPredictor::new(Arc::clone(&llm), max_tokens),
            router: AgentRouter::new(llm, agents)?,
            contextualizer,
            terminal: terminal_functions(),
            goal: goal.into(),
            last_query: None,
        })
    }

    /// Replace the functions offered on every turn regardless of agent.
    pub fn with_terminal_functions(mut self, terminal: FunctionSet) -> Self {
        self.terminal = terminal;
        self
    }

    /// Latest predicted next step.
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    async fn plan_turn(&mut self, chat: &ChatLog) -> Result<TurnPlan, Error> {
        let budget = self.contextualizer.budget()?;
        let query = self.last_query.clone().unwrap_or_else(|| self.goal.clone());

        let rough = self.contextualizer.filter(chat, &query, budget).await?;
        let predicted = self.predictor.predict(&rough).await?;
        self.last_query = Some(predicted.clone());

        let routed = self.router.find_best_agent(&predicted).await?;
        let target = format!("{}\n{}", routed.persona, predicted);
        let view = self
            .contextualizer
            .contextualize(chat, &target, budget, &routed.agent.persona_messages())
            .await?;

        info!(
            agent = %routed.agent.name,
            tokens = view.total_tokens(),
            "planned turn"
        );
        Ok(TurnPlan {
            agent: routed.agent.name.clone(),
            view,
            functions: routed.agent.functions.clone().merged(&self.terminal),
        })
    }
}

impl<P: LlmProvider> TurnPlanner for AdaptivePlanner<P> {
    fn plan<'a>(
        &'a mut self,
        chat: &'a ChatLog,
    ) -> Pin<Box<dyn Future<Output = Result<TurnPlan, Error>> + Send + 'a>> {
        Box::pin(self.plan_turn(chat))
    }

    fn owner_of(&self, function: &str) -> Option<&str> {
        self.router.owner_of(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::prompts::ROUTER_INSTRUCTIONS;
    use crate::budget::ContextLimits;
    use crate::context::ContextSettings;
    use crate::knowledge::embedding::EmbeddingProvider;
    use crate::llm::types::{CompletionRequest, CompletionResponse, Message};
    use crate::tokenizer::CharEstimator;
    use std::sync::Mutex;

    /// Replies "Developer" to routing requests, "run the tests" to
    /// prediction requests.
    struct Scripted {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl LlmProvider for Scripted {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
            let first = request.messages[0].content_str().to_string();
            self.requests.lock().unwrap().push(request);
            if first.starts_with(ROUTER_INSTRUCTIONS) {
                Ok(CompletionResponse::text("Developer"))
            } else {
                Ok(CompletionResponse::text("run the tests"))
            }
        }
    }

    struct ZeroEmbedding;

    impl EmbeddingProvider for ZeroEmbedding {
        fn embed(
            &self,
            texts: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, Error>> + Send + '_>> {
            let n = texts.len();
            Box::pin(async move { Ok(vec![vec![1.0, 0.0]; n]) })
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn agents() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor::new("Developer", "writes code", "You are a developer."),
            AgentDescriptor::new("Writer", "writes prose", "You are a writer."),
        ]
    }

    fn chat() -> ChatLog {
        let mut chat = ChatLog::new(Arc::new(CharEstimator));
        chat.append(Partition::Persistent, Message::user("fix the build"));
        chat
    }

    #[tokio::test]
    async fn fixed_planner_prepends_persona() {
        let mut planner = FixedPlanner::new(agents().remove(0)).with_functions(terminal_functions());
        let chat = chat();
        let plan = planner.plan(&chat).await.unwrap();
        assert_eq!(plan.agent, "Developer");
        assert_eq!(plan.view.len(Partition::Persistent), 2);
        assert_eq!(plan.view.messages()[0].content_str(), "You are a developer.");
        assert_eq!(chat.len(Partition::Persistent), 1, "session chat untouched");
        assert!(plan.functions.contains("on_goal_achieved"));
        assert_eq!(planner.owner_of("on_goal_achieved"), None);
    }

    #[tokio::test]
    async fn focused_planner_keeps_growing_history_within_budget() {
        let llm = Arc::new(Scripted {
            requests: Mutex::new(vec![]),
        });
        let contextualizer = Contextualizer::new(
            Arc::clone(&llm),
            Arc::new(ZeroEmbedding),
            ContextLimits::default(),
            ContextSettings::default(),
        );
        let budget = contextualizer.budget().unwrap();
        let mut planner = FocusedPlanner::new(agents().remove(0), contextualizer, "fix the build")
            .with_functions(terminal_functions());

        let mut chat = chat();
        for i in 0..4 {
            chat.append(Partition::Temporary, Message::function_call("read_file", "{}"));
            chat.append(
                Partition::Temporary,
                Message::function_result("read_file", format!("Line {i} of the build log. ").repeat(600)),
            );
        }
        assert!(chat.tokens(Partition::Temporary) > budget.temporary_tokens);

        let plan = planner.plan(&chat).await.unwrap();
        assert_eq!(plan.agent, "Developer");
        assert_eq!(plan.view.messages()[0].content_str(), "You are a developer.");
        assert!(plan.view.tokens(Partition::Temporary) <= budget.temporary_tokens);
        assert!(plan.view.tokens(Partition::Persistent) <= budget.persistent_tokens);
        assert_eq!(plan.view.len(Partition::Temporary), chat.len(Partition::Temporary));
        assert!(plan.functions.contains("on_goal_achieved"));

        // Rewrites aim at the persona plus the task.
        let requests = llm.requests.lock().unwrap();
        assert!(!requests.is_empty());
        assert!(requests[0].messages[0].content_str().contains("You are a developer.\nfix the build"));
    }

    #[tokio::test]
    async fn adaptive_planner_predicts_routes_and_contextualizes() {
        let llm = Arc::new(Scripted {
            requests: Mutex::new(vec![]),
        });
        let contextualizer = Contextualizer::new(
            Arc::clone(&llm),
            Arc::new(ZeroEmbedding),
            ContextLimits::default(),
            ContextSettings::default(),
        );
        let mut planner =
            AdaptivePlanner::new(Arc::clone(&llm), contextualizer, agents(), "fix the build").unwrap();

        let chat = chat();
        let plan = planner.plan(&chat).await.unwrap();
        assert_eq!(plan.agent, "Developer");
        assert_eq!(plan.view.messages()[0].content_str(), "You are a developer.");
        assert_eq!(planner.last_query(), Some("run the tests"));
        assert_eq!(
            plan.functions.names().collect::<Vec<_>>(),
            ["on_goal_achieved", "on_goal_failed"]
        );

        // Prediction first, then routing; nothing needed compression.
        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].messages[1].content_str(),
            "Next step: run the tests"
        );
    }

    #[tokio::test]
    async fn adaptive_planner_requires_agents() {
        let llm = Arc::new(Scripted {
            requests: Mutex::new(vec![]),
        });
        let contextualizer = Contextualizer::new(
            Arc::clone(&llm),
            Arc::new(ZeroEmbedding),
            ContextLimits::default(),
            ContextSettings::default(),
        );
        assert!(matches!(
            AdaptivePlanner::new(llm, contextualizer, vec![], "g"),
            Err(Error::Config(_))
        ));
    }
}
