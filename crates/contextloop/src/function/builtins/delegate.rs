use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::events::OnEvent;
use crate::agent::execution::ExecutionLoop;
use crate::agent::planner::FocusedPlanner;
use crate::agent::{AgentDescriptor, LoopConfig};
use crate::budget::ContextLimits;
use crate::chat::{ChatLog, Partition};
use crate::context::{ContextSettings, Contextualizer};
use crate::error::Error;
use crate::function::{AgentFunction, FunctionOutput};
use crate::knowledge::embedding::EmbeddingProvider;
use crate::llm::LlmProvider;
use crate::llm::types::{FunctionDefinition, Message};
use crate::tokenizer::Tokenizer;

use super::{str_arg, terminal_functions};

/// Function name for delegating to `agent_name`: `delegate_` followed by the
/// lowercased name with anything outside `[a-z0-9_]` replaced by `_`.
pub fn delegate_name(agent_name: &str) -> String {
    let slug: String = agent_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("delegate_{slug}")
}

/// What a delegated run needs to keep its own history within budget.
#[derive(Clone)]
pub struct DelegateContext {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub limits: ContextLimits,
    pub settings: ContextSettings,
}

/// Runs a sub-agent on a task with its own chat log and execution loop,
/// returning the sub-agent's outcome as the function output.
///
/// Every run gets a fresh contextualizer, so vector indexes never outlive
/// the delegated task.
pub struct Delegate<P> {
    llm: Arc<P>,
    agent: AgentDescriptor,
    config: LoopConfig,
    context: DelegateContext,
    on_event: Option<Arc<OnEvent>>,
    cancel: CancellationToken,
}

impl<P: LlmProvider> Delegate<P> {
    pub fn new(
        llm: Arc<P>,
        agent: AgentDescriptor,
        config: LoopConfig,
        context: DelegateContext,
    ) -> Self {
        Self {
            llm,
            agent,
            config,
            context,
            on_event: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn on_event(mut self, callback: Arc<OnEvent>) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Parent run's token. Each delegated run listens on a child of it.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn delegate(&self, task: &str, context: Option<&str>) -> FunctionOutput {
        let mut chat = ChatLog::new(Arc::clone(&self.context.tokenizer));
        chat.append(Partition::Persistent, Message::user(task));
        if let Some(context) = context {
            chat.append(
                Partition::Persistent,
                Message::user(format!("Additional context: {context}")),
            );
        }

        let contextualizer = Contextualizer::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.context.embedder),
            self.context.limits,
            self.context.settings.clone(),
        );
        let mut planner = FocusedPlanner::new(self.agent.clone(), contextualizer, task)
            .with_functions(terminal_functions());
        let mut builder = ExecutionLoop::builder(Arc::clone(&self.llm))
            .name(format!("delegate:{}", self.agent.name))
            .config(self.config.clone())
            .cancel_token(self.cancel.child_token());
        if let Some(callback) = &self.on_event {
            builder = builder.on_event(Arc::clone(callback));
        }

        info!(agent = %self.agent.name, "delegating task");
        let title = format!("Delegated to {}", self.agent.name);
        match builder.build().run(task, &mut chat, &mut planner).await {
            Ok(output) => FunctionOutput::success(title, output.result),
            Err(failure) => FunctionOutput::error(
                title,
                format!("{} ended with {}: {}", self.agent.name, failure.reason, failure.message),
            ),
        }
    }
}

impl<P: LlmProvider> AgentFunction for Delegate<P> {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: delegate_name(&self.agent.name),
            description: format!(
                "Hand a self-contained task to the {} agent ({}). \
                 It works on its own history and returns its final result.",
                self.agent.name, self.agent.expertise
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "Complete description of the task"
                    },
                    "context": {
                        "type": "string",
                        "description": "Facts the agent needs that are not in the task"
                    }
                },
                "required": ["task"]
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let task = str_arg(&args, "task")?;
            let context = args
                .get("context")
                .and_then(|v| v.as_str())
                .filter(|c| !c.trim().is_empty());
            Ok(self.delegate(task, context).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{CompletionRequest, CompletionResponse};
    use crate::tokenizer::CharEstimator;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<CompletionResponse>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(vec![]),
            })
        }
    }

    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::Agent("no more mock responses".into()));
            }
            Ok(responses.remove(0))
        }
    }

    struct UnitEmbedding;

    impl EmbeddingProvider for UnitEmbedding {
        fn embed(
            &self,
            texts: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, Error>> + Send + '_>> {
            let n = texts.len();
            Box::pin(async move { Ok(vec![vec![1.0]; n]) })
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    fn context() -> DelegateContext {
        DelegateContext {
            tokenizer: Arc::new(CharEstimator),
            embedder: Arc::new(UnitEmbedding),
            limits: ContextLimits::default(),
            settings: ContextSettings::default(),
        }
    }

    fn delegate(llm: Arc<ScriptedProvider>) -> Delegate<ScriptedProvider> {
        Delegate::new(
            llm,
            AgentDescriptor::new("Web Researcher", "finds facts online", "You research."),
            LoopConfig::default(),
            context(),
        )
    }

    #[test]
    fn name_is_slugged() {
        assert_eq!(delegate_name("Web Researcher"), "delegate_web_researcher");
        assert_eq!(delegate_name("dev-ops"), "delegate_dev_ops");
        let llm = ScriptedProvider::new(vec![]);
        assert_eq!(delegate(llm).definition().name, "delegate_web_researcher");
    }

    #[tokio::test]
    async fn returns_sub_agent_result() {
        let llm = ScriptedProvider::new(vec![CompletionResponse::function_call(
            "on_goal_achieved",
            r#"{"message":"Rust 2024 shipped in 1.85"}"#,
        )]);
        let out = delegate(llm.clone())
            .execute(json!({"task": "find the edition release", "context": "use docs"}))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "Rust 2024 shipped in 1.85");
        assert_eq!(out.title, "Delegated to Web Researcher");

        // Sub-agent sees only its own seeded history plus its persona.
        let requests = llm.requests.lock().unwrap();
        let contents: Vec<&str> = requests[0]
            .messages
            .iter()
            .map(|m| m.content_str())
            .collect();
        assert_eq!(
            contents,
            ["You research.", "find the edition release", "Additional context: use docs"]
        );
    }

    #[tokio::test]
    async fn sub_agent_failure_is_an_error_result() {
        let llm = ScriptedProvider::new(vec![CompletionResponse::function_call(
            "on_goal_failed",
            r#"{"reason":"offline"}"#,
        )]);
        let out = delegate(llm)
            .execute(json!({"task": "browse"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("goal_failed"), "got {}", out.content);
        assert!(out.content.contains("offline"), "got {}", out.content);
    }

    #[tokio::test]
    async fn cancelled_parent_stops_sub_agent() {
        let parent = CancellationToken::new();
        parent.cancel();
        let llm = ScriptedProvider::new(vec![CompletionResponse::function_call(
            "on_goal_achieved",
            r#"{"message":"too late"}"#,
        )]);
        let out = delegate(llm.clone())
            .cancel_token(parent)
            .execute(json!({"task": "browse"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("cancelled"), "got {}", out.content);
        assert!(llm.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sub_agent_events_reach_the_parent_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<OnEvent> = Arc::new(move |e: crate::agent::events::LoopEvent| {
            sink.lock().unwrap().push(e)
        });
        let llm = ScriptedProvider::new(vec![CompletionResponse::function_call(
            "on_goal_achieved",
            r#"{"message":"done"}"#,
        )]);
        delegate(llm)
            .on_event(callback)
            .execute(json!({"task": "browse"}))
            .await
            .unwrap();
        assert!(seen.lock().unwrap().iter().any(|e| matches!(
            e,
            crate::agent::events::LoopEvent::RunStarted { agent, .. } if agent == "delegate:Web Researcher"
        )));
    }

    #[tokio::test]
    async fn missing_task_is_rejected() {
        let llm = ScriptedProvider::new(vec![]);
        let err = delegate(llm).execute(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("'task'"));
    }
}
