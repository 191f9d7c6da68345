//! The ask-model / call-function / check-stop state machine.
//!
//! ```text
//! Idle -> AwaitingModel -> FunctionRequested -> Executing -> AwaitingModel
//!                      \-> (plain text, nudged) -> AwaitingModel
//! any state -> Terminated
//! ```
//!
//! Every suspension point (planning, completion, function execution) races
//! one deadline armed when the run starts. Whatever finishes after the
//! deadline is dropped unseen.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::LoopConfig;
use super::events::{EVENT_MAX_PAYLOAD_BYTES, LoopEvent, OnEvent, truncate_for_event};
use super::planner::TurnPlanner;
use crate::chat::{ChatLog, Partition};
use crate::error::Error;
use crate::function::{AgentFunction, FunctionOutput, FunctionSet, validate_args};
use crate::llm::LlmProvider;
use crate::llm::error_class::{ErrorClass, classify};
use crate::llm::types::{CompletionRequest, FunctionCall, Message, TokenUsage};
use crate::util::closest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GoalAchieved,
    GoalFailed,
    Timeout,
    UnrecoverableError,
    /// The run's cancellation token fired.
    Cancelled,
}

impl TerminationReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::GoalAchieved => "goal_achieved",
            Self::GoalFailed => "goal_failed",
            Self::Timeout => "timeout",
            Self::UnrecoverableError => "unrecoverable_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    AwaitingModel,
    FunctionRequested,
    Executing,
    Terminated,
}

/// Observable state of a run. Returned in both outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: usize,
    pub phase: Phase,
    pub last_function_called: Option<String>,
    pub terminated: bool,
    pub termination_reason: Option<TerminationReason>,
    pub function_calls_made: usize,
    pub loop_preventions: usize,
    pub usage: TokenUsage,
}

/// A run that ended with the goal achieved.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub state: LoopState,
    /// Output of the terminal function.
    pub result: String,
}

/// A run that ended any other way.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub state: LoopState,
    pub reason: TerminationReason,
    pub message: String,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} iterations: {}", self.reason, self.state.iteration, self.message)
    }
}

pub type RunResult = Result<RunOutput, RunFailure>;

/// How the loop body stopped when it did not error.
struct Stop {
    reason: TerminationReason,
    message: String,
}

impl Stop {
    fn new(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Drives one goal to termination.
pub struct ExecutionLoop<P> {
    llm: Arc<P>,
    name: String,
    config: LoopConfig,
    on_event: Option<Arc<OnEvent>>,
    cancel: CancellationToken,
}

impl<P: LlmProvider> ExecutionLoop<P> {
    pub fn builder(llm: Arc<P>) -> ExecutionLoopBuilder<P> {
        ExecutionLoopBuilder {
            llm,
            name: "main".into(),
            config: LoopConfig::default(),
            on_event: None,
            cancel: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run until a terminal function succeeds or the run fails. Every
    /// message the loop produces goes to the temporary partition of `chat`.
    pub async fn run(
        &self,
        goal: &str,
        chat: &mut ChatLog,
        planner: &mut dyn TurnPlanner,
    ) -> RunResult {
        let mut state = LoopState::default();
        let deadline = Instant::now() + self.config.timeout;
        self.emit(LoopEvent::RunStarted {
            agent: self.name.clone(),
            goal: truncate_for_event(goal, EVENT_MAX_PAYLOAD_BYTES),
        });
        info!(agent = %self.name, "run started");

        let outcome = self.drive(chat, planner, &mut state, deadline).await;
        self.finish(state, outcome)
    }

    async fn drive(
        &self,
        chat: &mut ChatLog,
        planner: &mut dyn TurnPlanner,
        state: &mut LoopState,
        deadline: Instant,
    ) -> Result<Stop, Error> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Stop::new(TerminationReason::Cancelled, "Run cancelled."));
            }
            if Instant::now() >= deadline {
                return Ok(self.timed_out());
            }
            if let Some(max) = self.config.max_iterations
                && state.iteration >= max
            {
                return Err(Error::Agent(format!(
                    "reached max_iterations ({max}) without a terminal function"
                )));
            }

            state.iteration += 1;
            state.phase = Phase::AwaitingModel;
            debug!(agent = %self.name, iteration = state.iteration, "iteration started");
            self.emit(LoopEvent::IterationStarted {
                agent: self.name.clone(),
                iteration: state.iteration,
            });

            let Some(plan) = bounded(deadline, planner.plan(chat)).await else {
                return Ok(self.timed_out());
            };
            let plan = plan?;
            self.emit(LoopEvent::TurnPlanned {
                agent: self.name.clone(),
                iteration: state.iteration,
                selected: plan.agent.clone(),
                functions: plan.functions.names().map(String::from).collect(),
                persistent_tokens: plan.view.tokens(Partition::Persistent),
                temporary_tokens: plan.view.tokens(Partition::Temporary),
            });

            let request = CompletionRequest {
                messages: plan.view.messages(),
                functions: plan.functions.definitions(),
                max_tokens: self.config.max_response_tokens,
            };
            let started = StdInstant::now();
            let Some(response) = bounded(deadline, self.llm.complete(request)).await else {
                return Ok(self.timed_out());
            };
            let response = response?;
            state.usage += response.usage;
            self.emit(LoopEvent::LlmResponse {
                agent: self.name.clone(),
                iteration: state.iteration,
                usage: response.usage,
                function_call: response.requested_call().map(|c| c.name.clone()),
                text: truncate_for_event(response.message.content_str(), EVENT_MAX_PAYLOAD_BYTES),
                latency_ms: started.elapsed().as_millis() as u64,
            });

            let Some(call) = response.message.function_call.clone() else {
                self.nudge(chat, state, response.message);
                continue;
            };

            state.phase = Phase::FunctionRequested;
            chat.append(Partition::Temporary, response.message);

            let Some(function) = plan.functions.get(&call.name).cloned() else {
                let owner = planner.owner_of(&call.name).map(String::from);
                self.reject(chat, state, &call, owner, &plan.functions);
                state.phase = Phase::AwaitingModel;
                continue;
            };

            state.phase = Phase::Executing;
            state.function_calls_made += 1;
            state.last_function_called = Some(call.name.clone());
            self.emit(LoopEvent::FunctionCallStarted {
                agent: self.name.clone(),
                iteration: state.iteration,
                function: call.name.clone(),
                arguments: truncate_for_event(&call.arguments, EVENT_MAX_PAYLOAD_BYTES),
            });

            let started = StdInstant::now();
            let Some(output) = bounded(deadline, invoke(function.as_ref(), &call)).await else {
                return Ok(self.timed_out());
            };
            let output = output.truncated(self.config.max_function_output_bytes);
            if output.is_error {
                warn!(
                    agent = %self.name,
                    iteration = state.iteration,
                    function = %call.name,
                    error = %output.content,
                    "function returned an error"
                );
            }
            self.emit(LoopEvent::FunctionCallCompleted {
                agent: self.name.clone(),
                iteration: state.iteration,
                function: call.name.clone(),
                title: output.title.clone(),
                is_error: output.is_error,
                duration_ms: started.elapsed().as_millis() as u64,
                output: truncate_for_event(&output.content, EVENT_MAX_PAYLOAD_BYTES),
            });
            chat.append(
                Partition::Temporary,
                Message::function_result(call.name.clone(), output.content.clone()),
            );

            if !output.is_error
                && let Some(reason) = self.config.termination.evaluate(&call.name)
            {
                return Ok(Stop::new(reason, output.content));
            }
            state.phase = Phase::AwaitingModel;
        }
    }

    /// Plain-text response: keep it and push the model back toward calling
    /// a function.
    fn nudge(&self, chat: &mut ChatLog, state: &mut LoopState, message: Message) {
        chat.append(Partition::Temporary, message);
        chat.append(
            Partition::Temporary,
            Message::user(self.config.loop_prevention_prompt.clone()),
        );
        state.loop_preventions += 1;
        state.phase = Phase::AwaitingModel;
        debug!(agent = %self.name, iteration = state.iteration, "no function call, nudging");
        self.emit(LoopEvent::LoopPrevented {
            agent: self.name.clone(),
            iteration: state.iteration,
        });
    }

    /// The model called something it was not offered. Nothing executes; it
    /// gets an error result explaining why.
    fn reject(
        &self,
        chat: &mut ChatLog,
        state: &LoopState,
        call: &FunctionCall,
        owner: Option<String>,
        offered: &FunctionSet,
    ) {
        let content = match &owner {
            Some(owner) => format!(
                "Error: function '{}' is not available right now. It belongs to agent '{owner}'.",
                call.name
            ),
            None => match closest(&call.name, offered.names()) {
                Some(hint) => format!(
                    "Error: unknown function '{}'. Did you mean '{hint}'?",
                    call.name
                ),
                None => format!(
                    "Error: unknown function '{}'. Available functions: {}",
                    call.name,
                    offered.names().collect::<Vec<_>>().join(", ")
                ),
            },
        };
        warn!(
            agent = %self.name,
            iteration = state.iteration,
            function = %call.name,
            owner = owner.as_deref().unwrap_or("-"),
            "rejected function call"
        );
        self.emit(LoopEvent::FunctionRejected {
            agent: self.name.clone(),
            iteration: state.iteration,
            function: call.name.clone(),
            owner,
        });
        chat.append(
            Partition::Temporary,
            Message::function_result(call.name.clone(), content),
        );
    }

    fn timed_out(&self) -> Stop {
        Stop::new(
            TerminationReason::Timeout,
            format!("Timed out after {:?}.", self.config.timeout),
        )
    }

    fn finish(&self, mut state: LoopState, outcome: Result<Stop, Error>) -> RunResult {
        let stop = outcome.unwrap_or_else(|e| {
            let class = classify(&e);
            if class == ErrorClass::ContextOverflow {
                error!(
                    agent = %self.name,
                    iteration = state.iteration,
                    error = %e,
                    "provider reported context overflow; the view exceeded the model window despite budgeting"
                );
            } else {
                error!(
                    agent = %self.name,
                    iteration = state.iteration,
                    class = class.label(),
                    error = %e,
                    "unrecoverable error"
                );
            }
            Stop::new(
                TerminationReason::UnrecoverableError,
                format!("Unrecoverable error encountered: {e}"),
            )
        });

        state.phase = Phase::Terminated;
        state.terminated = true;
        state.termination_reason = Some(stop.reason);

        if stop.reason == TerminationReason::GoalAchieved {
            info!(
                agent = %self.name,
                iterations = state.iteration,
                tokens = state.usage.total(),
                "goal achieved"
            );
            self.emit(LoopEvent::RunCompleted {
                agent: self.name.clone(),
                reason: stop.reason,
                iterations: state.iteration,
                total_usage: state.usage,
                function_calls_made: state.function_calls_made,
            });
            return Ok(RunOutput {
                state,
                result: stop.message,
            });
        }

        info!(
            agent = %self.name,
            iterations = state.iteration,
            reason = %stop.reason,
            "run ended without achieving the goal"
        );
        self.emit(LoopEvent::RunFailed {
            agent: self.name.clone(),
            reason: stop.reason,
            error: truncate_for_event(&stop.message, EVENT_MAX_PAYLOAD_BYTES),
            iterations: state.iteration,
            partial_usage: state.usage,
        });
        Err(RunFailure {
            state,
            reason: stop.reason,
            message: stop.message,
        })
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }
}

/// Race `fut` against the deadline. An already-passed deadline wins even
/// over a ready future.
async fn bounded<T>(deadline: Instant, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = tokio::time::sleep_until(deadline) => None,
        out = fut => Some(out),
    }
}

/// Parse, validate and execute one call. Every failure becomes an error
/// result for the model.
async fn invoke(function: &dyn AgentFunction, call: &FunctionCall) -> FunctionOutput {
    let args: serde_json::Value = match serde_json::from_str(&call.arguments) {
        Ok(args) => args,
        Err(e) => {
            return FunctionOutput::error(
                call.name.clone(),
                format!("Error: arguments are not valid JSON: {e}"),
            );
        }
    };
    if let Err(message) = validate_args(&function.definition().parameters, &args) {
        return FunctionOutput::error(call.name.clone(), format!("Error: {message}"));
    }
    match function.execute(args).await {
        Ok(output) => output,
        Err(e) => FunctionOutput::error(call.name.clone(), format!("Error: {e}")),
    }
}

pub struct ExecutionLoopBuilder<P> {
    llm: Arc<P>,
    name: String,
    config: LoopConfig,
    on_event: Option<Arc<OnEvent>>,
    cancel: Option<CancellationToken>,
}

impl<P: LlmProvider> ExecutionLoopBuilder<P> {
    /// Name carried by every event and log line of this loop.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_event(mut self, callback: Arc<OnEvent>) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Checked at iteration boundaries.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> ExecutionLoop<P> {
        ExecutionLoop {
            llm: self.llm,
            name: self.name,
            config: self.config,
            on_event: self.on_event,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}
