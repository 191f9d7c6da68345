#![allow(dead_code)]
//! Scripted collaborators shared by the integration tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use contextloop::agent::prompts::ROUTER_INSTRUCTIONS;
use contextloop::{
    AgentFunction, CharEstimator, ChatLog, CompletionRequest, CompletionResponse,
    EmbeddingProvider, Error, FunctionDefinition, FunctionOutput, LlmProvider, LoopEvent, OnEvent,
};

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Answers function-offering requests from a queue. Routing requests get
/// `route_to`; anything else (next-step prediction, rewrites) echoes the
/// last message back.
pub struct ScriptedProvider {
    responses: Mutex<Vec<CompletionResponse>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    route_to: String,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
        Self::build(responses, "", Duration::ZERO)
    }

    pub fn routing(responses: Vec<CompletionResponse>, route_to: &str) -> Arc<Self> {
        Self::build(responses, route_to, Duration::ZERO)
    }

    /// Every call sleeps `delay` before answering.
    pub fn slow(responses: Vec<CompletionResponse>, delay: Duration) -> Arc<Self> {
        Self::build(responses, "", delay)
    }

    fn build(responses: Vec<CompletionResponse>, route_to: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(vec![]),
            route_to: route_to.into(),
            delay,
        })
    }

    /// Requests that offered functions, i.e. the loop's own completions.
    pub fn turn_requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.functions.is_empty())
            .cloned()
            .collect()
    }
}

impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let is_turn = !request.functions.is_empty();
        let is_routing = request
            .messages
            .first()
            .is_some_and(|m| m.content_str().starts_with(ROUTER_INSTRUCTIONS));
        let echo = request
            .messages
            .last()
            .map(|m| m.content_str().to_string())
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if is_turn {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::Agent("no more scripted responses".into()));
            }
            Ok(responses.remove(0))
        } else if is_routing {
            Ok(CompletionResponse::text(self.route_to.clone()))
        } else {
            Ok(CompletionResponse::text(echo))
        }
    }
}

/// Gives every request the same response.
pub struct FixedReply(pub CompletionResponse);

impl LlmProvider for FixedReply {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, Error> {
        Ok(self.0.clone())
    }
}

/// First turn delegates to the Writer; the second turn (the Writer's
/// first) cancels `token` and answers in plain text. Later turns achieve.
pub struct CancelsInsideDelegate {
    pub token: CancellationToken,
    pub turns: AtomicUsize,
}

impl LlmProvider for CancelsInsideDelegate {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        if request.functions.is_empty() {
            let echo = request.messages.last().map(|m| m.content_str().to_string());
            return Ok(CompletionResponse::text(echo.unwrap_or_default()));
        }
        match self.turns.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(call("delegate_writer", json!({ "task": "draft the release notes" }))),
            1 => {
                self.token.cancel();
                Ok(CompletionResponse::text("Starting on the notes."))
            }
            _ => Ok(achieved("done")),
        }
    }
}

pub fn call(name: &str, arguments: serde_json::Value) -> CompletionResponse {
    CompletionResponse::function_call(name, arguments.to_string())
}

pub fn achieved(message: &str) -> CompletionResponse {
    call("on_goal_achieved", json!({ "message": message }))
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// Similarity grows with text length, so longer parents rank first.
pub struct LengthEmbedding;

impl EmbeddingProvider for LengthEmbedding {
    fn embed(
        &self,
        texts: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, Error>> + Send + '_>> {
        let vectors = texts
            .iter()
            .map(|t| vec![1.0, t.chars().count() as f32 / 100.0])
            .collect();
        Box::pin(async move { Ok(vectors) })
    }

    fn dimension(&self) -> usize {
        2
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// Records how many times it ran.
pub struct CountingFunction {
    name: &'static str,
    pub calls: AtomicUsize,
}

impl CountingFunction {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentFunction for CountingFunction {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name.into(),
            description: format!("Test function {}", self.name),
            parameters: json!({"type": "object"}),
        }
    }

    fn execute(
        &self,
        _args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FunctionOutput::success(self.name, format!("{} call {n}", self.name)))
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn chat() -> ChatLog {
    ChatLog::new(Arc::new(CharEstimator))
}

/// Unique, period-terminated sentences.
pub fn long_text(chars: usize) -> String {
    let mut text = String::new();
    let mut i = 0;
    while text.len() < chars {
        text.push_str(&format!("Entry {i} records shipment {} for the depot. ", i * 13));
        i += 1;
    }
    text.truncate(chars);
    text
}

pub fn event_sink() -> (Arc<OnEvent>, Arc<Mutex<Vec<LoopEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: Arc<OnEvent> = Arc::new(move |e: LoopEvent| sink.lock().unwrap().push(e));
    (callback, seen)
}
