use serde::{Deserialize, Serialize};

use crate::llm::types::TokenUsage;
use crate::util::floor_char_boundary;

use super::execution::TerminationReason;

/// Maximum byte size for event payload strings (model text, function I/O).
pub(crate) const EVENT_MAX_PAYLOAD_BYTES: usize = 4096;

/// Cut long payloads at a char boundary and append a
/// `[truncated: N bytes omitted]` suffix.
pub(crate) fn truncate_for_event(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, max_bytes);
    let omitted = text.len() - cut;
    format!("{}[truncated: {omitted} bytes omitted]", &text[..cut])
}

/// Structured events emitted by the execution loop.
///
/// Delivered synchronously through [`OnEvent`]; keep handlers fast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    RunStarted {
        agent: String,
        goal: String,
    },

    IterationStarted {
        agent: String,
        iteration: usize,
    },

    /// The planner picked an agent and produced the bounded view.
    TurnPlanned {
        agent: String,
        iteration: usize,
        /// Agent chosen for this turn.
        selected: String,
        functions: Vec<String>,
        persistent_tokens: u32,
        temporary_tokens: u32,
    },

    LlmResponse {
        agent: String,
        iteration: usize,
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function_call: Option<String>,
        /// Truncated response text.
        #[serde(default)]
        text: String,
        latency_ms: u64,
    },

    /// The model answered without calling a function and was nudged.
    LoopPrevented {
        agent: String,
        iteration: usize,
    },

    FunctionCallStarted {
        agent: String,
        iteration: usize,
        function: String,
        /// Truncated raw arguments.
        #[serde(default)]
        arguments: String,
    },

    FunctionCallCompleted {
        agent: String,
        iteration: usize,
        function: String,
        title: String,
        is_error: bool,
        duration_ms: u64,
        /// Truncated function output.
        #[serde(default)]
        output: String,
    },

    /// The model called a function it was not offered this turn.
    FunctionRejected {
        agent: String,
        iteration: usize,
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },

    RunCompleted {
        agent: String,
        reason: TerminationReason,
        iterations: usize,
        total_usage: TokenUsage,
        function_calls_made: usize,
    },

    RunFailed {
        agent: String,
        reason: TerminationReason,
        error: String,
        iterations: usize,
        partial_usage: TokenUsage,
    },
}

/// Callback type for receiving loop events.
pub type OnEvent = dyn Fn(LoopEvent) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_to_tagged_json() {
        let event = LoopEvent::RunStarted {
            agent: "main".into(),
            goal: "sort the csv".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"run_started""#), "json: {json}");
        assert!(json.contains(r#""agent":"main""#), "json: {json}");
    }

    #[test]
    fn completion_event_roundtrips() {
        let event = LoopEvent::RunCompleted {
            agent: "main".into(),
            reason: TerminationReason::GoalAchieved,
            iterations: 4,
            total_usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            function_calls_made: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""reason":"goal_achieved""#), "json: {json}");
        let back: LoopEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn rejected_event_omits_unknown_owner() {
        let event = LoopEvent::FunctionRejected {
            agent: "main".into(),
            iteration: 1,
            function: "launch".into(),
            owner: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("owner"), "json: {json}");
    }

    #[test]
    fn truncate_for_event_short_passthrough() {
        assert_eq!(truncate_for_event("hello", 10), "hello");
    }

    #[test]
    fn truncate_for_event_long_text() {
        let text = "a".repeat(5000);
        let out = truncate_for_event(&text, 4096);
        assert!(out.starts_with(&"a".repeat(4096)));
        assert!(out.ends_with("[truncated: 904 bytes omitted]"));
    }

    #[test]
    fn truncate_for_event_multibyte() {
        let out = truncate_for_event("ééé", 3);
        assert!(out.starts_with('é'));
        assert!(out.contains("[truncated: 4 bytes omitted]"));
    }
}
