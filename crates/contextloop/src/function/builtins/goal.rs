use std::future::Future;
use std::pin::Pin;

use serde_json::json;

use crate::error::Error;
use crate::function::{AgentFunction, FunctionOutput};
use crate::llm::types::FunctionDefinition;

pub const GOAL_ACHIEVED: &str = "on_goal_achieved";
pub const GOAL_FAILED: &str = "on_goal_failed";

/// Terminal function: the model reports the goal as done.
pub struct GoalAchieved;

impl AgentFunction for GoalAchieved {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: GOAL_ACHIEVED.into(),
            description: "Call when the goal has been fully achieved. \
                          Summarize the result in `message`."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Final answer or summary of what was done"
                    }
                }
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let message = args
                .get("message")
                .and_then(|v| v.as_str())
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("Goal achieved.");
            Ok(FunctionOutput::success("Goal achieved", message))
        })
    }
}

/// Terminal function: the model gives up after exhausting its approaches.
pub struct GoalFailed;

impl AgentFunction for GoalFailed {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: GOAL_FAILED.into(),
            description: "Call only when every approach has been tried and the goal \
                          cannot be achieved. Explain why in `reason`."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the goal cannot be achieved"
                    }
                }
            }),
        }
    }

    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
        Box::pin(async move {
            let reason = args
                .get("reason")
                .and_then(|v| v.as_str())
                .filter(|r| !r.trim().is_empty())
                .unwrap_or("Goal failed.");
            Ok(FunctionOutput::success("Goal failed", reason))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn achieved_echoes_message() {
        let out = GoalAchieved
            .execute(json!({"message": "sorted 3 files"}))
            .await
            .unwrap();
        assert_eq!(out.content, "sorted 3 files");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn achieved_without_message_uses_default() {
        let out = GoalAchieved.execute(json!({})).await.unwrap();
        assert_eq!(out.content, "Goal achieved.");
    }

    #[tokio::test]
    async fn failed_reports_reason_as_success_output() {
        let out = GoalFailed
            .execute(json!({"reason": "no network"}))
            .await
            .unwrap();
        assert_eq!(out.content, "no network");
        // Terminal functions must not be error results or they never terminate.
        assert!(!out.is_error);
    }
}
