use thiserror::Error;

use crate::chat::Partition;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Budget exceeded: {partition} partition holds {tokens} tokens, ceiling is {ceiling}")]
    BudgetExceeded {
        partition: Partition,
        tokens: u32,
        ceiling: u32,
    },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),

    #[error("Workspace error: {0}")]
    Workspace(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::Api {
            status: 429,
            message: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "API error (429): rate limited");

        let err = Error::Routing("no agent named 'poet'".into());
        assert_eq!(err.to_string(), "Routing error: no agent named 'poet'");
    }

    #[test]
    fn budget_exceeded_names_partition() {
        let err = Error::BudgetExceeded {
            partition: Partition::Temporary,
            tokens: 900,
            ceiling: 600,
        };
        assert_eq!(
            err.to_string(),
            "Budget exceeded: temporary partition holds 900 tokens, ceiling is 600"
        );
    }

    #[test]
    fn malformed_response_display_message() {
        let err = Error::MalformedResponse("no choices".into());
        assert_eq!(err.to_string(), "Malformed LLM response: no choices");
    }
}
