use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::Error;
use crate::llm::LlmProvider;
use crate::llm::types::{
    CompletionRequest, CompletionResponse, FunctionCall, FunctionDefinition, Message, Role,
    TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completion provider.
///
/// Speaks the `functions` / `function_call` dialect of `/chat/completions`,
/// which maps one-to-one onto [`Message`]: a function result is a message
/// with role `function` and the function's name.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    /// Point the provider at another OpenAI-compatible endpoint
    /// (OpenRouter, a local server, ...). Trailing slashes are ignored.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let body = build_request(&self.model, &request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Auth failures may echo key fragments; keep them out of logs.
            let message = if status.as_u16() == 401 || status.as_u16() == 403 {
                format!("authentication failed (HTTP {})", status.as_u16())
            } else {
                response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<body read error: {e}>"))
            };
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: OpenAiResponse = response.json().await?;
        into_completion_response(api_response)
    }
}

// --- Request building: our types → OpenAI format ---

fn build_request(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request.messages.iter().map(message_to_openai).collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });

    if !request.functions.is_empty() {
        let functions: Vec<serde_json::Value> =
            request.functions.iter().map(function_to_openai).collect();
        body["functions"] = serde_json::Value::Array(functions);
    }

    body
}

fn message_to_openai(msg: &Message) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Function => "function",
    };

    let mut json = serde_json::json!({
        "role": role,
        "content": msg.content,
    });
    if let Some(name) = &msg.name {
        json["name"] = serde_json::Value::String(name.clone());
    }
    if let Some(call) = &msg.function_call {
        json["function_call"] = serde_json::json!({
            "name": call.name,
            "arguments": call.arguments,
        });
    }
    json
}

fn function_to_openai(def: &FunctionDefinition) -> serde_json::Value {
    serde_json::json!({
        "name": def.name,
        "description": def.description,
        "parameters": def.parameters,
    })
}

// --- Response parsing: OpenAI format → our types ---

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<OpenAiFunctionCall>,
    /// Newer servers answer with `tool_calls` even for `functions` requests.
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    function: OpenAiFunctionCall,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn into_completion_response(api: OpenAiResponse) -> Result<CompletionResponse, Error> {
    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::MalformedResponse("empty choices array in response".into()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("completion hit max_tokens, response may be truncated");
    }

    let usage = api.usage.map_or(TokenUsage::default(), |u| TokenUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    let OpenAiMessage {
        content,
        function_call,
        tool_calls,
    } = choice.message;

    let call = function_call.or_else(|| {
        let mut calls = tool_calls.unwrap_or_default();
        if calls.len() > 1 {
            warn!(
                count = calls.len(),
                "model requested several calls, executing only the first"
            );
        }
        (!calls.is_empty()).then(|| calls.swap_remove(0).function)
    });

    if let Some(call) = call {
        let arguments = if call.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            call.arguments
        };
        return Ok(CompletionResponse {
            message: Message {
                role: Role::Assistant,
                content: content.filter(|c| !c.is_empty()),
                name: None,
                function_call: Some(FunctionCall {
                    name: call.name,
                    arguments,
                }),
            },
            usage,
        });
    }

    match content {
        Some(text) => Ok(CompletionResponse::text(text).with_usage(usage)),
        None => Err(Error::MalformedResponse(
            "response has neither content nor a function call".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Vec<Message>, functions: Vec<FunctionDefinition>) -> CompletionRequest {
        CompletionRequest {
            messages,
            functions,
            max_tokens: 512,
        }
    }

    fn parse(value: serde_json::Value) -> Result<CompletionResponse, Error> {
        into_completion_response(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn build_request_minimal() {
        let body = build_request("gpt-4o-mini", &request(vec![Message::user("hello")], vec![]));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body.get("functions").is_none());
    }

    #[test]
    fn build_request_function_roundtrip_messages() {
        let body = build_request(
            "m",
            &request(
                vec![
                    Message::system("be terse"),
                    Message::function_call("read_file", r#"{"path":"a.txt"}"#),
                    Message::function_result("read_file", "contents"),
                ],
                vec![],
            ),
        );
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "assistant");
        assert!(messages[1]["content"].is_null());
        assert_eq!(messages[1]["function_call"]["name"], "read_file");
        assert_eq!(messages[1]["function_call"]["arguments"], r#"{"path":"a.txt"}"#);
        assert_eq!(messages[2]["role"], "function");
        assert_eq!(messages[2]["name"], "read_file");
    }

    #[test]
    fn build_request_with_functions() {
        let def = FunctionDefinition {
            name: "search".into(),
            description: "Search".into(),
            parameters: json!({"type": "object"}),
        };
        let body = build_request("m", &request(vec![Message::user("q")], vec![def]));
        let functions = body["functions"].as_array().unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0]["name"], "search");
        assert_eq!(functions[0]["parameters"]["type"], "object");
    }

    #[test]
    fn parse_text_response() {
        let resp = parse(json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        }))
        .unwrap();
        assert_eq!(resp.message.content_str(), "Hi");
        assert!(resp.requested_call().is_none());
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 2);
    }

    #[test]
    fn parse_function_call_response() {
        let resp = parse(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "function_call": {"name": "on_goal_achieved", "arguments": ""}
                },
                "finish_reason": "function_call"
            }]
        }))
        .unwrap();
        let call = resp.requested_call().unwrap();
        assert_eq!(call.name, "on_goal_achieved");
        assert_eq!(call.arguments, "{}");
        assert_eq!(resp.usage, TokenUsage::default());
    }

    #[test]
    fn parse_tool_calls_takes_first() {
        let resp = parse(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "c1", "type": "function", "function": {"name": "a", "arguments": "{}"}},
                        {"id": "c2", "type": "function", "function": {"name": "b", "arguments": "{}"}}
                    ]
                }
            }]
        }))
        .unwrap();
        assert_eq!(resp.requested_call().unwrap().name, "a");
    }

    #[test]
    fn parse_empty_choices_is_malformed() {
        let err = parse(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn parse_no_content_no_call_is_malformed() {
        let err = parse(json!({"choices": [{"message": {"content": null}}]})).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let provider = OpenAiProvider::new("k", "m").with_base_url("http://localhost:8080/v1/");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
        assert_eq!(provider.model(), "m");
    }
}
