pub mod builtins;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::llm::types::FunctionDefinition;

/// Output of a function execution.
///
/// `title` is a one-line label for event streams ("Read notes.md");
/// `content` is what the model sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionOutput {
    pub title: String,
    pub content: String,
    pub is_error: bool,
}

impl FunctionOutput {
    pub fn success(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            is_error: true,
        }
    }

    /// Truncate content if it exceeds `max_bytes`, preserving UTF-8 validity.
    ///
    /// When truncated, appends a `[truncated: N bytes omitted]` suffix so the
    /// model knows data was cut. The suffix is not counted toward
    /// `max_bytes`. A `max_bytes` of 0 means no limit.
    pub fn truncated(mut self, max_bytes: usize) -> Self {
        if max_bytes == 0 || self.content.len() <= max_bytes {
            return self;
        }
        let cut = crate::util::floor_char_boundary(&self.content, max_bytes);
        let omitted = self.content.len() - cut;
        self.content.truncate(cut);
        self.content
            .push_str(&format!("\n\n[truncated: {omitted} bytes omitted]"));
        self
    }
}

/// A function the model can call.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility so functions can be
/// stored as `Arc<dyn AgentFunction>`.
pub trait AgentFunction: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    /// Run with already-validated arguments. An `Err` is reported to the
    /// model as an error result; it does not stop the loop.
    fn execute(
        &self,
        args: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>>;
}

/// Validate arguments against a function's JSON Schema.
///
/// The error message is meant for the model so it can correct the call.
pub fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // A broken schema should not block every call.
            tracing::warn!(error = %e, "invalid function schema, skipping validation");
            return Ok(());
        }
    };

    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("Argument validation failed: {}", errors.join("; ")))
    }
}

/// Functions keyed by name, in registration order.
#[derive(Clone, Default)]
pub struct FunctionSet {
    functions: Vec<(String, Arc<dyn AgentFunction>)>,
}

impl std::fmt::Debug for FunctionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FunctionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function; one with the same name is replaced in place.
    pub fn insert(&mut self, function: Arc<dyn AgentFunction>) {
        let name = function.definition().name;
        match self.functions.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = function,
            None => self.functions.push((name, function)),
        }
    }

    pub fn with(mut self, function: Arc<dyn AgentFunction>) -> Self {
        self.insert(function);
        self
    }

    /// Union; `other` wins on name clashes.
    pub fn merged(mut self, other: &FunctionSet) -> Self {
        for (_, function) in &other.functions {
            self.insert(Arc::clone(function));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentFunction>> {
        self.functions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(n, _)| n.as_str())
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.functions.iter().map(|(_, f)| f.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FromIterator<Arc<dyn AgentFunction>> for FunctionSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn AgentFunction>>>(iter: I) -> Self {
        let mut set = FunctionSet::new();
        for function in iter {
            set.insert(function);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Named(&'static str, &'static str);

    impl AgentFunction for Named {
        fn definition(&self) -> FunctionDefinition {
            FunctionDefinition {
                name: self.0.into(),
                description: self.1.into(),
                parameters: json!({"type": "object"}),
            }
        }

        fn execute(
            &self,
            _args: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<FunctionOutput, Error>> + Send + '_>> {
            Box::pin(async move { Ok(FunctionOutput::success(self.0, "ok")) })
        }
    }

    #[test]
    fn output_truncated_noop_within_limit() {
        let out = FunctionOutput::success("t", "short").truncated(100);
        assert_eq!(out.content, "short");
    }

    #[test]
    fn output_truncated_cuts_and_marks() {
        let out = FunctionOutput::error("t", "e".repeat(200)).truncated(50);
        assert!(out.content.starts_with(&"e".repeat(50)));
        assert!(out.content.ends_with("[truncated: 150 bytes omitted]"));
        assert!(out.is_error);
    }

    #[test]
    fn output_truncated_preserves_utf8() {
        let out = FunctionOutput::success("t", "ééééé").truncated(5);
        assert!(out.content.starts_with("éé"));
        assert!(out.content.contains("[truncated: 6 bytes omitted]"));
    }

    #[test]
    fn output_truncated_zero_is_noop() {
        let out = FunctionOutput::success("t", "content").truncated(0);
        assert_eq!(out.content, "content");
    }

    #[test]
    fn validate_accepts_valid_args() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        assert!(validate_args(&schema, &json!({"path": "a.txt"})).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        let err = validate_args(&schema, &json!({})).unwrap_err();
        assert!(err.starts_with("Argument validation failed"), "got: {err}");
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}}
        });
        assert!(validate_args(&schema, &json!({"path": 42})).is_err());
    }

    #[test]
    fn validate_skips_invalid_schema() {
        let schema = json!({"type": "not-a-type"});
        assert!(validate_args(&schema, &json!({})).is_ok());
    }

    #[test]
    fn function_set_replaces_same_name_in_place() {
        let set = FunctionSet::new()
            .with(Arc::new(Named("a", "first")))
            .with(Arc::new(Named("b", "b")))
            .with(Arc::new(Named("a", "second")));
        assert_eq!(set.names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(set.get("a").unwrap().definition().description, "second");
        assert!(!set.contains("c"));
    }

    #[test]
    fn function_set_merge_and_collect() {
        let left: FunctionSet = [Arc::new(Named("a", "")) as Arc<dyn AgentFunction>]
            .into_iter()
            .collect();
        let right = FunctionSet::new().with(Arc::new(Named("b", "")));
        let merged = left.merged(&right);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.definitions()[1].name, "b");
    }

    #[tokio::test]
    async fn function_is_object_safe_and_runs() {
        let f: Arc<dyn AgentFunction> = Arc::new(Named("x", ""));
        let out = f.execute(json!({})).await.unwrap();
        assert_eq!(out.title, "x");
        assert!(!out.is_error);
    }
}
