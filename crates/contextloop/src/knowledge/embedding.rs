use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;

use crate::error::Error;

/// Trait for generating text embeddings.
///
/// Implementations must be deterministic for a given input: index caching
/// relies on re-embedding the same chunk producing the same vector.
#[allow(clippy::type_complexity)]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order.
    fn embed(
        &self,
        texts: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, Error>> + Send + '_>>;

    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embedding provider.
///
/// Calls `POST {base_url}/embeddings` with the configured model.
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dimension: usize,
}

impl OpenAiEmbedding {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model,
            base_url: "https://api.openai.com/v1".into(),
            dimension,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl EmbeddingProvider for OpenAiEmbedding {
    fn embed(
        &self,
        texts: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, Error>> + Send + '_>> {
        let input: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        Box::pin(async move {
            if input.is_empty() {
                return Ok(vec![]);
            }
            let expected = input.len();

            let body = serde_json::json!({
                "model": self.model,
                "input": input,
            });

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Embedding(format!("embedding request failed: {e}")))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_else(|_| "unknown error".into());
                return Err(Error::Embedding(format!(
                    "embedding API returned {status}: {text}"
                )));
            }

            let response: EmbeddingResponse = resp
                .json()
                .await
                .map_err(|e| Error::Embedding(format!("failed to parse embedding response: {e}")))?;

            into_vectors(response, expected)
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Order by the `index` field when present and check the count.
fn into_vectors(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, Error> {
    let mut data = response.data;
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    if data.len() != expected {
        return Err(Error::Embedding(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}
