//! Language-model access behind a narrow trait, plus the fixed prompt
//! templates the analysis stages fill in.
//!
//! Everything downstream depends on the [`Inference`] trait rather than a
//! concrete client, so pipeline tests run against a scripted mock instead of
//! a live model server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;

pub const CRATE_NAME: &str = "revlens-inference";

pub mod prompts;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference call timed out: {0}")]
    Timeout(String),
    #[error("inference backend error: {0}")]
    Http(String),
    #[error("malformed model output: {0}")]
    Malformed(String),
}

/// Minimal model surface the pipeline needs: free-form text generation and
/// batch text embedding.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub embed_model: String,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "llama3.1".into(),
            embed_model: "nomic-embed-text".into(),
            concurrency: 2,
            timeout: Duration::from_secs(90),
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            config.model = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_EMBED_MODEL") {
            config.embed_model = model;
        }
        config
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for a local Ollama server. Calls are capped by a concurrency
/// semaphore and a per-call timeout; a timed-out call is retried once before
/// the error surfaces.
pub struct OllamaClient {
    client: reqwest::Client,
    config: OllamaConfig,
    limit: Arc<Semaphore>,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::Http(e.to_string()))?;
        let limit = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Ok(Self {
            client,
            config,
            limit,
        })
    }

    async fn post_json(&self, path: &str, body: &JsonValue) -> Result<JsonValue, InferenceError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = format!("{}{}", self.config.base_url, path);

        let mut last_timeout = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tracing::warn!(%url, "inference call timed out, retrying once");
            }
            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(InferenceError::Http(format!(
                            "{} returned status {}",
                            url, status
                        )));
                    }
                    return response
                        .json()
                        .await
                        .map_err(|e| InferenceError::Malformed(e.to_string()));
                }
                Err(err) if err.is_timeout() => {
                    last_timeout = Some(err.to_string());
                }
                Err(err) => return Err(InferenceError::Http(err.to_string())),
            }
        }
        Err(InferenceError::Timeout(
            last_timeout.unwrap_or_else(|| url.clone()),
        ))
    }
}

#[async_trait]
impl Inference for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
        });
        let value = self.post_json("/api/generate", &body).await?;
        let parsed: GenerateResponse = serde_json::from_value(value)
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let body = serde_json::json!({
            "model": self.config.embed_model,
            "input": texts,
        });
        let value = self.post_json("/api/embed", &body).await?;
        let parsed: EmbedResponse = serde_json::from_value(value)
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(InferenceError::Malformed(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

/// Pull the first top-level JSON array out of free-form model output. Models
/// routinely wrap JSON in prose or markdown fences.
pub fn extract_json_array(text: &str) -> Result<JsonValue, InferenceError> {
    let start = text
        .find('[')
        .ok_or_else(|| InferenceError::Malformed("no JSON array in output".into()))?;
    let end = text
        .rfind(']')
        .ok_or_else(|| InferenceError::Malformed("unterminated JSON array".into()))?;
    if end < start {
        return Err(InferenceError::Malformed("unterminated JSON array".into()));
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| InferenceError::Malformed(e.to_string()))
}

/// Like [`extract_json_array`] but for a single JSON object.
pub fn extract_json_object(text: &str) -> Result<JsonValue, InferenceError> {
    let start = text
        .find('{')
        .ok_or_else(|| InferenceError::Malformed("no JSON object in output".into()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| InferenceError::Malformed("unterminated JSON object".into()))?;
    if end < start {
        return Err(InferenceError::Malformed("unterminated JSON object".into()));
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| InferenceError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_array_ignores_surrounding_prose() {
        let text = "Sure! Here is the result:\n```json\n[1, 2, 3]\n```\nHope that helps.";
        let value = extract_json_array(text).unwrap();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn extract_object_spans_nested_braces() {
        let text = "{\"a\": {\"b\": 1}} trailing";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn extract_array_rejects_proseless_garbage() {
        assert!(extract_json_array("no json here").is_err());
        assert!(extract_json_array("] backwards [").is_err());
    }

    #[test]
    fn config_defaults_point_at_local_ollama() {
        let config = OllamaConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434");
        assert!(config.concurrency >= 1);
    }
}
