//! Language-model and embedding facade contracts (spec 1: collaborator,
//! only the trait contract is specified).
//!
//! HTTP implementations talk to an Ollama-compatible endpoint, the same
//! shape the donor codebase's embedder uses (`/api/embed`, `/api/generate`).

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors the LLM/embedding facades can produce (spec 7).
#[derive(Debug, Error)]
pub enum FacadeError {
    /// The HTTP call failed or returned a non-2xx status.
    #[error("facade request failed: {0}")]
    Transport(String),
    /// The call exceeded its deadline.
    #[error("facade call timed out")]
    Timeout,
    /// The response body could not be parsed.
    #[error("malformed facade response: {0}")]
    Malformed(String),
}

impl FacadeError {
    /// Classify this error per spec 7's abstract kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transient,
            Self::Timeout => ErrorKind::Timeout,
            Self::Malformed(_) => ErrorKind::Permanent,
        }
    }
}

/// Generates text completions for the planner and the compaction worker.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`.
    ///
    /// # Errors
    ///
    /// Returns [`FacadeError`] on transport failure, timeout, or a
    /// malformed response.
    async fn generate(&self, prompt: &str) -> Result<String, FacadeError>;
}

/// Computes embeddings for the memory engine's semantic index.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`, returning a vector of the configured dimension.
    ///
    /// # Errors
    ///
    /// Returns [`FacadeError`] on transport failure, timeout, or a
    /// malformed response.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FacadeError>;
}

/// Default HTTP call timeout, seconds.
const FACADE_TIMEOUT_SECS: u64 = 30;

/// Ollama-compatible HTTP client, used for both generation and embedding.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    /// Point the client at `base_url`, requesting completions/embeddings
    /// from `model`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FACADE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.into(), model: model.into() }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, FacadeError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { FacadeError::Timeout } else { FacadeError::Transport(e.to_string()) })?
            .error_for_status()
            .map_err(|e| FacadeError::Transport(e.to_string()))?;

        let parsed: GenerateResponse =
            response.json().await.map_err(|e| FacadeError::Malformed(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FacadeError> {
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { FacadeError::Timeout } else { FacadeError::Transport(e.to_string()) })?
            .error_for_status()
            .map_err(|e| FacadeError::Transport(e.to_string()))?;

        let parsed: EmbedResponse =
            response.json().await.map_err(|e| FacadeError::Malformed(e.to_string()))?;
        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| FacadeError::Malformed("empty embeddings array".to_owned()))
    }
}
