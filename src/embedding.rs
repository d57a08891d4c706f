//! HTTP embedding providers.
//!
//! Implementations of [`EmbeddingProvider`]:
//! - **[`OpenAIProvider`]** calls `POST /v1/embeddings`; the key comes from
//!   `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]** calls a local Ollama instance's `/api/embed`.
//!
//! Each call makes exactly one request and classifies the outcome:
//! - HTTP 429 → [`Error::RateLimited`] (honoring `Retry-After`)
//! - HTTP 5xx and network errors → retryable [`Error::ExternalApi`]
//! - other HTTP 4xx, malformed bodies, wrong vector counts or dimensions →
//!   non-retryable [`Error::ExternalApi`]
//!
//! Retries and batching are the caller's job (see
//! [`ChunkerEmbedder`](crate::embedder::ChunkerEmbedder)).
//!
//! Use [`create_provider`] to build the provider named in the configuration:
//!
//! ```rust,no_run
//! # use git2vec::config::EmbeddingConfig;
//! # use git2vec::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! assert!(create_provider(&config).unwrap().is_none());
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use git2vec_core::embedding::EmbeddingProvider;
use git2vec_core::{Error, Result};

use crate::config::EmbeddingConfig;
use crate::retry::{retry_after_header, status_error, transport_error};

/// Build the configured provider, or `None` when embedding is disabled.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIProvider::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaProvider::new(config)?))),
        other => Err(Error::validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

fn required_model_and_dims(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config.model.clone().ok_or_else(|| {
        Error::validation(format!("embedding.model required for {} provider", provider))
    })?;
    let dims = config.dims.filter(|d| *d > 0).ok_or_else(|| {
        Error::validation(format!("embedding.dims required for {} provider", provider))
    })?;
    Ok((model, dims))
}

fn http_client(timeout_secs: u64, service: &'static str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| transport_error(service, e))
}

/// Reject responses whose shape does not match the request.
fn check_vectors(
    service: &'static str,
    vectors: &[Vec<f32>],
    expected: usize,
    dims: usize,
) -> Result<()> {
    if vectors.len() != expected {
        return Err(Error::external(
            service,
            format!("expected {} embeddings, got {}", expected, vectors.len()),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::external(
            service,
            format!("expected {} dimensions, got {}", dims, bad.len()),
        ));
    }
    Ok(())
}

async fn post_json<T: serde::de::DeserializeOwned>(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(service, e))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| Error::external(service, format!("invalid response: {}", e)));
    }
    let retry_after = retry_after_header(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(status_error(service, status, body, retry_after))
}

// ============ OpenAI Provider ============

const OPENAI: &str = "openai";

/// Embedding provider using the OpenAI API.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a provider from configuration, reading `OPENAI_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::validation("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, OPENAI)?;
        Ok(Self {
            client: http_client(config.timeout_secs, OPENAI)?,
            api_key,
            model,
            dims,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
        })
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!(
                "{}/v1/embeddings",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&body);

        let mut response: OpenAIResponse = post_json(OPENAI, request).await?;
        // The API does not promise input order; `index` does.
        response.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = response.data.into_iter().map(|d| d.embedding).collect();
        check_vectors(OPENAI, &vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Ollama Provider ============

const OLLAMA: &str = "ollama";

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, OLLAMA)?;
        Ok(Self {
            client: http_client(config.timeout_secs, OLLAMA)?,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);

        let response: OllamaResponse = post_json(OLLAMA, request).await?;
        check_vectors(OLLAMA, &response.embeddings, texts.len(), self.dims)?;
        Ok(response.embeddings)
    }
}
