//! Embedding provider trait.
//!
//! Defines the [`EmbeddingProvider`] interface that every embedding backend
//! implements. Concrete HTTP providers (OpenAI, Ollama) live in the
//! `git2vec` app crate; retry and batching policy live in its
//! `ChunkerEmbedder`, so a provider only has to make one attempt per call.

use async_trait::async_trait;

use crate::error::Result;

/// A backend that turns texts into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in input order.
    ///
    /// Implementations make a single attempt and classify failures:
    /// rate limiting as [`Error::RateLimited`](crate::error::Error::RateLimited),
    /// transient server or network errors as retryable
    /// [`Error::ExternalApi`](crate::error::Error::ExternalApi).
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
