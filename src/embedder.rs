//! Chunking and batched embedding.
//!
//! [`ChunkerEmbedder::process`] splits documents into token windows and
//! embeds them in batches of `batch_size` chunks, with up to `concurrency`
//! batches in flight. A failed batch is retried per the [`RetryPolicy`];
//! when it still fails, its chunks are dropped from the output and counted
//! in [`EmbedOutcome::failed`]. Nothing here aborts the run.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use git2vec_core::chunk::Chunker;
use git2vec_core::embedding::EmbeddingProvider;
use git2vec_core::models::{Chunk, Document};
use git2vec_core::Result;

use crate::config::{ChunkingConfig, EmbeddingConfig};
use crate::retry::RetryPolicy;

/// Chunks that made it through embedding, plus how many did not.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    /// In document order, then chunk index order.
    pub chunks: Vec<Chunk>,
    pub failed: usize,
}

pub struct ChunkerEmbedder {
    chunker: Chunker,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl ChunkerEmbedder {
    /// Without a provider, chunks are produced with no embedding attached.
    pub fn new(chunker: Chunker, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            chunker,
            provider,
            batch_size: 64,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(
        chunking: &ChunkingConfig,
        embedding: &EmbeddingConfig,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let chunker = Chunker::approximate(chunking.max_tokens, chunking.overlap_tokens)?;
        Ok(Self::new(chunker, provider)
            .with_batch_size(embedding.batch_size)
            .with_concurrency(embedding.concurrency)
            .with_retry(RetryPolicy::new(
                embedding.max_attempts,
                Duration::from_millis(embedding.retry_base_ms),
                Duration::from_secs(60),
            )))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref()
    }

    /// Chunk documents without embedding.
    pub fn chunk(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|doc| self.chunker.chunk_document(doc))
            .collect()
    }

    pub async fn process(&self, documents: &[Document]) -> EmbedOutcome {
        let chunks = self.chunk(documents);
        let Some(provider) = &self.provider else {
            return EmbedOutcome { chunks, failed: 0 };
        };

        let mut batches = Vec::new();
        let mut rest = chunks.into_iter().peekable();
        while rest.peek().is_some() {
            batches.push(rest.by_ref().take(self.batch_size).collect::<Vec<_>>());
        }

        let embedded: Vec<_> = stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                let result = self
                    .retry
                    .run("embed batch", || provider.embed(&texts))
                    .await;
                (batch, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut outcome = EmbedOutcome::default();
        for (batch, result) in embedded {
            match result {
                Ok(vectors) => {
                    debug!(chunks = batch.len(), "batch embedded");
                    outcome
                        .chunks
                        .extend(batch.into_iter().zip(vectors).map(|(mut chunk, vector)| {
                            chunk.embedding = Some(vector);
                            chunk
                        }));
                }
                Err(e) => {
                    warn!(
                        chunks = batch.len(),
                        model = provider.model_name(),
                        error = %e,
                        "embedding batch failed; chunks dropped"
                    );
                    outcome.failed += batch.len();
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use git2vec_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns `[len, 1.0]` per text; fails the first `fail_first` calls and
    /// every call containing a text equal to `poison`.
    struct FakeProvider {
        calls: AtomicUsize,
        fail_first: usize,
        poison: Option<String>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl FakeProvider {
        fn new(fail_first: usize, poison: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                poison: poison.map(String::from),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        fn model_name(&self) -> &str {
            "fake"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            let poisoned = self
                .poison
                .as_ref()
                .is_some_and(|p| texts.iter().any(|t| t == p));
            if n < self.fail_first || poisoned {
                return Err(Error::ExternalApi {
                    service: "fake",
                    status: Some(503),
                    message: "unavailable".into(),
                    retryable: true,
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn doc(path: &str, content: &str) -> Document {
        Document::new("a/b", "main", path, content.to_string()).unwrap()
    }

    fn embedder(provider: Arc<FakeProvider>, batch_size: usize) -> ChunkerEmbedder {
        ChunkerEmbedder::new(Chunker::approximate(2, 0).unwrap(), Some(provider))
            .with_batch_size(batch_size)
            .with_concurrency(2)
            .with_retry(RetryPolicy::new(
                3,
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
    }

    #[tokio::test]
    async fn test_without_provider_chunks_are_unembedded() {
        let embedder = ChunkerEmbedder::new(Chunker::approximate(2, 0).unwrap(), None);
        let outcome = embedder.process(&[doc("a.rs", "a b c")]).await;
        assert_eq!(outcome.chunks.len(), 2);
        assert!(outcome.chunks.iter().all(|c| c.embedding.is_none()));
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_batches_and_preserves_order() {
        let provider = Arc::new(FakeProvider::new(0, None));
        let embedder = embedder(provider.clone(), 2);
        let outcome = embedder
            .process(&[doc("a.rs", "a b c d e"), doc("b.rs", "x y")])
            .await;

        let texts: Vec<_> = outcome.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b", "c d", "e", "x y"]);
        assert!(outcome.chunks.iter().all(|c| c.embedding.is_some()));
        assert_eq!(outcome.chunks[2].embedding, Some(vec![1.0, 1.0]));
        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![2, 2]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let provider = Arc::new(FakeProvider::new(2, None));
        let embedder = embedder(provider.clone(), 10);
        let outcome = embedder.process(&[doc("a.rs", "a b c")]).await;
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.chunks.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_dropped_and_counted() {
        let provider = Arc::new(FakeProvider::new(0, Some("x y")));
        let embedder = embedder(provider.clone(), 2);
        let outcome = embedder
            .process(&[doc("a.rs", "a b c d"), doc("b.rs", "x y z")])
            .await;

        // Batches: ["a b", "c d"], ["x y", "z"]; the second always fails.
        let texts: Vec<_> = outcome.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b", "c d"]);
        assert_eq!(outcome.failed, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1 + 3);
    }
}
