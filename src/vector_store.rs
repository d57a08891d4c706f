//! Vector store output.
//!
//! [`VectorStoreSink`] owns an explicit [`VectorIndex`] handle for the
//! length of a run. It makes sure the target index exists with the right
//! dimension, then upserts embedded chunks in fixed-size batches keyed by
//! chunk id, so re-processing the same content overwrites instead of
//! duplicating.
//!
//! [`PineconeIndex`] implements [`VectorIndex`] over the Pinecone REST API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use git2vec_core::models::Chunk;
use git2vec_core::store::memory::InMemoryIndex;
use git2vec_core::store::{
    CreateOutcome, IndexSpec, MetadataValue, Metric, VectorIndex, VectorRecord,
};
use git2vec_core::{Error, Result};

use crate::config::VectorStoreConfig;
use crate::retry::{retry_after_header, status_error, transport_error, RetryPolicy};

/// Counts from one [`VectorStoreSink::upsert`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub upserted: usize,
    /// Embedded chunks whose batch could not be written.
    pub failed: usize,
}

pub struct VectorStoreSink {
    index: Arc<dyn VectorIndex>,
    name: String,
    metric: Metric,
    upsert_batch_size: usize,
    retry: RetryPolicy,
}

impl VectorStoreSink {
    pub fn new(index: Arc<dyn VectorIndex>, name: impl Into<String>, metric: Metric) -> Self {
        Self {
            index,
            name: name.into(),
            metric,
            upsert_batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_upsert_batch_size(mut self, size: usize) -> Self {
        self.upsert_batch_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn index_name(&self) -> &str {
        &self.name
    }

    /// Create the index if it is absent. An existing index with the same
    /// dimension is left alone; one with a different dimension is an error.
    pub async fn ensure_index(&self, dimension: usize) -> Result<()> {
        if let Some(existing) = self.index.describe_index(&self.name).await? {
            return check_dimension(&existing, dimension);
        }

        let spec = IndexSpec {
            name: self.name.clone(),
            dimension,
            metric: self.metric,
        };
        match self.index.create_index(&spec).await? {
            CreateOutcome::Created => {
                info!(index = %self.name, dimension, metric = %self.metric, "index created");
                Ok(())
            }
            CreateOutcome::AlreadyExists => {
                debug!(index = %self.name, "index created concurrently");
                match self.index.describe_index(&self.name).await? {
                    Some(existing) => check_dimension(&existing, dimension),
                    None => Ok(()),
                }
            }
        }
    }

    /// Upsert every chunk that carries an embedding. A batch that still
    /// fails after retries is counted, not propagated.
    pub async fn upsert(&self, chunks: &[Chunk]) -> UpsertOutcome {
        let records: Vec<VectorRecord> = chunks.iter().filter_map(to_record).collect();
        let mut outcome = UpsertOutcome::default();

        for batch in records.chunks(self.upsert_batch_size) {
            let result = self
                .retry
                .run("vector upsert", || self.index.upsert(&self.name, batch))
                .await;
            match result {
                Ok(n) => outcome.upserted += n,
                Err(e) => {
                    warn!(index = %self.name, vectors = batch.len(), error = %e, "upsert batch failed");
                    outcome.failed += batch.len();
                }
            }
        }
        outcome
    }
}

fn check_dimension(existing: &IndexSpec, dimension: usize) -> Result<()> {
    if existing.dimension != dimension {
        return Err(Error::validation(format!(
            "index '{}' has dimension {}, embeddings have {}",
            existing.name, existing.dimension, dimension
        )));
    }
    Ok(())
}

fn to_record(chunk: &Chunk) -> Option<VectorRecord> {
    let values = chunk.embedding.clone()?;
    let mut metadata = BTreeMap::new();
    metadata.insert("repo".to_string(), MetadataValue::Text(chunk.repo.clone()));
    metadata.insert("path".to_string(), MetadataValue::Text(chunk.path.clone()));
    metadata.insert(
        "chunk_index".to_string(),
        MetadataValue::Integer(i64::from(chunk.index)),
    );
    metadata.insert(
        "token_count".to_string(),
        MetadataValue::Integer(chunk.token_count as i64),
    );
    metadata.insert(
        "content_hash".to_string(),
        MetadataValue::Text(chunk.content_hash.clone()),
    );
    metadata.insert("text".to_string(), MetadataValue::Text(chunk.text.clone()));
    Some(VectorRecord {
        id: chunk.id.clone(),
        values,
        metadata,
    })
}

/// Build the configured index backend, or `None` when disabled.
pub fn create_index(config: &VectorStoreConfig) -> Result<Option<Arc<dyn VectorIndex>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "memory" => Ok(Some(Arc::new(InMemoryIndex::new()))),
        "pinecone" => Ok(Some(Arc::new(PineconeIndex::new(config)?))),
        other => Err(Error::validation(format!(
            "unknown vector_store provider: {}",
            other
        ))),
    }
}

// ============ Pinecone ============

const PINECONE: &str = "pinecone";
const PINECONE_API_VERSION: &str = "2024-07";

/// [`VectorIndex`] over the Pinecone control and data plane REST APIs.
///
/// The data plane host of each index is looked up once and cached.
pub struct PineconeIndex {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    namespace: Option<String>,
    cloud: String,
    region: String,
    hosts: Mutex<HashMap<String, String>>,
    ready_poll: Duration,
    ready_timeout: Duration,
}

#[derive(Deserialize)]
struct IndexDescription {
    name: String,
    dimension: usize,
    metric: Metric,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    status: Option<IndexStatus>,
}

#[derive(Deserialize)]
struct IndexStatus {
    #[serde(default)]
    ready: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: Option<usize>,
}

impl PineconeIndex {
    /// Create a client from configuration, reading `PINECONE_API_KEY`.
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| Error::validation("PINECONE_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &VectorStoreConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| transport_error(PINECONE, e))?;
        Ok(Self {
            client,
            api_key,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            cloud: config.cloud.clone(),
            region: config.region.clone(),
            hosts: Mutex::new(HashMap::new()),
            ready_poll: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(120),
        })
    }

    /// How often and how long to wait for a new index to become ready.
    pub fn with_ready_polling(mut self, poll: Duration, timeout: Duration) -> Self {
        self.ready_poll = poll;
        self.ready_timeout = timeout;
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
    }

    async fn describe(&self, name: &str) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", self.api_url, name);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| transport_error(PINECONE, e))?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PINECONE, status, body, retry_after));
        }
        let description: IndexDescription = response
            .json()
            .await
            .map_err(|e| Error::external(PINECONE, format!("invalid describe response: {}", e)))?;
        if let Some(host) = &description.host {
            self.cache_host(name, host);
        }
        Ok(Some(description))
    }

    async fn wait_until_ready(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            if let Some(description) = self.describe(name).await? {
                let ready = description.status.as_ref().is_some_and(|s| s.ready);
                if ready && description.host.is_some() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ExternalApi {
                    service: PINECONE,
                    status: None,
                    message: format!("index '{}' not ready after {:?}", name, self.ready_timeout),
                    retryable: true,
                });
            }
            tokio::time::sleep(self.ready_poll).await;
        }
    }

    fn cache_host(&self, name: &str, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.insert(name.to_string(), host.to_string());
    }

    fn cached_host(&self, name: &str) -> Option<String> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.get(name).cloned()
    }

    async fn host(&self, name: &str) -> Result<String> {
        if let Some(host) = self.cached_host(name) {
            return Ok(host);
        }
        self.describe(name)
            .await?
            .and_then(|d| d.host)
            .ok_or_else(|| Error::validation(format!("index '{}' does not exist", name)))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn describe_index(&self, name: &str) -> Result<Option<IndexSpec>> {
        Ok(self.describe(name).await?.map(|d| IndexSpec {
            name: d.name,
            dimension: d.dimension,
            metric: d.metric,
        }))
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome> {
        let body = serde_json::json!({
            "name": spec.name,
            "dimension": spec.dimension,
            "metric": spec.metric,
            "spec": {
                "serverless": { "cloud": self.cloud, "region": self.region }
            }
        });
        let url = format!("{}/indexes", self.api_url);
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PINECONE, e))?;
        let status = response.status();

        let outcome = if status.as_u16() == 409 {
            CreateOutcome::AlreadyExists
        } else if status.is_success() {
            CreateOutcome::Created
        } else {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PINECONE, status, body, retry_after));
        };

        self.wait_until_ready(&spec.name).await?;
        Ok(outcome)
    }

    async fn upsert(&self, index: &str, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let host = self.host(index).await?;
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{}", host)
        };

        let mut body = serde_json::json!({ "vectors": records });
        if let Some(namespace) = &self.namespace {
            body["namespace"] = serde_json::Value::String(namespace.clone());
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("{}/vectors/upsert", base.trim_end_matches('/')),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PINECONE, e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PINECONE, status, body, retry_after));
        }
        let parsed: UpsertResponse = response
            .json()
            .await
            .map_err(|e| Error::external(PINECONE, format!("invalid upsert response: {}", e)))?;
        Ok(parsed.upserted_count.unwrap_or(records.len()))
    }
}
