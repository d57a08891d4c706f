//! TOML configuration.
//!
//! Every section is optional; omitted fields take the defaults below.
//! Secrets are never read from the file: API keys come from the process
//! environment (`GITHUB_ACCESS_TOKEN`, `OPENAI_API_KEY`, `PINECONE_API_KEY`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git2vec_core::store::Metric;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub api_url: String,
    pub per_page: u32,
    pub max_pages: u32,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub timeout_secs: u64,
    /// Above this many requested repos, the date window is split into
    /// intervals so no single query hits the search API's result cap.
    pub interval_threshold: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            per_page: 100,
            max_pages: 10,
            max_retries: 5,
            retry_base_ms: 1000,
            retry_max_ms: 60_000,
            timeout_secs: 30,
            interval_threshold: 900,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoaderConfig {
    pub workspace_root: PathBuf,
    pub shallow: bool,
    pub max_file_bytes: u64,
    /// Extensions (with leading dot) that are never loaded.
    pub exclude_extensions: Vec<String>,
    /// If non-empty, only these extensions are loaded.
    pub include_extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub clone_attempts: u32,
    pub skip_empty_repos: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./repodata"),
            shallow: true,
            max_file_bytes: 1024 * 1024,
            exclude_extensions: default_exclude_extensions(),
            include_extensions: Vec::new(),
            exclude_globs: Vec::new(),
            clone_attempts: 3,
            skip_empty_repos: true,
        }
    }
}

fn default_exclude_extensions() -> Vec<String> {
    [
        ".ipynb", ".yaml", ".yml", ".json", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".csv",
        ".txt", ".jsonl", ".struct", ".map", ".obj", ".cleaned", ".dict", ".GIF", ".tiktoken",
        ".lock", ".pack", ".sub", ".zh_CN", ".dae", ".zh_CN_tgt", ".dat", ".tsv", ".tokens",
        ".off", ".sense", ".log", ".bvh", ".onnx", ".gltf", ".cif", ".geojson", ".pkl", ".bin",
        ".pdb", ".sdf", ".xmi", ".out", ".train", ".stl", ".kicad_pcb",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_workers: usize,
    /// How long in-flight loads may keep running after cancellation.
    pub grace_period_secs: u64,
    pub repo_timeout_secs: Option<u64>,
    pub run_timeout_secs: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            grace_period_secs: 30,
            repo_timeout_secs: None,
            run_timeout_secs: None,
        }
    }
}

impl ConcurrencyConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn repo_timeout(&self) -> Option<Duration> {
        self.repo_timeout_secs.map(Duration::from_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

fn default_max_tokens() -> usize {
    512
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible endpoint).
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub timeout_secs: u64,
    /// Embedding batches in flight at once.
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_attempts: 3,
            retry_base_ms: 1000,
            timeout_secs: 30,
            concurrency: 4,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub provider: String,
    pub index_name: String,
    pub metric: Metric,
    pub upsert_batch_size: usize,
    pub api_url: String,
    pub namespace: Option<String>,
    pub cloud: String,
    pub region: String,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            index_name: "git2vec".to_string(),
            metric: Metric::Cosine,
            upsert_batch_size: 100,
            api_url: "https://api.pinecone.io".to_string(),
            namespace: None,
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            timeout_secs: 30,
        }
    }
}

impl VectorStoreConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub prefix: String,
    pub write_batch_size: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./output_data"),
            prefix: "filedata".to_string(),
            write_batch_size: 100,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Discovery
    if config.discovery.per_page == 0 || config.discovery.per_page > 100 {
        bail!("discovery.per_page must be in [1, 100]");
    }
    if config.discovery.max_pages == 0 {
        bail!("discovery.max_pages must be >= 1");
    }
    if config.discovery.interval_threshold == 0 {
        bail!("discovery.interval_threshold must be >= 1");
    }
    let reachable = config.discovery.per_page as usize * config.discovery.max_pages as usize;
    if config.discovery.interval_threshold > reachable {
        bail!(
            "discovery.interval_threshold ({}) must not exceed per_page * max_pages ({})",
            config.discovery.interval_threshold,
            reachable
        );
    }

    // Loader
    if config.loader.clone_attempts == 0 {
        bail!("loader.clone_attempts must be >= 1");
    }

    // Concurrency
    if config.concurrency.max_workers == 0 {
        bail!("concurrency.max_workers must be >= 1");
    }

    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Embedding
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.max_attempts == 0 {
        bail!("embedding.max_attempts must be >= 1");
    }
    if config.embedding.concurrency == 0 {
        bail!("embedding.concurrency must be >= 1");
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Vector store
    match config.vector_store.provider.as_str() {
        "disabled" | "memory" | "pinecone" => {}
        other => bail!(
            "Unknown vector_store provider: '{}'. Must be disabled, memory, or pinecone.",
            other
        ),
    }
    if config.vector_store.is_enabled() {
        if !config.embedding.is_enabled() {
            bail!("vector_store requires an enabled embedding provider");
        }
        if config.vector_store.index_name.trim().is_empty() {
            bail!("vector_store.index_name must not be empty");
        }
        if config.vector_store.upsert_batch_size == 0 {
            bail!("vector_store.upsert_batch_size must be >= 1");
        }
    }

    // Output
    if config.output.write_batch_size == 0 {
        bail!("output.write_batch_size must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.discovery.per_page, 100);
        assert_eq!(config.loader.workspace_root, PathBuf::from("./repodata"));
        assert!(config.loader.exclude_extensions.contains(&".ipynb".to_string()));
        assert_eq!(config.concurrency.max_workers, 8);
        assert_eq!(config.chunking.overlap_tokens, 0);
        assert_eq!(config.embedding.max_attempts, 3);
        assert!(!config.embedding.is_enabled());
        assert!(!config.vector_store.is_enabled());
        assert_eq!(config.output.write_batch_size, 100);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = parse_config(
            r#"
[loader]
workspace_root = "/tmp/ws"

[chunking]
max_tokens = 64
overlap_tokens = 8
"#,
        )
        .unwrap();
        assert_eq!(config.loader.workspace_root, PathBuf::from("/tmp/ws"));
        assert!(config.loader.shallow);
        assert_eq!(config.chunking.max_tokens, 64);
        assert_eq!(config.chunking.overlap_tokens, 8);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/git2vec.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "openai");
        assert_eq!(config.embedding.dims, Some(1536));
        assert_eq!(config.vector_store.provider, "pinecone");
        assert_eq!(config.chunking.overlap_tokens, 64);
        assert!(config.loader.exclude_globs.contains(&"**/vendor/**".to_string()));
    }

    #[test]
    fn test_rejects_overlap_not_below_max() {
        let err = parse_config("[chunking]\nmax_tokens = 8\noverlap_tokens = 8\n").unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_rejects_threshold_beyond_reachable_results() {
        let err = parse_config("[discovery]\nper_page = 50\nmax_pages = 10\n").unwrap_err();
        assert!(err.to_string().contains("interval_threshold (900)"));
        assert!(err.to_string().contains("(500)"));

        let cfg = parse_config(
            "[discovery]\nper_page = 50\nmax_pages = 10\ninterval_threshold = 500\n",
        )
        .unwrap();
        assert_eq!(cfg.discovery.interval_threshold, 500);
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"\n").is_err());
        let config = parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        assert!(config.embedding.is_enabled());
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[vector_store]\nprovider = \"faiss\"\n").is_err());
    }

    #[test]
    fn test_vector_store_requires_embedding() {
        assert!(parse_config("[vector_store]\nprovider = \"memory\"\n").is_err());
        let config = parse_config(
            r#"
[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768

[vector_store]
provider = "memory"
metric = "dotproduct"
"#,
        )
        .unwrap();
        assert_eq!(config.vector_store.metric, Metric::DotProduct);
    }
}
