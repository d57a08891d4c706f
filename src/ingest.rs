//! Pipeline orchestration.
//!
//! Coordinates one full run: discovery → concurrent load → chunking and
//! embedding → vector store and/or Parquet output. Per-repository,
//! per-batch embedding, and per-batch upsert failures are recorded in the
//! returned [`PipelineRun`] and never stop the run. Discovery failure,
//! index setup failure, and batch flush failure are fatal; the run summary
//! up to that point travels with the error.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use git2vec_core::models::{PipelineRun, RepoDescriptor};
use git2vec_core::{Error, Result};

use crate::batch_writer::BatchWriter;
use crate::config::{Config, ConcurrencyConfig, OutputConfig};
use crate::connector_git::{GitLoader, RepoLoader};
use crate::discovery::{DiscoveryQuery, GitHubSearch, RepoSource, SortKey, SortOrder};
use crate::embedder::ChunkerEmbedder;
use crate::embedding::create_provider;
use crate::orchestrator::{LoadOrchestrator, RepoLoadResult};
use crate::vector_store::{create_index, VectorStoreSink};
use crate::workspace;

/// Per-invocation parameters.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub n_repos: usize,
    pub last_n_days: u32,
    pub language: Option<String>,
    pub sort: SortKey,
    pub order: SortOrder,
    /// Overrides `output.write_batch_size` when set.
    pub write_batch_size: Option<usize>,
    /// Remove each clone once its documents are extracted.
    pub delete: bool,
}

impl PipelineParams {
    fn query(&self) -> DiscoveryQuery {
        DiscoveryQuery {
            n_repos: self.n_repos,
            last_n_days: self.last_n_days,
            language: self.language.clone(),
            sort: self.sort,
            order: self.order,
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn RepoSource>,
    loader: Arc<dyn RepoLoader>,
    embedder: ChunkerEmbedder,
    sink: Option<VectorStoreSink>,
    output: Option<OutputConfig>,
    workspace_root: PathBuf,
    concurrency: ConcurrencyConfig,
    skip_empty_repos: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn RepoSource>,
        loader: Arc<dyn RepoLoader>,
        embedder: ChunkerEmbedder,
    ) -> Self {
        Self {
            source,
            loader,
            embedder,
            sink: None,
            output: None,
            workspace_root: PathBuf::from("./repodata"),
            concurrency: ConcurrencyConfig::default(),
            skip_empty_repos: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up the real GitHub, git, embedding, and vector store clients.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = Arc::new(GitHubSearch::from_env(&config.discovery)?);
        let loader = Arc::new(GitLoader::new(&config.loader)?);
        let provider = create_provider(&config.embedding)?;
        let embedder = ChunkerEmbedder::from_config(&config.chunking, &config.embedding, provider)?;
        let sink = create_index(&config.vector_store)?.map(|index| {
            VectorStoreSink::new(
                index,
                config.vector_store.index_name.clone(),
                config.vector_store.metric,
            )
            .with_upsert_batch_size(config.vector_store.upsert_batch_size)
        });

        let mut pipeline = Self::new(source, loader, embedder)
            .with_workspace_root(config.loader.workspace_root.clone())
            .with_concurrency(config.concurrency.clone())
            .with_skip_empty_repos(config.loader.skip_empty_repos);
        pipeline.sink = sink;
        if config.output.enabled {
            pipeline.output = Some(config.output.clone());
        }
        Ok(pipeline)
    }

    pub fn with_sink(mut self, sink: VectorStoreSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_skip_empty_repos(mut self, skip: bool) -> Self {
        self.skip_empty_repos = skip;
        self
    }

    /// Token that stops the run from scheduling further repositories.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline once.
    ///
    /// A fatal error returns [`Error::RunAborted`] carrying the partial
    /// [`PipelineRun`], so counters, per-repository failures, and the
    /// artifacts already on disk are never lost.
    pub async fn run(&self, params: &PipelineParams) -> Result<PipelineRun> {
        let mut run = PipelineRun::new();
        let mut writer = self.output.as_ref().map(|o| {
            BatchWriter::new(
                o.dir.clone(),
                o.prefix.clone(),
                params.write_batch_size.unwrap_or(o.write_batch_size),
            )
        });

        if params.delete {
            workspace::remove_if_empty(&self.workspace_root);
        }
        let result = self.execute(params, &mut run, writer.as_mut()).await;
        if params.delete {
            workspace::remove_if_empty(&self.workspace_root);
        }

        if let Some(writer) = &writer {
            run.batches_written = writer.files().len() as u64;
            run.artifacts = writer
                .files()
                .iter()
                .map(|p| p.display().to_string())
                .collect();
        }
        run.finalize();

        match result {
            Ok(()) => {
                info!(
                    succeeded = run.repos_succeeded,
                    failed = run.repos_failed,
                    documents = run.documents_loaded,
                    chunks = run.chunks_embedded,
                    batches = run.batches_written,
                    "pipeline finished"
                );
                Ok(run)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    succeeded = run.repos_succeeded,
                    batches = run.batches_written,
                    "pipeline aborted"
                );
                run.fatal = Some(e.to_string());
                Err(Error::RunAborted {
                    run: Box::new(run),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn execute(
        &self,
        params: &PipelineParams,
        run: &mut PipelineRun,
        mut writer: Option<&mut BatchWriter>,
    ) -> Result<()> {
        let repos = self.source.get_top_repos(&params.query()).await?;
        run.repos_discovered = repos.len() as u64;

        let (repos, empty): (Vec<RepoDescriptor>, Vec<RepoDescriptor>) = repos
            .into_iter()
            .partition(|r| !(self.skip_empty_repos && r.size_kb == 0));
        for repo in &empty {
            info!(repo = %repo.id(), "skipping empty repository");
        }
        run.repos_skipped = empty.len() as u64;

        if let (Some(sink), Some(provider)) = (&self.sink, self.embedder.provider()) {
            sink.ensure_index(provider.dims()).await?;
        }

        let cancel = self.cancel.child_token();
        let timer = self.concurrency.run_timeout().map(|limit| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(limit_secs = limit.as_secs(), "run timeout reached; cancelling");
                cancel.cancel();
            })
        });

        let orchestrator = LoadOrchestrator::new(Arc::clone(&self.loader), self.concurrency.max_workers)
            .with_grace_period(self.concurrency.grace_period())
            .with_repo_timeout(self.concurrency.repo_timeout())
            .with_delete(params.delete)
            .with_cancellation(cancel.clone());

        run.repos_attempted = repos.len() as u64;
        let mut results = orchestrator.spawn(repos);

        let mut outcome = Ok(());
        while let Some(result) = results.recv().await {
            if let Err(e) = self.handle(result, run, writer.as_deref_mut()).await {
                outcome = Err(e);
                break;
            }
        }
        if outcome.is_ok() {
            if let Some(writer) = writer {
                outcome = writer.finish().map(|_| ());
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        if outcome.is_err() {
            // Let in-flight loads wind down so their workspaces are removed.
            cancel.cancel();
            while results.recv().await.is_some() {}
        }
        outcome
    }

    async fn handle(
        &self,
        result: RepoLoadResult,
        run: &mut PipelineRun,
        writer: Option<&mut BatchWriter>,
    ) -> Result<()> {
        let RepoLoadResult { repo, outcome } = result;
        let docs = match outcome {
            Ok(docs) => docs,
            Err(failure) => {
                run.record_failure(failure);
                return Ok(());
            }
        };

        run.repos_succeeded += 1;
        run.documents_loaded += docs.documents.len() as u64;
        run.files_skipped += docs.skipped.len() as u64;

        let embedded = self.embedder.process(&docs.documents).await;
        run.chunks_embedded += embedded
            .chunks
            .iter()
            .filter(|c| c.embedding.is_some())
            .count() as u64;
        run.chunks_failed += embedded.failed as u64;

        if let Some(sink) = &self.sink {
            let upserted = sink.upsert(&embedded.chunks).await;
            run.vectors_upserted += upserted.upserted as u64;
            run.vectors_failed += upserted.failed as u64;
        }

        if let Some(writer) = writer {
            writer.add(&repo, docs.documents, embedded.chunks)?;
        }
        Ok(())
    }
}

/// Build a pipeline from configuration and run it once.
pub async fn pipeline_fetch_and_load(config: &Config, params: &PipelineParams) -> Result<PipelineRun> {
    Pipeline::from_config(config)?.run(params).await
}
