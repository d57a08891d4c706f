//! Core data models used throughout git2vec.
//!
//! These types represent the repositories, documents, chunks, and run
//! statistics that flow through the discovery → load → embed → output
//! pipeline. Everything here is immutable once produced except
//! [`PipelineRun`], which accumulates counters for one invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CloneErrorKind, Error, Result};

/// Metadata identifying a candidate repository for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    /// Browsable or clonable URL (`html_url` from the search API).
    pub url: String,
    /// `owner/name`.
    pub full_name: String,
    /// Branch to materialize (the repository's default branch).
    pub branch: String,
    pub stars: u64,
    #[serde(default)]
    pub forks: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub language: Option<String>,
    /// Repository size in KB as reported by the search API.
    #[serde(default)]
    pub size_kb: u64,
}

impl RepoDescriptor {
    /// Stable identifier used as the key in load results and output rows.
    pub fn id(&self) -> &str {
        &self.full_name
    }

    pub fn owner(&self) -> &str {
        self.full_name.split('/').next().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.full_name.rsplit('/').next().unwrap_or_default()
    }

    /// Reject descriptors that cannot be loaded.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::validation(format!(
                "repository '{}' has an empty url",
                self.full_name
            )));
        }
        let mut parts = self.full_name.split('/');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !well_formed {
            return Err(Error::validation(format!(
                "repository name '{}' is not of the form owner/name",
                self.full_name
            )));
        }
        if self.branch.trim().is_empty() {
            return Err(Error::validation(format!(
                "repository '{}' has no branch",
                self.full_name
            )));
        }
        Ok(())
    }
}

/// Per-document metadata carried through to output rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub repo: String,
    pub branch: String,
    /// File size in bytes.
    pub size: u64,
    pub file_name: String,
    /// Extension including the leading dot, or empty.
    pub file_type: String,
}

/// A text file extracted from a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Build a document, rejecting empty content.
    pub fn new(repo: &str, branch: &str, path: &str, content: String) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(Error::validation(format!("document '{}' is empty", path)));
        }
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let file_type = match file_name.rfind('.') {
            Some(pos) if pos > 0 => file_name[pos..].to_string(),
            _ => String::new(),
        };
        Ok(Self {
            path: path.to_string(),
            metadata: DocumentMetadata {
                repo: repo.to_string(),
                branch: branch.to_string(),
                size: content.len() as u64,
                file_name,
                file_type,
            },
            content,
        })
    }
}

/// Why a file was left out of a repository's document sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Excluded,
    TooLarge { bytes: u64 },
    Binary,
    Empty,
    /// Symlinks, sockets, FIFOs, and device nodes. Links are never followed.
    NotRegularFile,
    Unreadable { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Documents extracted from one repository, in file-walk order.
#[derive(Debug, Clone, Default)]
pub struct RepoDocuments {
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedFile>,
}

/// A token-bounded slice of a document, optionally embedded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Deterministic id, see [`crate::chunk::chunk_id`].
    pub id: String,
    pub repo: String,
    pub path: String,
    pub index: u32,
    pub text: String,
    pub token_count: usize,
    /// SHA-256 of `text`, hex encoded.
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Clone(CloneErrorKind),
    Io,
    Validation,
    ExternalApi,
    Panicked,
    TimedOut,
    Cancelled,
    Other,
}

/// A repository that produced no documents, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoFailure {
    pub repo: String,
    pub kind: FailureKind,
    pub message: String,
}

impl RepoFailure {
    pub fn new(repo: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(repo: impl Into<String>, err: &Error) -> Self {
        let kind = match err {
            Error::Clone { kind, .. } => FailureKind::Clone(*kind),
            Error::Io { .. } => FailureKind::Io,
            Error::Validation(_) => FailureKind::Validation,
            Error::ExternalApi { .. } | Error::RateLimited { .. } => FailureKind::ExternalApi,
            Error::Cancelled => FailureKind::Cancelled,
            Error::Flush(_) => FailureKind::Other,
            Error::RunAborted { source, .. } => return Self::from_error(repo, source),
        };
        Self::new(repo, kind, err.to_string())
    }
}

/// Aggregate counters for one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub repos_discovered: u64,
    pub repos_attempted: u64,
    pub repos_succeeded: u64,
    pub repos_failed: u64,
    /// Discovered but not loaded (reported size 0).
    pub repos_skipped: u64,
    pub documents_loaded: u64,
    pub files_skipped: u64,
    pub chunks_embedded: u64,
    pub chunks_failed: u64,
    pub vectors_upserted: u64,
    pub vectors_failed: u64,
    pub batches_written: u64,
    pub artifacts: Vec<String>,
    pub failures: Vec<RepoFailure>,
    /// Set when a fatal error ended the run early.
    pub fatal: Option<String>,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            repos_discovered: 0,
            repos_attempted: 0,
            repos_succeeded: 0,
            repos_failed: 0,
            repos_skipped: 0,
            documents_loaded: 0,
            files_skipped: 0,
            chunks_embedded: 0,
            chunks_failed: 0,
            vectors_upserted: 0,
            vectors_failed: 0,
            batches_written: 0,
            artifacts: Vec::new(),
            failures: Vec::new(),
            fatal: None,
        }
    }

    pub fn record_failure(&mut self, failure: RepoFailure) {
        self.repos_failed += 1;
        self.failures.push(failure);
    }

    pub fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// True when nothing failed anywhere in the run.
    pub fn is_clean(&self) -> bool {
        self.fatal.is_none()
            && self.repos_failed == 0
            && self.chunks_failed == 0
            && self.vectors_failed == 0
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Render documents as `path:\n\ncontent\n\n` blocks, in order.
pub fn docs_to_string(docs: &[Document]) -> String {
    let mut out = String::new();
    for doc in docs {
        out.push_str(&doc.path);
        out.push_str(":\n\n");
        out.push_str(&doc.content);
        out.push_str("\n\n");
    }
    out
}
