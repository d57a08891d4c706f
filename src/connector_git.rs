//! Git repository loader.
//!
//! [`GitLoader`] materializes one branch of a repository into a fresh
//! [`Workspace`] with `git clone`, then walks the checkout and turns every
//! text file that passes the filters into a [`Document`].
//!
//! Workflow:
//! 1. Reserve a unique workspace path.
//! 2. Clone (shallow if configured, LFS objects excluded), retrying
//!    transient failures after clearing partial state.
//! 3. Walk the tree in file-name order.
//! 4. Apply glob excludes, extension filters, the size ceiling, and binary
//!    detection. Files that fail any check are recorded as skipped.
//! 5. Drop the workspace, which removes it when `delete` is set.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use git2vec_core::models::{Document, RepoDescriptor, RepoDocuments, SkipReason, SkippedFile};
use git2vec_core::{CloneErrorKind, Error, Result};

use crate::config::LoaderConfig;
use crate::retry::RetryPolicy;
use crate::workspace::Workspace;

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Extracts documents from one repository.
#[async_trait]
pub trait RepoLoader: Send + Sync {
    /// Load `branch` of `repo`. Per-file problems are recorded in
    /// [`RepoDocuments::skipped`]; only transport failures fail the call.
    async fn load(&self, repo: &RepoDescriptor, branch: &str, delete: bool)
        -> Result<RepoDocuments>;
}

/// Path, extension, and size filters applied while walking a checkout.
pub struct FileFilter {
    exclude: GlobSet,
    exclude_extensions: HashSet<String>,
    include_extensions: HashSet<String>,
    max_file_bytes: u64,
}

impl FileFilter {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let mut patterns = vec![
            ".git/**".to_string(),
            "**/node_modules/**".to_string(),
            "**/target/**".to_string(),
        ];
        patterns.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            exclude: build_globset(&patterns)?,
            exclude_extensions: lowercase_set(&config.exclude_extensions),
            include_extensions: lowercase_set(&config.include_extensions),
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Decide on a path before reading it.
    pub fn check_path(&self, relative: &str) -> Option<SkipReason> {
        if self.exclude.is_match(relative) {
            return Some(SkipReason::Excluded);
        }
        let ext = extension(relative).to_ascii_lowercase();
        if self.exclude_extensions.contains(&ext) {
            return Some(SkipReason::Excluded);
        }
        if !self.include_extensions.is_empty() && !self.include_extensions.contains(&ext) {
            return Some(SkipReason::Excluded);
        }
        None
    }

    pub fn check_size(&self, bytes: u64) -> Option<SkipReason> {
        (bytes > self.max_file_bytes).then_some(SkipReason::TooLarge { bytes })
    }
}

/// Loads repositories with the `git` CLI.
pub struct GitLoader {
    config: LoaderConfig,
    filter: Arc<FileFilter>,
    clone_retry: RetryPolicy,
}

impl GitLoader {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        Ok(Self {
            filter: Arc::new(FileFilter::new(config)?),
            clone_retry: RetryPolicy::new(
                config.clone_attempts,
                Duration::from_millis(500),
                Duration::from_secs(10),
            ),
            config: config.clone(),
        })
    }
}

#[async_trait]
impl RepoLoader for GitLoader {
    async fn load(
        &self,
        repo: &RepoDescriptor,
        branch: &str,
        delete: bool,
    ) -> Result<RepoDocuments> {
        repo.validate()?;
        let workspace = Workspace::create(&self.config.workspace_root, repo, delete)?;

        let ws = &workspace;
        let url = repo.url.as_str();
        let shallow = self.config.shallow;
        self.clone_retry
            .run("git clone", move || async move {
                ws.reset()?;
                git_clone(url, branch, shallow, ws.path()).await
            })
            .await?;

        let root = workspace.path().to_path_buf();
        let filter = Arc::clone(&self.filter);
        let repo_id = repo.id().to_string();
        let branch_name = branch.to_string();
        let walked = tokio::task::spawn_blocking(move || {
            extract_documents(&root, &filter, &repo_id, &branch_name)
        })
        .await;

        let docs = match walked {
            Ok(docs) => docs,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(Error::Cancelled),
        };
        info!(
            repo = %repo.id(),
            documents = docs.documents.len(),
            skipped = docs.skipped.len(),
            "repository loaded"
        );
        Ok(docs)
    }
}

async fn git_clone(url: &str, branch: &str, shallow: bool, dest: &Path) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(["clone", "-c", "lfs.fetchexclude=*"]);
    cmd.args(["--branch", branch, "--single-branch"]);
    if shallow {
        cmd.args(["--depth", "1"]);
    }
    cmd.arg(url).arg(dest);
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_LFS_SKIP_SMUDGE", "1")
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!(url, branch, dest = %dest.display(), "git clone");
    let output = cmd.output().await.map_err(|e| Error::Clone {
        kind: CloneErrorKind::Other,
        message: format!("failed to execute 'git clone'. Is git installed? {}", e),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Clone {
            kind: classify_clone_error(&stderr),
            message: stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// Map `git clone` stderr onto a failure kind.
pub fn classify_clone_error(stderr: &str) -> CloneErrorKind {
    let lower = stderr.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["remote branch", "couldn't find remote ref"]) && has(&["not found", "couldn't find"])
    {
        CloneErrorKind::BranchNotFound
    } else if has(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied",
        "repository not found",
        "terminal prompts disabled",
    ]) {
        CloneErrorKind::Auth
    } else if has(&[
        "could not resolve host",
        "connection timed out",
        "connection refused",
        "network is unreachable",
        "unable to access",
        "does not exist",
        "does not appear to be a git repository",
        "early eof",
    ]) {
        CloneErrorKind::Unreachable
    } else {
        CloneErrorKind::Other
    }
}

/// Walk a checkout and collect documents in file-name order.
pub fn extract_documents(
    root: &Path,
    filter: &FileFilter,
    repo: &str,
    branch: &str,
) -> RepoDocuments {
    let mut out = RepoDocuments::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                out.skipped.push(SkippedFile {
                    path,
                    reason: SkipReason::Unreadable {
                        message: e.to_string(),
                    },
                });
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = relative_path(root, entry.path());
        if !entry.file_type().is_file() {
            debug!(repo, path = %rel, "not a regular file; skipped");
            out.skipped.push(SkippedFile {
                path: rel,
                reason: SkipReason::NotRegularFile,
            });
            continue;
        }
        match read_document(entry.path(), &rel, filter, repo, branch) {
            Ok(doc) => out.documents.push(doc),
            Err(reason) => {
                debug!(repo, path = %rel, ?reason, "file skipped");
                out.skipped.push(SkippedFile { path: rel, reason });
            }
        }
    }
    out
}

fn read_document(
    path: &Path,
    rel: &str,
    filter: &FileFilter,
    repo: &str,
    branch: &str,
) -> std::result::Result<Document, SkipReason> {
    if let Some(reason) = filter.check_path(rel) {
        return Err(reason);
    }
    let unreadable = |e: std::io::Error| SkipReason::Unreadable {
        message: e.to_string(),
    };
    let size = std::fs::metadata(path).map_err(unreadable)?.len();
    if let Some(reason) = filter.check_size(size) {
        return Err(reason);
    }

    let bytes = std::fs::read(path).map_err(unreadable)?;
    if looks_binary(&bytes) {
        return Err(SkipReason::Binary);
    }
    let content = String::from_utf8(bytes).map_err(|_| SkipReason::Binary)?;
    Document::new(repo, branch, rel, content).map_err(|_| SkipReason::Empty)
}

/// A NUL byte near the start of a file marks it as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extension of the final path segment including the dot, or empty.
fn extension(path: &str) -> &str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => &file_name[pos..],
        _ => "",
    }
}

fn lowercase_set(items: &[String]) -> HashSet<String> {
    items.iter().map(|s| s.to_ascii_lowercase()).collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::validation(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::validation(format!("invalid glob set: {}", e)))
}
