//! Error taxonomy shared by every pipeline stage.
//!
//! Transport-level failures (HTTP, process, filesystem, serialization) are
//! translated into these kinds at the boundary where they occur. Callers
//! decide what to do with them: the load orchestrator turns them into
//! per-repository failure records, retry loops consult
//! [`Error::is_retryable`], and only flush failures end a run.

use std::path::PathBuf;
use std::time::Duration;

use crate::models::PipelineRun;

/// Why a `git clone` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneErrorKind {
    /// Credentials were rejected or required.
    Auth,
    /// The requested branch does not exist on the remote.
    BranchNotFound,
    /// DNS, connection, or timeout failure reaching the remote.
    Unreachable,
    /// Anything else `git` reported.
    Other,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" {}", s)).unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A search, embedding, or vector-store API call failed.
    #[error("{service} API error{}: {message}", status_suffix(.status))]
    ExternalApi {
        service: &'static str,
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// The external API asked us to slow down (HTTP 429 or equivalent).
    #[error("{service} API rate limited")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("git clone failed ({kind:?}): {message}")]
    Clone {
        kind: CloneErrorKind,
        message: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("validation error: {0}")]
    Validation(String),

    /// Writing an output batch failed. Always fatal to the run.
    #[error("batch flush failed: {0}")]
    Flush(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A fatal error ended a pipeline run early. `run` holds everything
    /// recorded up to that point, including artifacts already on disk.
    #[error("run aborted: {source}")]
    RunAborted {
        run: Box<PipelineRun>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Error::ExternalApi {
            service,
            status: None,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Whether a bounded retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } => true,
            Error::ExternalApi { retryable, .. } => *retryable,
            Error::Clone { kind, .. } => {
                matches!(kind, CloneErrorKind::Unreachable | CloneErrorKind::Other)
            }
            _ => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// The error that caused a [`Error::RunAborted`], or `self`.
    pub fn root(&self) -> &Error {
        match self {
            Error::RunAborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Server-provided hint for how long to wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
