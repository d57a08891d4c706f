//! Bounded exponential backoff shared by every external call.
//!
//! Delays double from `base_delay` (1s, 2s, 4s, …) and are capped at
//! `max_delay`. A server-provided hint (`Retry-After`, rate-limit reset)
//! replaces the computed delay for that attempt. Only errors for which
//! [`Error::is_retryable`] holds are retried.

use std::future::Future;
use std::time::Duration;

use git2vec_core::{Error, Result};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            let exp = attempt.saturating_sub(1).min(16);
            self.base_delay.saturating_mul(1u32 << exp)
        });
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, err.retry_after());
                    warn!(
                        op = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Convert a `reqwest` transport error into a retryable external API error.
pub(crate) fn transport_error(service: &'static str, err: reqwest::Error) -> Error {
    Error::ExternalApi {
        service,
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
        retryable: err.is_timeout() || err.is_connect() || err.is_request() || err.is_body(),
    }
}

/// Classify a non-success HTTP status from an external API.
pub(crate) fn status_error(
    service: &'static str,
    status: reqwest::StatusCode,
    body: String,
    retry_after: Option<Duration>,
) -> Error {
    if status.as_u16() == 429 {
        return Error::RateLimited {
            service,
            retry_after,
        };
    }
    Error::ExternalApi {
        service,
        status: Some(status.as_u16()),
        message: body,
        retryable: status.is_server_error(),
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
