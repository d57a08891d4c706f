//! Repository discovery through the GitHub search API.
//!
//! [`GitHubSearch`] pages through `GET /search/repositories` until the
//! requested number of repositories is collected or the API runs out of
//! results. The search API never returns more than 1000 results for one
//! query, so large requests split the look-back window into equal date
//! intervals and query each one separately; the merged list is re-sorted
//! by the requested key.
//!
//! Rate limiting (HTTP 429, or 403 with an exhausted quota) is retried with
//! exponential backoff, honoring `Retry-After` and `X-RateLimit-Reset`.
//! Authentication failures fail immediately.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use git2vec_core::models::RepoDescriptor;
use git2vec_core::{Error, Result};

use crate::config::DiscoveryConfig;
use crate::retry::{retry_after_header, status_error, transport_error, RetryPolicy};

const SERVICE: &str = "github";

/// Sort key accepted by the search API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortKey {
    #[default]
    Stars,
    Forks,
    Updated,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Stars => "stars",
            SortKey::Forks => "forks",
            SortKey::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Filters for one discovery request.
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub n_repos: usize,
    pub last_n_days: u32,
    pub language: Option<String>,
    pub sort: SortKey,
    pub order: SortOrder,
}

/// A source of candidate repositories.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Return at most `query.n_repos` repositories, ordered per
    /// `(query.sort, query.order)`. Returns fewer when the source is
    /// exhausted.
    async fn get_top_repos(&self, query: &DiscoveryQuery) -> Result<Vec<RepoDescriptor>>;
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    full_name: String,
    html_url: String,
    default_branch: String,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    size: u64,
}

impl From<SearchItem> for RepoDescriptor {
    fn from(item: SearchItem) -> Self {
        RepoDescriptor {
            url: item.html_url,
            full_name: item.full_name,
            branch: item.default_branch,
            stars: item.stargazers_count,
            forks: item.forks_count,
            created_at: item.created_at,
            updated_at: item.updated_at,
            language: item.language,
            size_kb: item.size,
        }
    }
}

/// GitHub search API client.
pub struct GitHubSearch {
    client: reqwest::Client,
    config: DiscoveryConfig,
    token: Option<String>,
    retry: RetryPolicy,
}

impl GitHubSearch {
    pub fn new(config: &DiscoveryConfig, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("git2vec/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| transport_error(SERVICE, e))?;
        let retry = RetryPolicy::new(
            config.max_retries + 1,
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
        );
        Ok(Self {
            client,
            config: config.clone(),
            token: token.filter(|t| !t.trim().is_empty()),
            retry,
        })
    }

    /// Build a client using `GITHUB_ACCESS_TOKEN` when it is set.
    pub fn from_env(config: &DiscoveryConfig) -> Result<Self> {
        Self::new(config, std::env::var("GITHUB_ACCESS_TOKEN").ok())
    }

    async fn request_page(
        &self,
        q: &str,
        query: &DiscoveryQuery,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage> {
        let url = format!(
            "{}/search/repositories",
            self.config.api_url.trim_end_matches('/')
        );
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .query(&[
                ("q", q.to_string()),
                ("sort", query.sort.as_str().to_string()),
                ("order", query.order.as_str().to_string()),
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        let status = response.status();

        if status.is_success() {
            return response.json::<SearchPage>().await.map_err(|e| {
                Error::external(SERVICE, format!("invalid search response: {}", e))
            });
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        if status.as_u16() == 403 && quota_exhausted(&headers, &body) {
            return Err(Error::RateLimited {
                service: SERVICE,
                retry_after: retry_after_header(&headers).or_else(|| reset_hint(&headers)),
            });
        }
        Err(status_error(
            SERVICE,
            status,
            body,
            retry_after_header(&headers).or_else(|| reset_hint(&headers)),
        ))
    }

    /// Page through one search query until `want` results are collected.
    async fn collect(
        &self,
        q: &str,
        query: &DiscoveryQuery,
        want: usize,
    ) -> Result<Vec<RepoDescriptor>> {
        let per_page = self.config.per_page.min(want.max(1) as u32);
        let mut out = Vec::new();
        let mut page = 1;

        while out.len() < want && page <= self.config.max_pages {
            let result = self
                .retry
                .run("github search", || self.request_page(q, query, page, per_page))
                .await;
            let batch = match result {
                Ok(batch) => batch,
                // Paging past the search API's result cap returns 422.
                Err(Error::ExternalApi {
                    status: Some(422), ..
                }) if page > 1 => break,
                Err(e) => return Err(e),
            };

            let received = batch.items.len();
            debug!(q, page, received, "search page");
            out.extend(batch.items.into_iter().map(RepoDescriptor::from));
            if received < per_page as usize {
                break;
            }
            page += 1;
        }

        out.truncate(want);
        Ok(out)
    }
}

#[async_trait]
impl RepoSource for GitHubSearch {
    async fn get_top_repos(&self, query: &DiscoveryQuery) -> Result<Vec<RepoDescriptor>> {
        if query.n_repos == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let intervals = split_window(
            now,
            query.last_n_days,
            interval_count(query.n_repos, self.config.interval_threshold),
        );
        let quotas = interval_quotas(query.n_repos, intervals.len());

        let mut repos = Vec::new();
        for (window, want) in intervals.iter().zip(quotas) {
            if want == 0 {
                continue;
            }
            let q = build_query(query.language.as_deref(), window);
            info!(q = %q, want, "searching repositories");
            repos.extend(self.collect(&q, query, want).await?);
        }

        let mut repos = filter_repos(repos, query, now);
        if intervals.len() > 1 {
            sort_repos(&mut repos, query.sort, query.order);
        }
        repos.truncate(query.n_repos);
        info!(found = repos.len(), requested = query.n_repos, "discovery finished");
        Ok(repos)
    }
}

/// A creation-date filter for one search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateWindow {
    /// `created:>DATE`
    After(NaiveDate),
    /// `created:START..END`, both inclusive.
    Between(NaiveDate, NaiveDate),
}

/// Number of date intervals needed so no query asks for more than
/// `threshold` results.
pub fn interval_count(n_repos: usize, threshold: usize) -> usize {
    if n_repos > threshold {
        n_repos.div_ceil(threshold)
    } else {
        1
    }
}

/// Share `n_repos` across `intervals` windows. The first
/// `n_repos % intervals` windows take one extra, so the quotas sum to
/// `n_repos`.
pub fn interval_quotas(n_repos: usize, intervals: usize) -> Vec<usize> {
    if intervals == 0 {
        return Vec::new();
    }
    let base = n_repos / intervals;
    let extra = n_repos % intervals;
    (0..intervals)
        .map(|i| base + usize::from(i < extra))
        .collect()
}

/// Split the last `last_n_days` before `now` into `n` contiguous windows.
pub fn split_window(now: DateTime<Utc>, last_n_days: u32, n: usize) -> Vec<DateWindow> {
    let start = now - chrono::Duration::days(i64::from(last_n_days));
    if n <= 1 {
        return vec![DateWindow::After(start.date_naive())];
    }
    let step = (i64::from(last_n_days) / n as i64).max(1);
    let mut windows = Vec::with_capacity(n);
    let mut from = start;
    for i in 0..n {
        let to = if i + 1 == n {
            now
        } else {
            (from + chrono::Duration::days(step)).min(now)
        };
        windows.push(DateWindow::Between(from.date_naive(), to.date_naive()));
        from = to;
    }
    windows
}

/// Render the `q` parameter for one window.
pub fn build_query(language: Option<&str>, window: &DateWindow) -> String {
    let filter = match language {
        Some(lang) if lang.contains(' ') => format!("language:\"{}\"", lang),
        Some(lang) => format!("language:{}", lang),
        None => "is:public".to_string(),
    };
    let created = match window {
        DateWindow::After(date) => format!("created:>{}", date.format("%Y-%m-%d")),
        DateWindow::Between(from, to) => format!(
            "created:{}..{}",
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        ),
    };
    format!("{} {}", filter, created)
}

/// Drop duplicates and anything outside the look-back window or language.
fn filter_repos(
    repos: Vec<RepoDescriptor>,
    query: &DiscoveryQuery,
    now: DateTime<Utc>,
) -> Vec<RepoDescriptor> {
    let cutoff = now - chrono::Duration::days(i64::from(query.last_n_days));
    let mut seen = HashSet::new();
    repos
        .into_iter()
        .filter(|r| r.created_at >= cutoff)
        .filter(|r| match &query.language {
            Some(lang) => r
                .language
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(lang)),
            None => true,
        })
        .filter(|r| seen.insert(r.full_name.clone()))
        .collect()
}

/// Stable sort by the requested key.
pub fn sort_repos(repos: &mut [RepoDescriptor], sort: SortKey, order: SortOrder) {
    repos.sort_by(|a, b| {
        let ord = match sort {
            SortKey::Stars => a.stars.cmp(&b.stars),
            SortKey::Forks => a.forks.cmp(&b.forks),
            SortKey::Updated => a.updated_at.cmp(&b.updated_at),
        };
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

fn quota_exhausted(headers: &reqwest::header::HeaderMap, body: &str) -> bool {
    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    remaining_zero || body.to_ascii_lowercase().contains("rate limit")
}

/// Seconds until `X-RateLimit-Reset` (a Unix timestamp), at least one.
fn reset_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = (reset - Utc::now().timestamp()).max(1);
    Some(Duration::from_secs(wait as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repo(name: &str, stars: u64, days_ago: i64, language: Option<&str>) -> RepoDescriptor {
        RepoDescriptor {
            url: format!("https://github.com/{}", name),
            full_name: name.to_string(),
            branch: "main".to_string(),
            stars,
            forks: 0,
            created_at: Utc::now() - chrono::Duration::days(days_ago),
            updated_at: None,
            language: language.map(String::from),
            size_kb: 1,
        }
    }

    fn query(n: usize, days: u32, language: Option<&str>) -> DiscoveryQuery {
        DiscoveryQuery {
            n_repos: n,
            last_n_days: days,
            language: language.map(String::from),
            sort: SortKey::Stars,
            order: SortOrder::Desc,
        }
    }

    #[test]
    fn test_interval_count() {
        assert_eq!(interval_count(5, 900), 1);
        assert_eq!(interval_count(900, 900), 1);
        assert_eq!(interval_count(901, 900), 2);
        assert_eq!(interval_count(2000, 900), 3);
    }

    #[test]
    fn test_interval_quotas_keep_the_remainder() {
        assert_eq!(interval_quotas(1900, 3), vec![634, 633, 633]);
        assert_eq!(interval_quotas(1800, 2), vec![900, 900]);
        assert_eq!(interval_quotas(7, 1), vec![7]);
        assert_eq!(interval_quotas(2, 3), vec![1, 1, 0]);
        for n in [901, 1799, 2000, 4501] {
            let k = interval_count(n, 900);
            let quotas = interval_quotas(n, k);
            assert_eq!(quotas.iter().sum::<usize>(), n);
            assert!(quotas.iter().all(|&q| q <= 900));
        }
    }

    #[test]
    fn test_single_window_query() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let windows = split_window(now, 30, 1);
        assert_eq!(
            build_query(Some("Python"), &windows[0]),
            "language:Python created:>2024-03-01"
        );
        assert_eq!(build_query(None, &windows[0]), "is:public created:>2024-03-01");
    }

    #[test]
    fn test_split_window_covers_range() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let windows = split_window(now, 30, 3);
        assert_eq!(windows.len(), 3);
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        assert_eq!(windows[0], DateWindow::Between(d(3, 1), d(3, 11)));
        assert_eq!(windows[1], DateWindow::Between(d(3, 11), d(3, 21)));
        assert_eq!(windows[2], DateWindow::Between(d(3, 21), d(3, 31)));
        assert_eq!(
            build_query(Some("Rust"), &windows[0]),
            "language:Rust created:2024-03-01..2024-03-11"
        );
    }

    #[test]
    fn test_language_with_space_is_quoted() {
        let window = DateWindow::After(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(
            build_query(Some("Jupyter Notebook"), &window),
            "language:\"Jupyter Notebook\" created:>2024-01-01"
        );
    }

    #[test]
    fn test_filter_drops_old_foreign_and_duplicate() {
        let repos = vec![
            repo("a/new", 5, 2, Some("Python")),
            repo("a/old", 9, 40, Some("Python")),
            repo("a/go", 7, 1, Some("Go")),
            repo("a/new", 5, 2, Some("Python")),
            repo("a/lower", 1, 3, Some("python")),
        ];
        let kept = filter_repos(repos, &query(10, 30, Some("Python")), Utc::now());
        let names: Vec<_> = kept.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["a/new", "a/lower"]);
    }

    #[test]
    fn test_sort_desc_and_asc() {
        let mut repos = vec![repo("a/1", 3, 1, None), repo("a/2", 9, 1, None), repo("a/3", 5, 1, None)];
        sort_repos(&mut repos, SortKey::Stars, SortOrder::Desc);
        let stars: Vec<_> = repos.iter().map(|r| r.stars).collect();
        assert_eq!(stars, vec![9, 5, 3]);
        sort_repos(&mut repos, SortKey::Stars, SortOrder::Asc);
        let stars: Vec<_> = repos.iter().map(|r| r.stars).collect();
        assert_eq!(stars, vec![3, 5, 9]);
    }

    #[test]
    fn test_quota_exhausted_detection() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert!(!quota_exhausted(&headers, "Forbidden"));
        assert!(quota_exhausted(&headers, "API rate limit exceeded for 1.2.3.4"));
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        assert!(quota_exhausted(&headers, ""));
    }

    #[test]
    fn test_search_item_deserializes() {
        let json = r#"{
            "full_name": "octo/hello",
            "html_url": "https://github.com/octo/hello",
            "default_branch": "main",
            "stargazers_count": 42,
            "forks_count": 3,
            "created_at": "2024-03-10T08:00:00Z",
            "updated_at": "2024-03-20T08:00:00Z",
            "language": "Rust",
            "size": 128,
            "owner": { "login": "octo" }
        }"#;
        let item: SearchItem = serde_json::from_str(json).unwrap();
        let repo = RepoDescriptor::from(item);
        assert_eq!(repo.full_name, "octo/hello");
        assert_eq!(repo.stars, 42);
        assert_eq!(repo.size_kb, 128);
        assert_eq!(repo.language.as_deref(), Some("Rust"));
    }
}
