//! Bounded-concurrency repository loading.
//!
//! [`LoadOrchestrator`] runs a [`RepoLoader`] over many repositories with at
//! most `max_workers` loads in flight. Each load runs in its own tokio task,
//! so an error or panic in one repository becomes a [`RepoFailure`] for that
//! repository and never touches its siblings.
//!
//! Results are streamed through a channel in completion order. A
//! repository's own documents keep their file-walk order.
//!
//! Cancelling the token stops new loads from starting. Repositories that were
//! never started are reported as cancelled, in-flight loads get
//! `grace_period` to finish, and whatever is still running after that is
//! aborted (which drops, and therefore cleans up, its workspace).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use git2vec_core::models::{FailureKind, RepoDescriptor, RepoDocuments, RepoFailure};

use crate::connector_git::RepoLoader;

/// Outcome of loading one repository.
#[derive(Debug)]
pub struct RepoLoadResult {
    pub repo: RepoDescriptor,
    pub outcome: Result<RepoDocuments, RepoFailure>,
}

type LoadOutcome = Result<RepoDocuments, RepoFailure>;

#[derive(Clone)]
pub struct LoadOrchestrator {
    loader: Arc<dyn RepoLoader>,
    max_workers: usize,
    grace_period: Duration,
    repo_timeout: Option<Duration>,
    delete: bool,
    cancel: CancellationToken,
}

impl LoadOrchestrator {
    pub fn new(loader: Arc<dyn RepoLoader>, max_workers: usize) -> Self {
        Self {
            loader,
            max_workers: max_workers.max(1),
            grace_period: Duration::from_secs(30),
            repo_timeout: None,
            delete: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_repo_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.repo_timeout = timeout;
        self
    }

    /// Whether loaders remove their workspaces when done.
    pub fn with_delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start loading `repos` and return a receiver yielding one result per
    /// repository, in completion order.
    pub fn spawn(&self, repos: Vec<RepoDescriptor>) -> mpsc::Receiver<RepoLoadResult> {
        let (tx, rx) = mpsc::channel(self.max_workers);
        let this = self.clone();
        tokio::spawn(async move { this.drive(repos, tx).await });
        rx
    }

    /// Load every repository and collect the results.
    pub async fn run(&self, repos: Vec<RepoDescriptor>) -> Vec<RepoLoadResult> {
        let mut rx = self.spawn(repos);
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results
    }

    async fn drive(self, repos: Vec<RepoDescriptor>, tx: mpsc::Sender<RepoLoadResult>) {
        let total = repos.len();
        let mut pending = repos.into_iter();
        let mut tasks: JoinSet<(RepoDescriptor, LoadOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, RepoDescriptor> = HashMap::new();

        info!(repos = total, max_workers = self.max_workers, "loading repositories");

        loop {
            while !self.cancel.is_cancelled() && tasks.len() < self.max_workers {
                let Some(repo) = pending.next() else { break };
                let handle = tasks.spawn(load_one(
                    Arc::clone(&self.loader),
                    repo.clone(),
                    self.delete,
                    self.repo_timeout,
                ));
                in_flight.insert(handle.id(), repo);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    if let Some(result) = settle(joined, &mut in_flight) {
                        if tx.send(result).await.is_err() {
                            // Receiver gone; nobody wants the rest.
                            tasks.abort_all();
                            return;
                        }
                    }
                }
            }
        }

        if !self.cancel.is_cancelled() {
            return;
        }

        let unscheduled: Vec<_> = pending.collect();
        warn!(
            in_flight = tasks.len(),
            unscheduled = unscheduled.len(),
            grace_ms = self.grace_period.as_millis() as u64,
            "load cancelled"
        );
        for repo in unscheduled {
            let failure = RepoFailure::new(repo.id(), FailureKind::Cancelled, "not started before cancellation");
            let _ = tx
                .send(RepoLoadResult {
                    repo,
                    outcome: Err(failure),
                })
                .await;
        }

        let deadline = tokio::time::sleep(self.grace_period);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    if let Some(result) = settle(joined, &mut in_flight) {
                        let _ = tx.send(result).await;
                    }
                }
            }
        }

        tasks.abort_all();
        while let Some(joined) = tasks.join_next_with_id().await {
            if let Some(result) = settle(joined, &mut in_flight) {
                let _ = tx.send(result).await;
            }
        }
    }
}

async fn load_one(
    loader: Arc<dyn RepoLoader>,
    repo: RepoDescriptor,
    delete: bool,
    timeout: Option<Duration>,
) -> (RepoDescriptor, LoadOutcome) {
    let load = loader.load(&repo, &repo.branch, delete);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, load).await {
            Ok(result) => result,
            Err(_) => {
                let failure = RepoFailure::new(
                    repo.id(),
                    FailureKind::TimedOut,
                    format!("load exceeded {}s", limit.as_secs_f64()),
                );
                return (repo, Err(failure));
            }
        },
        None => load.await,
    };
    let outcome = result.map_err(|e| RepoFailure::from_error(repo.id(), &e));
    (repo, outcome)
}

/// Turn a joined task into a result, recovering the repository for tasks
/// that panicked or were aborted.
fn settle(
    joined: Result<(tokio::task::Id, (RepoDescriptor, LoadOutcome)), JoinError>,
    in_flight: &mut HashMap<tokio::task::Id, RepoDescriptor>,
) -> Option<RepoLoadResult> {
    match joined {
        Ok((id, (repo, outcome))) => {
            in_flight.remove(&id);
            if let Err(failure) = &outcome {
                warn!(repo = %failure.repo, kind = ?failure.kind, error = %failure.message, "repository failed");
            }
            Some(RepoLoadResult { repo, outcome })
        }
        Err(err) => {
            let Some(repo) = in_flight.remove(&err.id()) else {
                warn!(error = %err, "joined unknown load task");
                return None;
            };
            let failure = if err.is_panic() {
                let message = panic_message(err.into_panic());
                warn!(repo = %repo.id(), panic = %message, "repository load panicked");
                RepoFailure::new(repo.id(), FailureKind::Panicked, message)
            } else {
                RepoFailure::new(repo.id(), FailureKind::Cancelled, "aborted after grace period")
            };
            Some(RepoLoadResult {
                repo,
                outcome: Err(failure),
            })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use git2vec_core::models::Document;
    use git2vec_core::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn repo(full_name: &str) -> RepoDescriptor {
        RepoDescriptor {
            url: format!("https://example.invalid/{}", full_name),
            full_name: full_name.to_string(),
            branch: "main".to_string(),
            stars: 1,
            forks: 0,
            created_at: Utc::now(),
            updated_at: None,
            language: None,
            size_kb: 1,
        }
    }

    /// Loader whose behavior is picked by repository name.
    #[derive(Default)]
    struct ScriptedLoader {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RepoLoader for ScriptedLoader {
        async fn load(
            &self,
            repo: &RepoDescriptor,
            branch: &str,
            _delete: bool,
        ) -> Result<RepoDocuments> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let name = repo.name().to_string();
            let delay = if name.starts_with("slow") {
                Duration::from_secs(5)
            } else if name.starts_with("late") {
                Duration::from_millis(80)
            } else {
                Duration::from_millis(10)
            };
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if name.starts_with("fail") {
                return Err(Error::Clone {
                    kind: git2vec_core::CloneErrorKind::Auth,
                    message: "denied".into(),
                });
            }
            if name.starts_with("panic") {
                panic!("loader exploded");
            }
            let docs = (0..3)
                .map(|i| {
                    Document::new(repo.id(), branch, &format!("f{}.rs", i), format!("// {}", i))
                        .unwrap()
                })
                .collect();
            Ok(RepoDocuments {
                documents: docs,
                skipped: Vec::new(),
            })
        }
    }

    fn by_name(results: &[RepoLoadResult]) -> HashMap<String, &RepoLoadResult> {
        results
            .iter()
            .map(|r| (r.repo.full_name.clone(), r))
            .collect()
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let loader = Arc::new(ScriptedLoader::default());
        let orchestrator = LoadOrchestrator::new(loader, 4);
        let results = orchestrator
            .run(vec![repo("a/ok1"), repo("a/fail"), repo("a/panic"), repo("a/ok2")])
            .await;
        assert_eq!(results.len(), 4);

        let results = by_name(&results);
        for ok in ["a/ok1", "a/ok2"] {
            let docs = results[ok].outcome.as_ref().unwrap();
            let paths: Vec<_> = docs.documents.iter().map(|d| d.path.as_str()).collect();
            assert_eq!(paths, vec!["f0.rs", "f1.rs", "f2.rs"]);
        }
        let failed = results["a/fail"].outcome.as_ref().unwrap_err();
        assert_eq!(
            failed.kind,
            FailureKind::Clone(git2vec_core::CloneErrorKind::Auth)
        );
        let panicked = results["a/panic"].outcome.as_ref().unwrap_err();
        assert_eq!(panicked.kind, FailureKind::Panicked);
        assert!(panicked.message.contains("loader exploded"));
    }

    #[tokio::test]
    async fn test_worker_bound_is_respected() {
        let loader = Arc::new(ScriptedLoader::default());
        let orchestrator = LoadOrchestrator::new(loader.clone(), 2);
        let repos = (0..6).map(|i| repo(&format!("a/r{}", i))).collect();
        let results = orchestrator.run(repos).await;
        assert_eq!(results.len(), 6);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 6);
        assert!(loader.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_results_arrive_in_completion_order() {
        let loader = Arc::new(ScriptedLoader::default());
        let orchestrator = LoadOrchestrator::new(loader, 2);
        let results = orchestrator.run(vec![repo("a/late"), repo("a/quick")]).await;
        let order: Vec<_> = results.iter().map(|r| r.repo.full_name.as_str()).collect();
        assert_eq!(order, vec!["a/quick", "a/late"]);
    }

    #[tokio::test]
    async fn test_repo_timeout() {
        let loader = Arc::new(ScriptedLoader::default());
        let orchestrator = LoadOrchestrator::new(loader, 2)
            .with_repo_timeout(Some(Duration::from_millis(30)));
        let results = orchestrator.run(vec![repo("a/slow"), repo("a/ok")]).await;
        let results = by_name(&results);
        assert_eq!(
            results["a/slow"].outcome.as_ref().unwrap_err().kind,
            FailureKind::TimedOut
        );
        assert!(results["a/ok"].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_start_schedules_nothing() {
        let loader = Arc::new(ScriptedLoader::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orchestrator = LoadOrchestrator::new(loader.clone(), 2).with_cancellation(cancel);
        let results = orchestrator.run(vec![repo("a/one"), repo("a/two")]).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.outcome.as_ref().unwrap_err().kind == FailureKind::Cancelled));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_aborts_after_grace() {
        let loader = Arc::new(ScriptedLoader::default());
        let orchestrator = LoadOrchestrator::new(loader.clone(), 1)
            .with_grace_period(Duration::from_millis(20));
        let cancel = orchestrator.cancellation_token();

        let started = std::time::Instant::now();
        let mut rx = orchestrator.spawn(vec![repo("a/slow1"), repo("a/slow2"), repo("a/slow3")]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.outcome.as_ref().unwrap_err().kind == FailureKind::Cancelled));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }
}
