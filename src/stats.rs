//! Human-readable run summaries.
//!
//! Printed to stdout after `git2vec run`; logs go to stderr, so the summary
//! (or its `--json` form) can be piped on its own.

use std::collections::BTreeMap;

use git2vec_core::models::{FailureKind, PipelineRun};

/// Render the summary of a finished run.
pub fn format_summary(run: &PipelineRun) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line("run".to_string());
    line(format!("  repos discovered: {}", run.repos_discovered));
    if run.repos_skipped > 0 {
        line(format!("  repos skipped (empty): {}", run.repos_skipped));
    }
    line(format!(
        "  repos loaded: {} / {} ({} failed)",
        run.repos_succeeded, run.repos_attempted, run.repos_failed
    ));
    line(format!(
        "  documents: {} ({} files skipped)",
        run.documents_loaded, run.files_skipped
    ));
    line(format!(
        "  chunks embedded: {} ({} failed)",
        run.chunks_embedded, run.chunks_failed
    ));
    if run.vectors_upserted > 0 || run.vectors_failed > 0 {
        line(format!(
            "  vectors upserted: {} ({} failed)",
            run.vectors_upserted, run.vectors_failed
        ));
    }
    line(format!("  batches written: {}", run.batches_written));
    for artifact in &run.artifacts {
        line(format!("    {}", artifact));
    }
    if let Some(finished) = run.finished_at {
        let elapsed = finished - run.started_at;
        line(format!(
            "  elapsed: {:.1}s",
            elapsed.num_milliseconds() as f64 / 1000.0
        ));
    }

    if !run.failures.is_empty() {
        line(String::new());
        line("  failures by kind:".to_string());
        for (kind, count) in failure_counts(run) {
            line(format!("    {:<24} {:>4}", kind, count));
        }
        line(String::new());
        line(format!("  {:<40} {}", "REPO", "REASON"));
        line(format!("  {}", "-".repeat(76)));
        for failure in &run.failures {
            line(format!(
                "  {:<40} {}",
                failure.repo,
                first_line(&failure.message)
            ));
        }
    }

    if let Some(fatal) = &run.fatal {
        line(String::new());
        line(format!("  aborted: {}", first_line(fatal)));
    }

    let verdict = if run.fatal.is_some() {
        "aborted"
    } else if run.is_clean() {
        "ok"
    } else {
        "done with failures"
    };
    line(verdict.to_string());
    out
}

pub fn print_summary(run: &PipelineRun) {
    print!("{}", format_summary(run));
}

fn failure_counts(run: &PipelineRun) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for failure in &run.failures {
        *counts.entry(kind_label(failure.kind)).or_insert(0) += 1;
    }
    counts
}

fn kind_label(kind: FailureKind) -> String {
    match kind {
        FailureKind::Clone(k) => format!("clone/{:?}", k).to_lowercase(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
