//! # git2vec CLI
//!
//! ## Usage
//!
//! ```bash
//! git2vec --config ./config/git2vec.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `git2vec run` | Discover, load, embed, and write repositories |
//! | `git2vec discover` | Print the repositories a run would load |
//!
//! Logs go to stderr (filter with `RUST_LOG`, default `git2vec=info`); the
//! run summary goes to stdout.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use git2vec::config::{self, Config};
use git2vec::discovery::{DiscoveryQuery, GitHubSearch, RepoSource, SortKey, SortOrder};
use git2vec::ingest::{Pipeline, PipelineParams};
use git2vec::stats;
use git2vec::Error;

const DEFAULT_CONFIG: &str = "./config/git2vec.toml";

/// git2vec: turn popular GitHub repositories into embedding vectors.
#[derive(Parser)]
#[command(name = "git2vec", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/git2vec.toml` when it exists, otherwise to
    /// built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SearchArgs {
    /// Maximum number of repositories.
    #[arg(long)]
    n_repos: usize,

    /// Only repositories created within this many days.
    #[arg(long)]
    last_n_days: u32,

    /// Primary language filter (e.g. `Python`).
    #[arg(long)]
    language: Option<String>,

    #[arg(long, value_enum, default_value_t = SortKey::Stars)]
    sort: SortKey,

    #[arg(long, value_enum, default_value_t = SortOrder::Desc)]
    order: SortOrder,
}

impl SearchArgs {
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

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and print a summary.
    Run {
        #[command(flatten)]
        search: SearchArgs,

        /// Documents per output file (overrides `output.write_batch_size`).
        #[arg(long)]
        write_batch_size: Option<usize>,

        /// Leave cloned repositories on disk.
        #[arg(long)]
        keep_workspaces: bool,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search for repositories without loading them.
    Discover {
        #[command(flatten)]
        search: SearchArgs,
    },
}

fn load(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                config::load_config(&default)
            } else {
                config::parse_config("")
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("git2vec=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            search,
            write_batch_size,
            keep_workspaces,
            json,
        } => {
            let params = PipelineParams {
                n_repos: search.n_repos,
                last_n_days: search.last_n_days,
                language: search.language.clone(),
                sort: search.sort,
                order: search.order,
                write_batch_size,
                delete: !keep_workspaces,
            };
            let pipeline = Pipeline::from_config(&cfg).context("Failed to set up pipeline")?;

            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; finishing in-flight repositories");
                    cancel.cancel();
                }
            });

            let (run, fatal) = match pipeline.run(&params).await {
                Ok(run) => (run, None),
                Err(Error::RunAborted { run, source }) => (*run, Some(*source)),
                Err(e) => return Err(e).context("Pipeline failed"),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                stats::print_summary(&run);
            }
            if let Some(e) = fatal {
                return Err(e).context("Pipeline failed");
            }
        }
        Commands::Discover { search } => {
            let source = GitHubSearch::from_env(&cfg.discovery)?;
            let repos = source
                .get_top_repos(&search.query())
                .await
                .context("Discovery failed")?;
            for repo in &repos {
                println!(
                    "{:<48} {:>7}★  {}  {}  {}",
                    repo.full_name,
                    repo.stars,
                    repo.language.as_deref().unwrap_or("-"),
                    repo.created_at.format("%Y-%m-%d"),
                    repo.url
                );
            }
            println!("{} repositories", repos.len());
        }
    }

    Ok(())
}
