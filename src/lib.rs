//! # git2vec
//!
//! Discover popular GitHub repositories, extract their text files, and turn
//! them into embedding vectors.
//!
//! A run searches for repositories matching a language and creation window,
//! clones each one into its own throwaway workspace under a bounded worker
//! pool, splits every text file into token windows, embeds them in batches,
//! and writes the result to a vector index, to batched Parquet files, or to
//! both. A failure in one repository never affects the others.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌────────────────┐   ┌─────────────┐
//! │ Discovery │──▶│ LoadOrchestrator │──▶│ ChunkerEmbedder│──▶│ VectorStore │
//! │ (GitHub)  │   │  GitLoader × N   │   │ chunk + embed  │   │ BatchWriter │
//! └───────────┘   └──────────────────┘   └────────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! git2vec discover --n-repos 5 --last-n-days 30 --language Python
//! git2vec run --n-repos 50 --last-n-days 30 --language Rust --write-batch-size 100
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`discovery`] | GitHub repository search |
//! | [`workspace`] | Request-scoped clone directories |
//! | [`connector_git`] | Clone a repository and extract documents |
//! | [`orchestrator`] | Bounded concurrent loading with failure isolation |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`embedder`] | Chunking and batched embedding |
//! | [`vector_store`] | Index setup and idempotent upserts |
//! | [`batch_writer`] | Atomic batched Parquet output |
//! | [`ingest`] | End-to-end pipeline |
//! | [`stats`] | Run summary formatting |
//! | [`retry`] | Exponential backoff for external calls |

pub mod batch_writer;
pub mod config;
pub mod connector_git;
pub mod discovery;
pub mod embedder;
pub mod embedding;
pub mod ingest;
pub mod orchestrator;
pub mod retry;
pub mod stats;
pub mod vector_store;
pub mod workspace;

pub use git2vec_core::{chunk, models, store, CloneErrorKind, Error, Result};
