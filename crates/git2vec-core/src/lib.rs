//! # git2vec core
//!
//! Shared, I/O-free logic for git2vec: data models, the error taxonomy,
//! token-window chunking with deterministic chunk ids, and the embedding
//! provider and vector index traits.
//!
//! This crate contains no tokio, HTTP, git, or filesystem code.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod store;

pub use error::{CloneErrorKind, Error, Result};
