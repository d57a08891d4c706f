//! Vector index abstraction for git2vec.
//!
//! The [`VectorIndex`] trait is the seam between the pipeline and an
//! external vector store. It covers only what ingestion needs: looking up an
//! index, creating one, and upserting vectors. Similarity queries belong to
//! the store itself.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distance metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::DotProduct => "dotproduct",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            "dotproduct" => Ok(Metric::DotProduct),
            other => Err(Error::validation(format!(
                "unknown metric '{}'; expected cosine, euclidean, or dotproduct",
                other
            ))),
        }
    }
}

/// Name, dimensionality, and metric of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
}

/// Result of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created it first; not an error.
    AlreadyExists,
}

/// Scalar metadata value attached to a stored vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

/// One `(id, vector, metadata)` triple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// Abstract vector store backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`describe_index`](VectorIndex::describe_index) | Look up an index by name |
/// | [`create_index`](VectorIndex::create_index) | Create an index, tolerating a concurrent creator |
/// | [`upsert`](VectorIndex::upsert) | Insert or overwrite records by id |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Returns `None` if no index with this name exists.
    async fn describe_index(&self, name: &str) -> Result<Option<IndexSpec>>;

    /// Create an index. Must report [`CreateOutcome::AlreadyExists`] rather
    /// than failing or duplicating when the name is already taken.
    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome>;

    /// Write records into `index`; a record whose id already exists replaces
    /// the stored one. Returns the number of records written.
    async fn upsert(&self, index: &str, records: &[VectorRecord]) -> Result<usize>;
}
