//! In-memory [`VectorIndex`] implementation for testing and local runs.
//!
//! Uses `HashMap`s behind a single `std::sync::RwLock`. Index creation
//! checks for an existing name and inserts under the same write guard, so
//! racing creators see exactly one `Created`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{CreateOutcome, IndexSpec, VectorIndex, VectorRecord};

struct StoredIndex {
    spec: IndexSpec,
    records: HashMap<String, VectorRecord>,
}

/// In-memory vector store.
pub struct InMemoryIndex {
    indexes: RwLock<HashMap<String, StoredIndex>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StoredIndex>> {
        self.indexes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredIndex>> {
        self.indexes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of indexes created so far.
    pub fn index_count(&self) -> usize {
        self.read().len()
    }

    /// Number of records stored in `index` (0 if it does not exist).
    pub fn len(&self, index: &str) -> usize {
        self.read().get(index).map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    pub fn get(&self, index: &str, id: &str) -> Option<VectorRecord> {
        self.read()
            .get(index)
            .and_then(|i| i.records.get(id).cloned())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn describe_index(&self, name: &str) -> Result<Option<IndexSpec>> {
        Ok(self.read().get(name).map(|i| i.spec.clone()))
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<CreateOutcome> {
        let mut indexes = self.write();
        if indexes.contains_key(&spec.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        indexes.insert(
            spec.name.clone(),
            StoredIndex {
                spec: spec.clone(),
                records: HashMap::new(),
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn upsert(&self, index: &str, records: &[VectorRecord]) -> Result<usize> {
        let mut indexes = self.write();
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| Error::validation(format!("index '{}' does not exist", index)))?;

        if let Some(bad) = records
            .iter()
            .find(|r| r.values.len() != stored.spec.dimension)
        {
            return Err(Error::validation(format!(
                "vector '{}' has dimension {}, index '{}' expects {}",
                bad.id,
                bad.values.len(),
                index,
                stored.spec.dimension
            )));
        }

        for record in records {
            stored.records.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Metric;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn spec(name: &str, dimension: usize) -> IndexSpec {
        IndexSpec {
            name: name.to_string(),
            dimension,
            metric: Metric::Cosine,
        }
    }

    fn record(id: &str, values: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            values,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryIndex::new();
        assert_eq!(
            store.create_index(&spec("code", 3)).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.create_index(&spec("code", 3)).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(store.index_count(), 1);
        assert_eq!(
            store.describe_index("code").await.unwrap(),
            Some(spec("code", 3))
        );
        assert_eq!(store.describe_index("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_racing_creates_yield_one_index() {
        let store = Arc::new(InMemoryIndex::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create_index(&spec("shared", 4)).await.unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() == CreateOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.index_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_id() {
        let store = InMemoryIndex::new();
        store.create_index(&spec("code", 2)).await.unwrap();
        store
            .upsert("code", &[record("a", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("code", &[record("a", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.len("code"), 1);
        assert_eq!(store.get("code", "a").unwrap().values, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dimension() {
        let store = InMemoryIndex::new();
        store.create_index(&spec("code", 2)).await.unwrap();
        let err = store
            .upsert("code", &[record("a", vec![1.0, 0.0, 0.5])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.is_empty("code"));
    }

    #[tokio::test]
    async fn test_upsert_into_missing_index() {
        let store = InMemoryIndex::new();
        assert!(store.upsert("nope", &[record("a", vec![1.0])]).await.is_err());
    }
}
