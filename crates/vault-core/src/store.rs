//! LocalStore trait abstraction for device-local key/value persistence.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `JsonFileStore` (in vault-daemon) - A single JSON document on disk

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Device-local key/value persistence.
///
/// There are no transactions across calls. Callers that read-modify-write the
/// same key must serialize themselves (see `notes::WriteLock`).
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read one value.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Read every key.
    async fn get_all(&self) -> Result<BTreeMap<String, Value>>;

    /// Write one value.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Write several values as one unit: either all land or none do.
    async fn set_many(&self, values: Vec<(String, Value)>) -> Result<()>;
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    /// Number of completed `set`/`set_many` calls
    writes: RwLock<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with initial values.
    pub fn with_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: RwLock::new(values.into_iter().collect()),
            writes: RwLock::new(0),
        }
    }

    /// Number of write calls that have completed.
    pub fn write_count(&self) -> usize {
        *self.writes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_writes(&self) {
        *self.writes.write().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.clone())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        self.bump_writes();
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.extend(entries);
        drop(values);
        self.bump_writes();
        Ok(())
    }
}

// Implement LocalStore for Arc<T> where T: LocalStore
// This allows tests to keep a handle on a store shared with services
#[async_trait]
impl<T: LocalStore + ?Sized> LocalStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        (**self).get(key).await
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        (**self).get_all().await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn set_many(&self, values: Vec<(String, Value)>) -> Result<()> {
        (**self).set_many(values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store_basic_operations() {
        let store = InMemoryStore::new();

        assert!(store.get("missing").await.unwrap().is_none());

        store.set("a", json!(1)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));

        store
            .set_many(vec![("b".into(), json!(2)), ("a".into(), json!(3))])
            .await
            .unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], json!(3));
        assert_eq!(store.write_count(), 2);
    }
}
