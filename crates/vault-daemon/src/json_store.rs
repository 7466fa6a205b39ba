//! File-backed LocalStore.
//!
//! The whole store is one JSON object on disk. Writes go to a temporary file
//! that is renamed over the original, so a crash leaves either the old or the
//! new document, never a torn one. The in-memory copy only changes after the
//! rename succeeds.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use vault_core::store::{LocalStore, Result, StoreError};

pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes writers and holds the last committed document.
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path).await {
            Ok(contents) => parse_document(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store at {:?}, starting empty", path);
                BTreeMap::new()
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let contents = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn write_all(&self, updates: Vec<(String, Value)>) -> Result<()> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        next.extend(updates);
        self.persist(&next).await?;
        *values = next;
        Ok(())
    }
}

fn parse_document(contents: &str) -> Result<BTreeMap<String, Value>> {
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let document: Map<String, Value> = serde_json::from_str(contents)
        .map_err(|e| StoreError::Corrupt(format!("store is not a JSON object: {e}")))?;
    Ok(document.into_iter().collect())
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.values.lock().await.clone())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.write_all(vec![(key.to_string(), value)]).await
    }

    async fn set_many(&self, values: Vec<(String, Value)>) -> Result<()> {
        self.write_all(values).await
    }
}
