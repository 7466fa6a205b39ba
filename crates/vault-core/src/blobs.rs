//! Content-addressed storage for binary attachments.
//!
//! Blobs are keyed by the SHA-256 of their bytes, so storing the same payload
//! twice yields one blob.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob encoding: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Content fingerprint of a binary payload (SHA-256, lowercase hex).
pub fn blob_fingerprint(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Device-local blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn contains(&self, hash: &str) -> Result<bool>;

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `hash`. Overwrites are harmless: same hash, same bytes.
    async fn put(&self, hash: &str, data: &[u8]) -> Result<()>;
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    async fn contains(&self, hash: &str) -> Result<bool> {
        (**self).contains(hash).await
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(hash).await
    }

    async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        (**self).put(hash, data).await
    }
}

/// Store `data` unless a blob with the same fingerprint already exists.
///
/// Returns the fingerprint and whether a new blob was written.
pub async fn store_deduped(store: &dyn BlobStore, data: &[u8]) -> Result<(String, bool)> {
    let hash = blob_fingerprint(data);
    if store.contains(&hash).await? {
        return Ok((hash, false));
    }
    store.put(&hash, data).await?;
    Ok((hash, true))
}

/// In-memory blob store for testing
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(hash))
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned())
    }

    async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash.to_string(), data.to_vec());
        Ok(())
    }
}
