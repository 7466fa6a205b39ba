//! Directory-backed BlobStore using tokio::fs.
//!
//! One file per blob, named by its fingerprint.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use vault_core::blobs::{BlobError, BlobStore, Result};

pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        // Fingerprints are lowercase hex; anything else could escape the directory.
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::Encoding(format!("invalid blob name: {hash}")));
        }
        Ok(self.base_path.join(hash))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.blob_path(hash)?.exists())
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(hash)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(e.to_string())),
        }
    }

    async fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(hash)?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))
    }
}
