//! RemoteClient trait for the shared remote document.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `GistClient` (in vault-daemon) - GitHub Gist REST API

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote returned status {status}")]
    Status { status: u16 },

    #[error("Remote rejected credentials")]
    Unauthorized,

    #[error("Malformed remote document: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Opaque version token of the remote document. Compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fingerprint derived from document content (SHA-256 of its JSON).
    pub fn of_content(content: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where and as whom to reach the remote document.
#[derive(Clone)]
pub struct RemoteTarget {
    /// Opaque document identifier (a Gist id).
    pub id: String,
    /// Decrypted access token.
    pub token: String,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A fetched remote document.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    pub content: Value,
    pub fingerprint: Fingerprint,
}

/// Narrow client for the single shared remote document.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the document. `Ok(None)` when it does not exist yet.
    async fn get(&self, target: &RemoteTarget) -> Result<Option<RemoteDocument>>;

    /// Replace the document, returning its new fingerprint.
    async fn put(&self, target: &RemoteTarget, content: &Value) -> Result<Fingerprint>;

    /// Cheap version probe. `Ok(None)` when the document does not exist.
    async fn probe_fingerprint(&self, target: &RemoteTarget) -> Result<Option<Fingerprint>>;
}

#[async_trait]
impl<T: RemoteClient + ?Sized> RemoteClient for std::sync::Arc<T> {
    async fn get(&self, target: &RemoteTarget) -> Result<Option<RemoteDocument>> {
        (**self).get(target).await
    }

    async fn put(&self, target: &RemoteTarget, content: &Value) -> Result<Fingerprint> {
        (**self).put(target, content).await
    }

    async fn probe_fingerprint(&self, target: &RemoteTarget) -> Result<Option<Fingerprint>> {
        (**self).probe_fingerprint(target).await
    }
}

/// Call counters for [`InMemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub gets: usize,
    pub puts: usize,
    pub probes: usize,
}

/// In-memory remote for testing.
///
/// Fingerprints are content hashes, so replacing a document with identical
/// content leaves its fingerprint unchanged.
#[derive(Default)]
pub struct InMemoryRemote {
    documents: RwLock<HashMap<String, Value>>,
    stats: RwLock<RemoteStats>,
    /// When set, every call fails with this status.
    failing: RwLock<Option<u16>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document directly, as if another device had pushed it.
    pub fn seed(&self, id: &str, content: Value) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), content);
    }

    pub fn content(&self, id: &str) -> Option<Value> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn stats(&self) -> RemoteStats {
        *self.stats.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent call fail with `status` (or succeed again with `None`).
    pub fn set_failing(&self, status: Option<u16>) {
        *self.failing.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn check_failing(&self) -> Result<()> {
        match *self.failing.read().unwrap_or_else(|e| e.into_inner()) {
            Some(status) => Err(RemoteError::Status { status }),
            None => Ok(()),
        }
    }

    fn record(&self, f: impl FnOnce(&mut RemoteStats)) {
        f(&mut self.stats.write().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn get(&self, target: &RemoteTarget) -> Result<Option<RemoteDocument>> {
        self.record(|s| s.gets += 1);
        self.check_failing()?;
        Ok(self.content(&target.id).map(|content| RemoteDocument {
            fingerprint: Fingerprint::of_content(&content),
            content,
        }))
    }

    async fn put(&self, target: &RemoteTarget, content: &Value) -> Result<Fingerprint> {
        self.record(|s| s.puts += 1);
        self.check_failing()?;
        self.seed(&target.id, content.clone());
        Ok(Fingerprint::of_content(content))
    }

    async fn probe_fingerprint(&self, target: &RemoteTarget) -> Result<Option<Fingerprint>> {
        self.record(|s| s.probes += 1);
        self.check_failing()?;
        Ok(self.content(&target.id).map(|c| Fingerprint::of_content(&c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> RemoteTarget {
        RemoteTarget {
            id: "gist1".into(),
            token: "secret".into(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_remote_roundtrip() {
        let remote = InMemoryRemote::new();
        assert!(remote.get(&target()).await.unwrap().is_none());
        assert!(remote.probe_fingerprint(&target()).await.unwrap().is_none());

        let fp = remote.put(&target(), &json!({"a": 1})).await.unwrap();
        let doc = remote.get(&target()).await.unwrap().unwrap();
        assert_eq!(doc.fingerprint, fp);
        assert_eq!(doc.content, json!({"a": 1}));

        let same = remote.put(&target(), &json!({"a": 1})).await.unwrap();
        assert_eq!(same, fp, "identical content keeps its fingerprint");

        let changed = remote.put(&target(), &json!({"a": 2})).await.unwrap();
        assert_ne!(changed, fp);

        assert_eq!(
            remote.stats(),
            RemoteStats {
                gets: 2,
                puts: 3,
                probes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failing_remote() {
        let remote = InMemoryRemote::new();
        remote.set_failing(Some(502));
        assert!(matches!(
            remote.get(&target()).await,
            Err(RemoteError::Status { status: 502 })
        ));
    }

    #[test]
    fn test_target_debug_redacts_token() {
        let debug = format!("{:?}", target());
        assert!(!debug.contains("secret"));
    }
}
