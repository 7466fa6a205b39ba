//! CredentialProvider: turns the stored (encrypted) access token into a usable one.

use async_trait::async_trait;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential unavailable: {0}")]
    Unavailable(String),

    #[error("Encryption endpoint error: {0}")]
    Endpoint(String),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// External encrypt/decrypt service for the remote access token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<String>;

    async fn encrypt(&self, plaintext: &str) -> Result<String>;
}

#[async_trait]
impl<T: CredentialProvider + ?Sized> CredentialProvider for std::sync::Arc<T> {
    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        (**self).decrypt(ciphertext).await
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        (**self).encrypt(plaintext).await
    }
}

/// Caches the last decryption, keyed on the exact ciphertext.
///
/// Calling `encrypt` clears the cache since a new token is being stored.
pub struct CachedCredentials<P> {
    inner: P,
    cache: RwLock<Option<(String, String)>>,
}

impl<P: CredentialProvider> CachedCredentials<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: RwLock::new(None),
        }
    }

    fn cached(&self, ciphertext: &str) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        match cache.as_ref() {
            Some((c, plain)) if c == ciphertext => Some(plain.clone()),
            _ => None,
        }
    }

    fn clear(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for CachedCredentials<P> {
    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        if let Some(plain) = self.cached(ciphertext) {
            debug!("Using cached credential");
            return Ok(plain);
        }

        let plain = self.inner.decrypt(ciphertext).await?;
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) =
            Some((ciphertext.to_string(), plain.clone()));
        debug!("Credential decrypted and cached");
        Ok(plain)
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let ciphertext = self.inner.encrypt(plaintext).await?;
        self.clear();
        Ok(ciphertext)
    }
}
