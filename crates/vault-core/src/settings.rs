//! Scalar settings kept next to the note data in the local store.

use crate::credentials::CredentialProvider;
use crate::remote::{Fingerprint, RemoteTarget};
use crate::store::{self, LocalStore};
use serde_json::Value;
use tracing::debug;

/// Gist URL (or bare id) of the shared remote document.
pub const GIST_URL_KEY: &str = "githubGistUrl";
/// Encrypted access token.
pub const ENCRYPTED_TOKEN_KEY: &str = "githubPat";
/// Fingerprint of the context document last observed by this device.
pub const CONTEXT_FINGERPRINT_KEY: &str = "lastKnownSha";

/// Extract the Gist id from a Gist URL. Bare ids pass through unchanged.
///
/// `https://gist.github.com/user/0123abcd` -> `0123abcd`
pub fn gist_id_from_url(url: &str) -> Option<String> {
    url.trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(|s| s.trim_end_matches(".git").to_string())
        .filter(|s| !s.is_empty())
}

/// Why a sync could not resolve its remote target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// No Gist URL stored.
    NoTarget,
    /// No encrypted token stored.
    NoCredential,
    /// Token could not be decrypted.
    Undecryptable(String),
}

/// Typed view over the settings keys of a [`LocalStore`].
pub struct SyncSettings<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: LocalStore + ?Sized> SyncSettings<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    async fn string(&self, key: &str) -> store::Result<Option<String>> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty()))
    }

    pub async fn gist_url(&self) -> store::Result<Option<String>> {
        self.string(GIST_URL_KEY).await
    }

    pub async fn encrypted_token(&self) -> store::Result<Option<String>> {
        self.string(ENCRYPTED_TOKEN_KEY).await
    }

    /// Store the remote target and its already-encrypted token.
    pub async fn configure(&self, gist_url: &str, encrypted_token: &str) -> store::Result<()> {
        self.store
            .set_many(vec![
                (GIST_URL_KEY.into(), Value::from(gist_url)),
                (ENCRYPTED_TOKEN_KEY.into(), Value::from(encrypted_token)),
            ])
            .await
    }

    /// Whether both a target and a credential are stored. Does not decrypt.
    pub async fn is_configured(&self) -> store::Result<bool> {
        Ok(self.gist_url().await?.is_some() && self.encrypted_token().await?.is_some())
    }

    pub async fn fingerprint(&self, key: &str) -> store::Result<Option<Fingerprint>> {
        Ok(self.string(key).await?.map(Fingerprint::new))
    }

    pub async fn set_fingerprint(&self, key: &str, fingerprint: &Fingerprint) -> store::Result<()> {
        self.store.set(key, Value::from(fingerprint.as_str())).await
    }

    /// Resolve the remote target, decrypting the stored token.
    ///
    /// Store failures propagate; missing or undecryptable settings come back
    /// as `Ok(Err(Unavailable))` so callers can skip quietly.
    pub async fn resolve_target(
        &self,
        credentials: &dyn CredentialProvider,
    ) -> store::Result<Result<RemoteTarget, Unavailable>> {
        let Some(id) = self.gist_url().await?.as_deref().and_then(gist_id_from_url) else {
            return Ok(Err(Unavailable::NoTarget));
        };
        let Some(ciphertext) = self.encrypted_token().await? else {
            return Ok(Err(Unavailable::NoCredential));
        };

        match credentials.decrypt(&ciphertext).await {
            Ok(token) if !token.is_empty() => Ok(Ok(RemoteTarget { id, token })),
            Ok(_) => Ok(Err(Unavailable::Undecryptable("empty token".into()))),
            Err(e) => {
                debug!("Credential decrypt failed: {}", e);
                Ok(Err(Unavailable::Undecryptable(e.to_string())))
            }
        }
    }
}
