//! CredentialProvider backed by the token encryption worker.
//!
//! `POST {base}/encrypt` and `POST {base}/decrypt` with
//! `{ "action": ..., "data": ... }`, answering `{ "encrypted": ... }` or
//! `{ "decrypted": ... }`.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vault_core::credentials::{CredentialError, CredentialProvider, Result};

#[derive(Serialize)]
struct Request<'a> {
    action: &'a str,
    data: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    encrypted: Option<String>,
    decrypted: Option<String>,
    error: Option<String>,
}

pub struct HttpCredentialProvider {
    http: HttpClient,
    base_url: String,
}

impl HttpCredentialProvider {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn call(&self, action: &str, data: &str) -> Result<Reply> {
        let url = format!("{}/{}", self.base_url, action);
        debug!("Calling encryption endpoint: {}", action);
        let resp = self
            .http
            .post(&url)
            .json(&Request { action, data })
            .send()
            .await
            .map_err(|e| CredentialError::Endpoint(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CredentialError::Endpoint(format!("{action} failed with status {status}")));
        }
        resp.json()
            .await
            .map_err(|e| CredentialError::Endpoint(e.to_string()))
    }
}

fn field(value: Option<String>, reply_error: Option<String>, name: &str) -> Result<String> {
    match (value, reply_error) {
        (Some(value), _) if !value.is_empty() => Ok(value),
        (_, Some(error)) => Err(CredentialError::Unavailable(error)),
        _ => Err(CredentialError::Unavailable(format!("response has no {name} value"))),
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let reply = self.call("decrypt", ciphertext).await?;
        field(reply.decrypted, reply.error, "decrypted")
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let reply = self.call("encrypt", plaintext).await?;
        field(reply.encrypted, reply.error, "encrypted")
    }
}
