//! RemoteClient over the GitHub Gist REST API.
//!
//! One Gist holds both documents, each in its own file. The fingerprint of a
//! document is the Gist's latest revision id, so any push to the Gist moves
//! it.

use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;
use vault_core::remote::{Fingerprint, RemoteClient, RemoteDocument, RemoteError, RemoteTarget, Result};

/// File holding the context snapshot.
pub const CONTEXT_FILE: &str = "ai_context_vault_data.json";
/// File holding the activity log document.
pub const LOG_FILE: &str = "ai_context_vault_god_mode_data.json";

const USER_AGENT: &str = concat!("ai-context-vault/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";

#[derive(Debug, Deserialize)]
struct Gist {
    #[serde(default)]
    files: HashMap<String, Option<GistFile>>,
    #[serde(default)]
    history: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    version: String,
}

/// Where a file's content can be read from.
#[derive(Debug, PartialEq)]
enum FileContent {
    Missing,
    Inline(String),
    /// Too large for the Gist response; fetch from the raw URL.
    Raw(String),
}

fn file_content(gist: &Gist, file_name: &str) -> FileContent {
    let Some(Some(file)) = gist.files.get(file_name) else {
        return FileContent::Missing;
    };
    match (&file.content, file.truncated, &file.raw_url) {
        (_, true, Some(url)) => FileContent::Raw(url.clone()),
        (Some(content), _, _) => FileContent::Inline(content.clone()),
        (None, _, Some(url)) => FileContent::Raw(url.clone()),
        (None, _, None) => FileContent::Missing,
    }
}

fn latest_revision(history: &[Revision]) -> Option<Fingerprint> {
    history.first().map(|r| Fingerprint::new(r.version.clone()))
}

/// Parse a stored document. Empty files read as an empty object.
fn parse_content(content: &str) -> Result<Value> {
    if content.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(content).map_err(|e| RemoteError::Malformed(e.to_string()))
}

fn network(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

/// Map non-success statuses to errors.
fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Unauthorized),
        _ => Err(RemoteError::Status {
            status: status.as_u16(),
        }),
    }
}

pub struct GistClient {
    http: HttpClient,
    api_base: String,
    file_name: String,
}

impl GistClient {
    pub fn new(api_base: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            api_base: api_base.into(),
            file_name: file_name.into(),
        }
    }

    /// Share one HTTP connection pool between clients for different files.
    pub fn with_http(http: HttpClient, api_base: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            file_name: file_name.into(),
        }
    }

    fn gist_url(&self, id: &str) -> String {
        format!("{}/gists/{}", self.api_base, id)
    }

    fn request(&self, method: reqwest::Method, url: &str, target: &RemoteTarget) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("token {}", target.token))
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, ACCEPT)
    }

    async fn fetch_raw(&self, url: &str, target: &RemoteTarget) -> Result<String> {
        let resp = self
            .request(reqwest::Method::GET, url, target)
            .send()
            .await
            .map_err(network)?;
        check_status(resp)?.text().await.map_err(network)
    }
}

#[async_trait]
impl RemoteClient for GistClient {
    async fn get(&self, target: &RemoteTarget) -> Result<Option<RemoteDocument>> {
        let resp = self
            .request(reqwest::Method::GET, &self.gist_url(&target.id), target)
            .send()
            .await
            .map_err(network)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let gist: Gist = check_status(resp)?
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;

        let content = match file_content(&gist, &self.file_name) {
            FileContent::Missing => {
                debug!(file = %self.file_name, "Gist has no such file yet");
                return Ok(None);
            }
            FileContent::Inline(content) => content,
            FileContent::Raw(url) => self.fetch_raw(&url, target).await?,
        };
        let content = parse_content(&content)?;
        let fingerprint = latest_revision(&gist.history).unwrap_or_else(|| Fingerprint::of_content(&content));

        Ok(Some(RemoteDocument { content, fingerprint }))
    }

    async fn put(&self, target: &RemoteTarget, content: &Value) -> Result<Fingerprint> {
        let text = serde_json::to_string_pretty(content).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let mut files = serde_json::Map::new();
        files.insert(self.file_name.clone(), json!({ "content": text }));
        let body = json!({ "files": files });

        let resp = self
            .request(reqwest::Method::PATCH, &self.gist_url(&target.id), target)
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        let gist: Gist = check_status(resp)?
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;

        latest_revision(&gist.history)
            .ok_or_else(|| RemoteError::Malformed("update response carries no revision".into()))
    }

    async fn probe_fingerprint(&self, target: &RemoteTarget) -> Result<Option<Fingerprint>> {
        let url = format!("{}/commits?per_page=1", self.gist_url(&target.id));
        let resp = self
            .request(reqwest::Method::GET, &url, target)
            .send()
            .await
            .map_err(network)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let commits: Vec<Revision> = check_status(resp)?
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(latest_revision(&commits))
    }
}
