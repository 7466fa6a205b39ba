//! Process-scoped service graph.
//!
//! Everything shares one store, one write lock and one event bus. `open` wires
//! the native collaborators; `assemble` accepts any implementations so tests
//! can substitute in-memory ones.

use crate::blob_dir::FsBlobStore;
use crate::config::Config;
use crate::encryption::HttpCredentialProvider;
use crate::gist::{GistClient, CONTEXT_FILE, LOG_FILE};
use crate::json_store::JsonFileStore;
use anyhow::{Context, Result};
use reqwest::Client as HttpClient;
use std::sync::Arc;
use tracing::info;
use vault_core::{
    BlobStore, CachedCredentials, ChangeDetector, CoordinatorConfig, CredentialProvider,
    DetectorConfig, EventBus, LocalStore, LogSync, LogSyncConfig, Notes, RemoteClient,
    SyncCoordinator, SyncSettings, WriteLock,
};

pub struct Services {
    pub store: Arc<dyn LocalStore>,
    pub events: Arc<EventBus>,
    pub notes: Notes,
    pub coordinator: Arc<SyncCoordinator>,
    pub detector: Arc<ChangeDetector>,
    pub log_sync: Arc<LogSync>,
    credentials: Arc<dyn CredentialProvider>,
}

impl Services {
    pub async fn open(config: &Config) -> Result<Self> {
        let store = JsonFileStore::open(config.store_path())
            .await
            .with_context(|| format!("failed to open store at {:?}", config.store_path()))?;
        info!("Store: {:?}", store.path());

        let http = HttpClient::new();
        let context_remote = GistClient::with_http(http.clone(), &config.gist_api, CONTEXT_FILE);
        let log_remote = GistClient::with_http(http.clone(), &config.gist_api, LOG_FILE);
        let credentials = CachedCredentials::new(HttpCredentialProvider::new(http, &config.encryption_url));

        Ok(Self::assemble(
            Arc::new(store),
            Arc::new(context_remote),
            Arc::new(log_remote),
            Arc::new(credentials),
            Arc::new(FsBlobStore::new(config.blob_dir())),
        ))
    }

    pub fn assemble(
        store: Arc<dyn LocalStore>,
        context_remote: Arc<dyn RemoteClient>,
        log_remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let lock = WriteLock::default();
        let events = Arc::new(EventBus::new());

        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            context_remote,
            Arc::clone(&credentials),
            Arc::clone(&events),
            Arc::clone(&lock),
            CoordinatorConfig::default(),
        ));
        let detector = Arc::new(ChangeDetector::new(
            Arc::clone(&coordinator),
            Arc::clone(&events),
            DetectorConfig::default(),
        ));
        let log_sync = Arc::new(LogSync::new(
            Arc::clone(&store),
            log_remote,
            Arc::clone(&credentials),
            blobs,
            Arc::clone(&events),
            Arc::clone(&lock),
            LogSyncConfig::default(),
        ));

        Self {
            notes: Notes::new(Arc::clone(&store), lock),
            store,
            events,
            coordinator,
            detector,
            log_sync,
            credentials,
        }
    }

    /// Encrypt `token` and store it with the Gist reference.
    pub async fn configure(&self, gist: &str, token: &str) -> Result<()> {
        let encrypted = self
            .credentials
            .encrypt(token)
            .await
            .context("failed to encrypt token")?;
        SyncSettings::new(&*self.store)
            .configure(gist, &encrypted)
            .await?;
        Ok(())
    }
}
