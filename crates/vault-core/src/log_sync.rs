//! Activity-log reconciliation.
//!
//! Same cycle shape as the context coordinator (single flight, time bound,
//! commit under the write lock) with a different merge: remote entries form
//! the base list and local entries are appended only when their identity is
//! absent remotely. Local edits to an already-synced entry do not propagate.
//!
//! Binary attachments are stored once per content fingerprint. Entries carry
//! [`Attachment::Stored`] references; the remote document carries the blob
//! bytes in a hash-keyed map.

use crate::blobs::{blob_fingerprint, store_deduped, BlobError, BlobStore};
use crate::credentials::CredentialProvider;
use crate::events::{EventBus, SyncEvent};
use crate::flight::{self, CancelReason, SingleFlight, SyncOutcome};
use crate::model::{now_millis, Attachment, LogEntry, LogIdentity};
use crate::notes::WriteLock;
use crate::remote::{RemoteClient, RemoteTarget};
use crate::settings::SyncSettings;
use crate::store::{self, LocalStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Local store key holding the activity log list.
pub const LOGS_KEY: &str = "godModeLogs";

/// How many trailing entries `append` compares against for duplicates.
const RECENT_WINDOW: usize = 10;

const KIND: &str = "logs";

#[derive(Debug, Clone)]
pub struct LogSyncConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for LogSyncConfig {
    fn default() -> Self {
        Self {
            timeout: crate::LOG_SYNC_TIMEOUT,
            interval: crate::LOG_SYNC_INTERVAL,
        }
    }
}

/// A blob as carried in the remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBlob {
    pub mime: String,
    /// Standard base64.
    pub data: String,
}

/// Remote log document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogDocument {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub blobs: BTreeMap<String, RemoteBlob>,
}

impl LogDocument {
    /// Decode leniently: a malformed document reads as empty.
    pub fn from_json(value: Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Malformed remote log document, treating as empty: {}", e);
            Self::default()
        })
    }
}

/// Summary of a completed log sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSyncReport {
    /// Entries in the merged list.
    pub total: usize,
    /// Entries that arrived from the remote.
    pub added: usize,
    /// Local blobs newly attached to the remote document.
    pub uploaded_blobs: usize,
}

/// Union remote-first: local entries are appended when their identity is not
/// present remotely. Returns the merged list and how many remote entries were
/// new to this device.
pub fn merge_logs(remote: &[LogEntry], local: &[LogEntry]) -> (Vec<LogEntry>, usize) {
    let remote_ids: HashSet<LogIdentity> = remote.iter().map(LogEntry::identity).collect();
    let local_ids: HashSet<LogIdentity> = local.iter().map(LogEntry::identity).collect();

    let added = remote_ids.difference(&local_ids).count();
    let mut merged = remote.to_vec();
    merged.extend(
        local
            .iter()
            .filter(|entry| !remote_ids.contains(&entry.identity()))
            .cloned(),
    );
    (merged, added)
}

pub struct LogSync {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    credentials: Arc<dyn CredentialProvider>,
    blobs: Arc<dyn BlobStore>,
    events: Arc<EventBus>,
    write_lock: WriteLock,
    flight: SingleFlight,
    interval: Duration,
    periodic: Mutex<Option<CancellationToken>>,
}

impl LogSync {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        blobs: Arc<dyn BlobStore>,
        events: Arc<EventBus>,
        write_lock: WriteLock,
        config: LogSyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            credentials,
            blobs,
            events,
            write_lock,
            flight: SingleFlight::new(KIND, config.timeout),
            interval: config.interval,
            periodic: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Local log list, oldest first.
    pub async fn logs(&self) -> store::Result<Vec<LogEntry>> {
        match self.store.get(LOGS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Unreadable local log list, starting empty: {}", e);
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    async fn save_logs(&self, logs: &[LogEntry]) -> store::Result<()> {
        self.store.set(LOGS_KEY, serde_json::to_value(logs)?).await
    }

    /// Record a captured message.
    ///
    /// Returns `None` when one of the last few entries already has the same
    /// text and type. Inline attachments are moved into the blob store.
    pub async fn append(&self, mut entry: LogEntry) -> flight::Result<Option<LogEntry>> {
        let _guard = self.write_lock.lock().await;
        let mut logs = self.logs().await?;

        let recent = logs.len().saturating_sub(RECENT_WINDOW);
        if logs[recent..]
            .iter()
            .any(|e| e.text == entry.text && e.kind == entry.kind)
        {
            debug!("Skipping duplicate log entry");
            return Ok(None);
        }

        if entry.id.is_none() {
            entry.id = Some(Uuid::new_v4().to_string());
        }
        if entry.metadata.timestamp == 0 {
            entry.metadata.timestamp = now_millis();
        }
        self.store_attachments(&mut entry).await?;

        logs.push(entry.clone());
        self.save_logs(&logs).await?;
        Ok(Some(entry))
    }

    /// Drop the local log list. Stored blobs and the remote document are left
    /// alone, so the next sync brings remote entries back.
    pub async fn clear_logs(&self) -> store::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_logs(&[]).await?;
        info!("Cleared local activity logs");
        Ok(())
    }

    /// Rewrite inline attachments as references to deduplicated blobs.
    async fn store_attachments(&self, entry: &mut LogEntry) -> flight::Result<()> {
        for attachment in &mut entry.attachments {
            let Attachment::Inline { mime, data } = &mut *attachment else {
                continue;
            };
            let bytes = BASE64
                .decode(data.as_bytes())
                .map_err(|e| BlobError::Encoding(e.to_string()))?;
            let (hash, created) = store_deduped(&*self.blobs, &bytes).await?;
            if !created {
                debug!(blob = %hash, "Attachment already stored");
            }
            *attachment = Attachment::Stored {
                mime: std::mem::take(mime),
                blob: hash,
            };
        }
        Ok(())
    }

    /// Run one log reconciliation cycle.
    pub async fn sync_logs(&self) -> flight::Result<SyncOutcome<LogSyncReport>> {
        let outcome = self.flight.run(|token| self.run_cycle(token)).await;
        match outcome {
            Ok(Ok(outcome)) => {
                if let SyncOutcome::Cancelled(_) = outcome {
                    self.events.emit(SyncEvent::SyncCancelled { kind: KIND.into() });
                }
                Ok(outcome)
            }
            Ok(Err(e)) => {
                error!("Log sync failed: {}", e);
                self.events.emit(SyncEvent::SyncFailed {
                    kind: KIND.into(),
                    error: e.to_string(),
                });
                Err(e)
            }
            Err(reason) => {
                self.events.emit(SyncEvent::SyncCancelled { kind: KIND.into() });
                Ok(SyncOutcome::Cancelled(reason))
            }
        }
    }

    /// Pull the remote log document. `None` when nothing was fetched; callers
    /// treat that as an empty remote.
    async fn pull(&self, target: &RemoteTarget) -> Option<LogDocument> {
        match self.remote.get(target).await {
            Ok(Some(doc)) => Some(LogDocument::from_json(doc.content)),
            Ok(None) => None,
            Err(e) => {
                warn!("Log pull failed, treating remote as empty: {}", e);
                None
            }
        }
    }

    /// Blob map for the merged list: the verified remote map plus every local
    /// blob the merged entries reference and the remote lacks. Remote blobs
    /// missing locally are stored locally. Remote blobs whose bytes do not
    /// hash to their key are dropped, so a correct local copy replaces them.
    async fn reconcile_blobs(
        &self,
        logs: &[LogEntry],
        remote: &BTreeMap<String, RemoteBlob>,
    ) -> flight::Result<(BTreeMap<String, RemoteBlob>, usize)> {
        let mut merged = BTreeMap::new();
        for (hash, blob) in remote {
            let bytes = match BASE64.decode(blob.data.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(blob = %hash, "Skipping undecodable remote blob: {}", e);
                    continue;
                }
            };
            if blob_fingerprint(&bytes) != *hash {
                warn!(blob = %hash, "Skipping remote blob whose content does not match its key");
                continue;
            }
            if !self.blobs.contains(hash).await? {
                self.blobs.put(hash, &bytes).await?;
            }
            merged.insert(hash.clone(), blob.clone());
        }

        let mut uploaded = 0;
        for attachment in logs.iter().flat_map(|e| &e.attachments) {
            let Attachment::Stored { mime, blob } = attachment else {
                continue;
            };
            if merged.contains_key(blob) {
                continue;
            }
            match self.blobs.get(blob).await? {
                Some(bytes) => {
                    merged.insert(
                        blob.clone(),
                        RemoteBlob {
                            mime: mime.clone(),
                            data: BASE64.encode(bytes),
                        },
                    );
                    uploaded += 1;
                }
                None => warn!(blob = %blob, "Referenced blob missing locally"),
            }
        }
        Ok((merged, uploaded))
    }

    async fn run_cycle(&self, token: CancellationToken) -> flight::Result<SyncOutcome<LogSyncReport>> {
        let target = match SyncSettings::new(&*self.store)
            .resolve_target(&*self.credentials)
            .await?
        {
            Ok(target) => target,
            Err(reason) => {
                debug!(?reason, "Skipping log sync");
                return Ok(SyncOutcome::Skipped(reason));
            }
        };

        self.events.emit(SyncEvent::SyncStarted { kind: KIND.into() });

        let local = self.logs().await?;
        let fetched = self.pull(&target).await;
        let pulled = fetched.is_some();
        let remote = fetched.unwrap_or_default();
        let (mut merged, mut added) = merge_logs(&remote.logs, &local);

        {
            let _guard = self.write_lock.lock().await;
            if token.is_cancelled() {
                return Ok(SyncOutcome::Cancelled(CancelReason::Preempted));
            }
            let fresh = self.logs().await?;
            if fresh != local {
                debug!("Local logs changed during pull, re-merging");
                (merged, added) = merge_logs(&remote.logs, &fresh);
            }
            self.save_logs(&merged).await?;
        }

        let (blobs, uploaded_blobs) = self.reconcile_blobs(&merged, &remote.blobs).await?;
        let document = LogDocument { logs: merged, blobs };

        // Always a full pull and merge; the push is skipped only when the
        // fetched document already equals the merge.
        if !pulled || document != remote {
            let content = serde_json::to_value(&document).map_err(store::StoreError::from)?;
            self.remote.put(&target, &content).await?;
        }

        let report = LogSyncReport {
            total: document.logs.len(),
            added,
            uploaded_blobs,
        };
        info!(total = report.total, added, uploaded_blobs, "Log sync completed");
        self.events.emit(SyncEvent::LogsSynced {
            total: report.total,
            added,
        });
        self.events.emit(SyncEvent::SyncCompleted {
            kind: KIND.into(),
            count: report.total,
        });
        Ok(SyncOutcome::Completed(report))
    }

    /// Run `sync_logs` on the configured interval until [`stop_periodic`].
    ///
    /// [`stop_periodic`]: LogSync::stop_periodic
    pub fn spawn_periodic(self: &Arc<Self>) {
        let token = {
            let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
            if periodic.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *periodic = Some(token.clone());
            token
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Periodic log sync shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged inside sync_logs.
                        let _ = this.sync_logs().await;
                    }
                }
            }
        });
    }

    pub fn stop_periodic(&self) {
        if let Some(token) = self.periodic.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::InMemoryBlobStore;
    use crate::credentials;
    use crate::remote::InMemoryRemote;
    use crate::settings::{ENCRYPTED_TOKEN_KEY, GIST_URL_KEY};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Identity;

    #[async_trait]
    impl CredentialProvider for Identity {
        async fn decrypt(&self, ciphertext: &str) -> credentials::Result<String> {
            Ok(ciphertext.to_string())
        }

        async fn encrypt(&self, plaintext: &str) -> credentials::Result<String> {
            Ok(plaintext.to_string())
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        remote: Arc<InMemoryRemote>,
        blobs: Arc<InMemoryBlobStore>,
        sync: LogSync,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::with_values(vec![
            (GIST_URL_KEY.to_string(), json!("g1")),
            (ENCRYPTED_TOKEN_KEY.to_string(), json!("token")),
        ]));
        let remote = Arc::new(InMemoryRemote::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let sync = LogSync::new(
            store.clone(),
            remote.clone(),
            Arc::new(Identity),
            blobs.clone(),
            Arc::new(EventBus::new()),
            WriteLock::default(),
            LogSyncConfig::default(),
        );
        Fixture {
            store,
            remote,
            blobs,
            sync,
        }
    }

    fn message(id: &str, ts: i64, text: &str) -> LogEntry {
        let mut entry = LogEntry::new("chat", "output", text);
        entry.metadata.message_id = Some(id.into());
        entry.metadata.timestamp = ts;
        entry
    }

    fn with_image(mut entry: LogEntry, bytes: &[u8]) -> LogEntry {
        entry.attachments.push(Attachment::Inline {
            mime: "image/png".into(),
            data: BASE64.encode(bytes),
        });
        entry
    }

    #[test]
    fn test_merge_logs_is_remote_first_union() {
        let remote = vec![message("m1", 1, "remote text"), message("m2", 2, "b")];
        let local = vec![message("m1", 1, "edited locally"), message("m3", 3, "c")];

        let (merged, added) = merge_logs(&remote, &local);
        let texts: Vec<_> = merged.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["remote text", "b", "c"]);
        assert_eq!(added, 1);
    }

    #[test]
    fn test_identity_falls_back_to_content() {
        let a = LogEntry {
            metadata: crate::model::LogMetadata {
                chat_id: "chat".into(),
                timestamp: 5,
                ..Default::default()
            },
            ..LogEntry::new("chat", "input", "hello")
        };
        let (merged, _) = merge_logs(&[a.clone()], &[a.clone()]);
        assert_eq!(merged.len(), 1);

        let mut b = a.clone();
        b.metadata.timestamp = 6;
        let (merged, _) = merge_logs(&[a], &[b]);
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn test_append_dedups_recent_text() {
        let f = fixture();
        assert!(f.sync.append(LogEntry::new("c", "input", "hi")).await.unwrap().is_some());
        assert!(f.sync.append(LogEntry::new("c", "input", "hi")).await.unwrap().is_none());
        assert!(f.sync.append(LogEntry::new("c", "output", "hi")).await.unwrap().is_some());

        let logs = f.sync.logs().await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|e| e.id.is_some() && e.metadata.timestamp > 0));
    }

    #[tokio::test]
    async fn test_same_attachment_stored_once() {
        let f = fixture();
        let first = f
            .sync
            .append(with_image(LogEntry::new("c", "output", "one"), b"png bytes"))
            .await
            .unwrap()
            .unwrap();
        let second = f
            .sync
            .append(with_image(LogEntry::new("c", "output", "two"), b"png bytes"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.blobs.len(), 1);
        let expected = Attachment::Stored {
            mime: "image/png".into(),
            blob: blob_fingerprint(b"png bytes"),
        };
        assert_eq!(first.attachments, vec![expected.clone()]);
        assert_eq!(second.attachments, vec![expected]);
        assert_eq!(f.sync.logs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_base64_is_rejected() {
        let f = fixture();
        let mut entry = LogEntry::new("c", "output", "bad");
        entry.attachments.push(Attachment::Inline {
            mime: "image/png".into(),
            data: "***".into(),
        });
        assert!(f.sync.append(entry).await.is_err());
        assert!(f.sync.logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_logs_unions_and_uploads_blobs() {
        let f = fixture();
        f.sync
            .append(with_image(message("m2", 2, "local"), b"local image"))
            .await
            .unwrap();

        let remote_bytes = b"remote image";
        let remote_hash = blob_fingerprint(remote_bytes);
        let mut remote_entry = message("m1", 1, "remote");
        remote_entry.attachments.push(Attachment::Stored {
            mime: "image/jpeg".into(),
            blob: remote_hash.clone(),
        });
        f.remote.seed(
            "g1",
            serde_json::to_value(LogDocument {
                logs: vec![remote_entry],
                blobs: BTreeMap::from([(
                    remote_hash.clone(),
                    RemoteBlob {
                        mime: "image/jpeg".into(),
                        data: BASE64.encode(remote_bytes),
                    },
                )]),
            })
            .unwrap(),
        );

        let report = f.sync.sync_logs().await.unwrap().completed().unwrap();
        assert_eq!(
            report,
            LogSyncReport {
                total: 2,
                added: 1,
                uploaded_blobs: 1,
            }
        );

        let pushed = LogDocument::from_json(f.remote.content("g1").unwrap());
        assert_eq!(pushed.logs.len(), 2);
        assert_eq!(pushed.blobs.len(), 2);
        assert!(pushed.blobs.contains_key(&blob_fingerprint(b"local image")));

        // Remote blob is now available locally.
        assert_eq!(f.blobs.get(&remote_hash).await.unwrap().unwrap(), remote_bytes);
        assert_eq!(f.sync.logs().await.unwrap().len(), 2);

        // Log sync keeps no fingerprint of its own; the log list is its only state.
        let keys: Vec<_> = f.store.get_all().await.unwrap().into_keys().collect();
        assert_eq!(keys, vec![GIST_URL_KEY, ENCRYPTED_TOKEN_KEY, LOGS_KEY]);

        // Second cycle has nothing new and does not push again.
        let puts = f.remote.stats().puts;
        f.sync.sync_logs().await.unwrap();
        assert_eq!(f.remote.stats().puts, puts);
    }

    #[tokio::test]
    async fn test_mismatched_remote_blob_is_not_stored() {
        let f = fixture();
        let real_hash = blob_fingerprint(b"real image");
        f.remote.seed(
            "g1",
            serde_json::to_value(LogDocument {
                logs: vec![],
                blobs: BTreeMap::from([(
                    real_hash.clone(),
                    RemoteBlob {
                        mime: "image/png".into(),
                        data: BASE64.encode(b"WRONG BYTES"),
                    },
                )]),
            })
            .unwrap(),
        );

        f.sync.sync_logs().await.unwrap();
        assert!(!f.blobs.contains(&real_hash).await.unwrap());

        f.sync
            .append(with_image(message("m1", 1, "shot"), b"real image"))
            .await
            .unwrap();
        assert_eq!(f.blobs.get(&real_hash).await.unwrap().unwrap(), b"real image");

        // The next push carries the correct bytes under that key.
        f.sync.sync_logs().await.unwrap();
        let pushed = LogDocument::from_json(f.remote.content("g1").unwrap());
        assert_eq!(BASE64.decode(&pushed.blobs[&real_hash].data).unwrap(), b"real image");
    }

    #[tokio::test]
    async fn test_clear_logs_is_local_only() {
        let f = fixture();
        f.sync.append(message("m1", 1, "first")).await.unwrap();
        f.sync.sync_logs().await.unwrap();

        f.sync.clear_logs().await.unwrap();
        assert!(f.sync.logs().await.unwrap().is_empty());
        assert_eq!(LogDocument::from_json(f.remote.content("g1").unwrap()).logs.len(), 1);

        // Dedup only looks at the local list.
        assert!(f.sync.append(message("m2", 2, "first")).await.unwrap().is_some());

        let report = f.sync.sync_logs().await.unwrap().completed().unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.added, 1);
    }

    #[tokio::test]
    async fn test_malformed_remote_reads_as_empty() {
        let f = fixture();
        f.sync.append(message("m1", 1, "kept")).await.unwrap();
        f.remote.seed("g1", json!({ "logs": "not a list" }));

        let report = f.sync.sync_logs().await.unwrap().completed().unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.added, 0);
        assert_eq!(LogDocument::from_json(f.remote.content("g1").unwrap()).logs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_runs_on_interval() {
        let f = fixture();
        let sync = Arc::new(f.sync);
        sync.append(message("m1", 1, "hello")).await.unwrap();

        sync.spawn_periodic();
        tokio::time::sleep(crate::LOG_SYNC_INTERVAL * 2 + Duration::from_secs(1)).await;
        sync.stop_periodic();

        // First tick pushes, second finds the remote already current.
        let stats = f.remote.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.puts, 1);
    }
}
