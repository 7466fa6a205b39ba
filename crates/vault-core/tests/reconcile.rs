//! Integration tests for vault-core reconciliation.
//!
//! Two devices share one in-memory remote. A gated remote wrapper holds a
//! pull open so tests can interleave a second sync or a user edit with it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use vault_core::credentials;
use vault_core::remote;
use vault_core::settings::{ENCRYPTED_TOKEN_KEY, GIST_URL_KEY};
use vault_core::{
    CancelReason, ChangeDetector, CheckOutcome, CoordinatorConfig, CredentialProvider,
    DetectorConfig, EventBus, Fingerprint, InMemoryRemote, InMemoryStore, LocalStore, MergeMode,
    Notes, RemoteClient, RemoteDocument, RemoteTarget, SyncCoordinator, SyncOutcome, WriteLock,
};

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

/// Remote whose next `get` blocks until released.
#[derive(Default)]
struct GatedRemote {
    inner: InMemoryRemote,
    armed: AtomicBool,
    arrived: AtomicUsize,
    release: Notify,
}

impl GatedRemote {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    async fn wait_for_pull(&self) {
        while self.arrived.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl RemoteClient for GatedRemote {
    async fn get(&self, target: &RemoteTarget) -> remote::Result<Option<RemoteDocument>> {
        // Read before blocking so the response is stale once released.
        let response = self.inner.get(target).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.arrived.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
        }
        response
    }

    async fn put(&self, target: &RemoteTarget, content: &Value) -> remote::Result<Fingerprint> {
        self.inner.put(target, content).await
    }

    async fn probe_fingerprint(&self, target: &RemoteTarget) -> remote::Result<Option<Fingerprint>> {
        self.inner.probe_fingerprint(target).await
    }
}

struct Device {
    store: Arc<InMemoryStore>,
    notes: Notes,
    coordinator: Arc<SyncCoordinator>,
    detector: Arc<ChangeDetector>,
}

fn device(remote: Arc<dyn RemoteClient>) -> Device {
    let store = Arc::new(InMemoryStore::with_values(vec![
        (GIST_URL_KEY.to_string(), json!("https://gist.github.com/someone/shared")),
        (ENCRYPTED_TOKEN_KEY.to_string(), json!("token")),
    ]));
    let lock = WriteLock::default();
    let events = Arc::new(EventBus::new());
    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        remote,
        Arc::new(Identity),
        Arc::clone(&events),
        Arc::clone(&lock),
        CoordinatorConfig::default(),
    ));
    let detector = Arc::new(ChangeDetector::new(
        Arc::clone(&coordinator),
        events,
        DetectorConfig::default(),
    ));
    Device {
        notes: Notes::new(store.clone(), lock),
        store,
        coordinator,
        detector,
    }
}

fn entry_texts(record: &vault_core::ContextRecord) -> Vec<String> {
    let mut texts: Vec<_> = record.entries.iter().map(|e| e.text.clone()).collect();
    texts.sort();
    texts
}

#[tokio::test]
async fn test_two_devices_converge() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device(remote.clone());
    let b = device(remote.clone());

    a.notes.add_entry("claude.ai", "chat1", "from a").await.unwrap();
    a.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();

    b.notes.add_entry("claude.ai", "chat1", "from b").await.unwrap();
    b.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();

    a.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();

    let on_a = a.notes.context("claude.ai", "chat1").await.unwrap();
    let on_b = b.notes.context("claude.ai", "chat1").await.unwrap();
    assert_eq!(entry_texts(&on_a), vec!["from a", "from b"]);
    assert_eq!(entry_texts(&on_a), entry_texts(&on_b));
}

#[tokio::test]
async fn test_deletion_reaches_other_device_through_detector() {
    let remote = Arc::new(InMemoryRemote::new());
    let a = device(remote.clone());
    let b = device(remote.clone());

    let record = a.notes.add_entry("d", "c", "doomed").await.unwrap();
    a.notes.add_entry("d", "c", "kept").await.unwrap();
    let doomed = record.entries[0].id.clone();
    a.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();
    b.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();
    assert_eq!(b.notes.context("d", "c").await.unwrap().entries.len(), 2);

    let marker = a.notes.delete_entry("d", "c", &doomed).await.unwrap();
    a.coordinator
        .sync(marker.as_deref(), MergeMode::Reconcile)
        .await
        .unwrap();

    assert_eq!(b.detector.check_now().await, CheckOutcome::Refreshed);
    let on_b = b.notes.context("d", "c").await.unwrap();
    assert_eq!(entry_texts(&on_b), vec!["kept"]);
}

#[tokio::test]
async fn test_newer_sync_wins_and_stale_pull_is_discarded() {
    let remote = Arc::new(GatedRemote::default());
    remote.inner.seed(
        "shared",
        json!({ "ctx_d_old": { "entries": [{ "id": "1", "text": "stale" }] } }),
    );
    let dev = device(remote.clone());

    remote.arm();
    let first = {
        let coordinator = Arc::clone(&dev.coordinator);
        tokio::spawn(async move { coordinator.sync(None, MergeMode::Reconcile).await })
    };
    remote.wait_for_pull().await;

    remote.inner.seed(
        "shared",
        json!({ "ctx_d_new": { "entries": [{ "id": "2", "text": "fresh" }] } }),
    );
    let second = dev.coordinator.sync(None, MergeMode::Reconcile).await.unwrap();
    assert!(second.is_completed());

    remote.release.notify_waiters();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first, SyncOutcome::Cancelled(CancelReason::Preempted));

    assert!(dev.store.get("ctx_d_new").await.unwrap().is_some());
    assert!(dev.store.get("ctx_d_old").await.unwrap().is_none());
    assert!(!dev.coordinator.is_running());
}

#[tokio::test]
async fn test_edit_during_pull_is_not_lost() {
    let remote = Arc::new(GatedRemote::default());
    remote.inner.seed(
        "shared",
        json!({ "ctx_d_c": { "chatId": "c", "entries": [{ "id": "r", "text": "remote" }] } }),
    );
    let dev = device(remote.clone());

    remote.arm();
    let sync = {
        let coordinator = Arc::clone(&dev.coordinator);
        tokio::spawn(async move { coordinator.sync(None, MergeMode::Reconcile).await })
    };
    remote.wait_for_pull().await;

    dev.notes.add_entry("d", "c", "typed meanwhile").await.unwrap();
    remote.release.notify_waiters();
    assert!(sync.await.unwrap().unwrap().is_completed());

    let local = dev.notes.context("d", "c").await.unwrap();
    assert_eq!(entry_texts(&local), vec!["remote", "typed meanwhile"]);

    let pushed = remote.inner.content("shared").unwrap();
    assert_eq!(pushed["ctx_d_c"]["entries"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_refresh_never_preempts_user_sync() {
    let remote = Arc::new(GatedRemote::default());
    remote.inner.seed(
        "shared",
        json!({ "ctx_d_c": { "chatId": "c", "entries": [{ "id": "r", "text": "remote" }] } }),
    );
    let dev = device(remote.clone());
    dev.notes.add_entry("d", "c", "local edit").await.unwrap();

    remote.arm();
    let user_sync = {
        let coordinator = Arc::clone(&dev.coordinator);
        tokio::spawn(async move { coordinator.sync(None, MergeMode::Reconcile).await })
    };
    remote.wait_for_pull().await;

    assert!(dev
        .coordinator
        .sync_if_idle(MergeMode::AdoptRemote)
        .await
        .is_none());

    remote.release.notify_waiters();
    assert!(user_sync.await.unwrap().unwrap().is_completed());

    let pushed = remote.inner.content("shared").unwrap();
    let texts: Vec<_> = pushed["ctx_d_c"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, vec!["remote", "local edit"]);
    assert_eq!(dev.detector.check_now().await, CheckOutcome::Unchanged);
}
