//! SyncCoordinator: pull remote -> merge -> commit locally -> push.
//!
//! One cycle:
//!
//! 1. Resolve the remote target (skip quietly if unconfigured)
//! 2. Gather the local snapshot
//! 3. Pull the remote snapshot; any failure reads as an empty remote
//! 4. Merge
//! 5. Commit the merge to the local store under the write lock, unless this
//!    run was cancelled meanwhile
//! 6. Push the merge (skipped when the remote already holds it)
//! 7. Remember the remote fingerprint
//!
//! Cycles run under a [`SingleFlight`], so a new `sync` call cancels the one
//! in progress.

use crate::credentials::CredentialProvider;
use crate::events::{EventBus, SyncEvent};
use crate::flight::{CancelReason, Result, SingleFlight, SyncOutcome};
use crate::merge::{merge, MergeMode};
use crate::notes::WriteLock;
use crate::remote::{Fingerprint, RemoteClient, RemoteTarget};
use crate::settings::{SyncSettings, Unavailable, CONTEXT_FINGERPRINT_KEY};
use crate::snapshot::Snapshot;
use crate::store::{self, LocalStore};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const KIND: &str = "context";

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on one cycle; exceeded cycles are cancelled.
    pub timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout: crate::CONTEXT_SYNC_TIMEOUT,
        }
    }
}

/// Result of a fingerprint probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// The remote's current fingerprint (`None` if no document exists yet).
    Current(Option<Fingerprint>),
    /// Target or credential missing.
    Unavailable(Unavailable),
    /// The probe request failed.
    Failed(String),
}

/// Drives context reconciliation between the local store and the remote.
pub struct SyncCoordinator {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<EventBus>,
    write_lock: WriteLock,
    flight: SingleFlight,
    /// Fingerprint of the remote document as last observed by this device.
    last_fingerprint: RwLock<Option<Fingerprint>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<EventBus>,
        write_lock: WriteLock,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            remote,
            credentials,
            events,
            write_lock,
            flight: SingleFlight::new(KIND, config.timeout),
            last_fingerprint: RwLock::new(None),
        }
    }

    /// Whether a cycle is executing right now.
    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Whether a remote target and credential are stored (not decrypted).
    pub async fn is_configured(&self) -> store::Result<bool> {
        SyncSettings::new(&*self.store).is_configured().await
    }

    /// The last fingerprint this device observed, restored from the store
    /// after a restart.
    pub async fn last_fingerprint(&self) -> Option<Fingerprint> {
        if let Some(fp) = self.cached_fingerprint() {
            return Some(fp);
        }
        match SyncSettings::new(&*self.store)
            .fingerprint(CONTEXT_FINGERPRINT_KEY)
            .await
        {
            Ok(Some(fp)) => {
                *self.last_fingerprint.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(fp.clone());
                Some(fp)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read stored fingerprint: {}", e);
                None
            }
        }
    }

    fn cached_fingerprint(&self) -> Option<Fingerprint> {
        self.last_fingerprint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn remember_fingerprint(&self, fingerprint: Fingerprint) -> store::Result<()> {
        SyncSettings::new(&*self.store)
            .set_fingerprint(CONTEXT_FINGERPRINT_KEY, &fingerprint)
            .await?;
        *self.last_fingerprint.write().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint);
        Ok(())
    }

    async fn resolve_target(&self) -> store::Result<std::result::Result<RemoteTarget, Unavailable>> {
        SyncSettings::new(&*self.store)
            .resolve_target(&*self.credentials)
            .await
    }

    /// Probe the remote fingerprint without fetching the document.
    pub async fn probe(&self) -> Probe {
        let target = match self.resolve_target().await {
            Ok(Ok(target)) => target,
            Ok(Err(reason)) => return Probe::Unavailable(reason),
            Err(e) => return Probe::Failed(e.to_string()),
        };
        match self.remote.probe_fingerprint(&target).await {
            Ok(fp) => Probe::Current(fp),
            Err(e) => Probe::Failed(e.to_string()),
        }
    }

    /// Run one reconciliation cycle.
    ///
    /// `delete_key` names an entry/bookmark id that must not survive this
    /// merge. Returns the committed snapshot, or why nothing was committed.
    /// Errors are limited to the commit and push phases.
    pub async fn sync(&self, delete_key: Option<&str>, mode: MergeMode) -> Result<SyncOutcome<Snapshot>> {
        let outcome = self
            .flight
            .run(|token| self.run_cycle(token, delete_key, mode))
            .await;
        self.finish(outcome)
    }

    /// Run a cycle only if none is in progress; `None` means one was and this
    /// call did nothing. Never preempts.
    pub async fn sync_if_idle(&self, mode: MergeMode) -> Option<Result<SyncOutcome<Snapshot>>> {
        let outcome = self
            .flight
            .try_run(|token| self.run_cycle(token, None, mode))
            .await?;
        Some(self.finish(outcome))
    }

    fn finish(
        &self,
        outcome: std::result::Result<Result<SyncOutcome<Snapshot>>, CancelReason>,
    ) -> Result<SyncOutcome<Snapshot>> {
        match outcome {
            Ok(Ok(outcome)) => {
                if let SyncOutcome::Cancelled(_) = outcome {
                    self.events.emit(SyncEvent::SyncCancelled { kind: KIND.into() });
                }
                Ok(outcome)
            }
            Ok(Err(e)) => {
                error!("Context sync failed: {}", e);
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

    async fn local_snapshot(&self) -> store::Result<Snapshot> {
        Ok(Snapshot::from_entries(self.store.get_all().await?))
    }

    /// Pull the remote snapshot. Failures are absorbed as an empty remote with
    /// an unknown fingerprint.
    async fn pull(&self, target: &RemoteTarget) -> (Snapshot, Option<Fingerprint>) {
        match self.remote.get(target).await {
            Ok(Some(doc)) => (Snapshot::from_json(doc.content), Some(doc.fingerprint)),
            Ok(None) => {
                debug!("No remote document yet");
                (Snapshot::new(), None)
            }
            Err(e) => {
                warn!("Pull failed, treating remote as empty: {}", e);
                (Snapshot::new(), None)
            }
        }
    }

    async fn run_cycle(
        &self,
        token: CancellationToken,
        delete_key: Option<&str>,
        mode: MergeMode,
    ) -> Result<SyncOutcome<Snapshot>> {
        let target = match self.resolve_target().await? {
            Ok(target) => target,
            Err(reason) => {
                debug!(?reason, "Skipping context sync");
                return Ok(SyncOutcome::Skipped(reason));
            }
        };

        self.events.emit(SyncEvent::SyncStarted { kind: KIND.into() });

        let local = self.local_snapshot().await?;
        let (remote, fetched) = self.pull(&target).await;
        let mut merged = merge(&local, &remote, delete_key, mode);

        {
            let _guard = self.write_lock.lock().await;
            if token.is_cancelled() {
                return Ok(SyncOutcome::Cancelled(CancelReason::Preempted));
            }

            let fresh = self.local_snapshot().await?;
            if fresh != local {
                debug!("Local data changed during pull, re-merging");
                merged = merge(&fresh, &remote, delete_key, mode);
            }

            let writes = merged
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect();
            self.store.set_many(writes).await?;
        }

        // Remote-authoritative cycles never push: the remote already holds
        // the data, and a failed pull must not be written back as empty.
        let unchanged = fetched.is_some() && merged == remote;
        if mode == MergeMode::AdoptRemote || unchanged {
            if let Some(fp) = fetched {
                self.remember_fingerprint(fp).await?;
            }
        } else {
            let fp = self.remote.put(&target, &merged.to_json()).await?;
            self.remember_fingerprint(fp).await?;
        }

        info!(keys = merged.len(), ?mode, "Context sync completed");
        self.events.emit(SyncEvent::SyncCompleted {
            kind: KIND.into(),
            count: merged.len(),
        });
        Ok(SyncOutcome::Completed(merged))
    }
}
