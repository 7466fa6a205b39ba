//! ChangeDetector: polls the remote fingerprint and adopts remote changes.
//!
//! A poll compares the remote fingerprint with the last one this device
//! observed. On a difference it runs a remote-authoritative sync and emits
//! [`SyncEvent::DataRefreshed`] for the current view.
//!
//! A sync already in progress makes the poll a no-op ([`CheckOutcome::Busy`]).
//! The change is not queued; the next poll sees the same difference again.

use crate::coordinator::{Probe, SyncCoordinator};
use crate::events::{EventBus, SyncEvent};
use crate::flight::SyncOutcome;
use crate::merge::MergeMode;
use crate::settings::Unavailable;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub poll_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: crate::CHANGE_POLL_INTERVAL,
        }
    }
}

/// Host view lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSignal {
    /// The view became visible again.
    VisibilityRegained,
    Focus,
    Blur,
}

/// Result of one fingerprint check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Remote fingerprint matches the last observed one (or no remote exists).
    Unchanged,
    /// A sync was running; nothing done.
    Busy,
    /// Remote changes were adopted locally.
    Refreshed,
    /// Probe or refresh failed, or the credential could not be decrypted.
    Unavailable,
    /// No remote target or credential stored.
    NotConfigured,
}

#[derive(Debug, Clone, Default)]
struct View {
    domain: String,
    chat_id: String,
}

pub struct ChangeDetector {
    coordinator: Arc<SyncCoordinator>,
    events: Arc<EventBus>,
    config: DetectorConfig,
    view: RwLock<View>,
    /// Token of the running poll loop, if any.
    poller: Mutex<Option<CancellationToken>>,
}

impl ChangeDetector {
    pub fn new(coordinator: Arc<SyncCoordinator>, events: Arc<EventBus>, config: DetectorConfig) -> Self {
        Self {
            coordinator,
            events,
            config,
            view: RwLock::new(View::default()),
            poller: Mutex::new(None),
        }
    }

    /// Record the conversation currently shown, attached to refresh events.
    pub fn set_view(&self, domain: impl Into<String>, chat_id: impl Into<String>) {
        *self.view.write().unwrap_or_else(|e| e.into_inner()) = View {
            domain: domain.into(),
            chat_id: chat_id.into(),
        };
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Begin polling. No-op when sync is not configured.
    ///
    /// Returns whether a poll loop is running afterwards.
    pub async fn start(self: &Arc<Self>) -> bool {
        match self.coordinator.is_configured().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Sync not configured, change detector stays idle");
                return false;
            }
            Err(e) => {
                warn!("Failed to read sync settings: {}", e);
                return false;
            }
        }

        let token = {
            let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
            if poller.is_some() {
                return true;
            }
            let token = CancellationToken::new();
            *poller = Some(token.clone());
            token
        };

        info!(interval = ?self.config.poll_interval, "Change detector started");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.poll_loop(token).await });
        true
    }

    /// Halt polling. An in-progress check runs to completion.
    pub fn stop(&self) {
        if let Some(token) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
            info!("Change detector stopped");
        }
    }

    /// React to a view lifecycle signal.
    ///
    /// Focus and regained visibility check immediately and resume polling;
    /// blur stops polling.
    pub async fn handle_signal(self: &Arc<Self>, signal: ViewSignal) -> Option<CheckOutcome> {
        match signal {
            ViewSignal::Blur => {
                self.stop();
                None
            }
            ViewSignal::Focus | ViewSignal::VisibilityRegained => {
                let outcome = self.check_now().await;
                if outcome != CheckOutcome::NotConfigured {
                    self.start().await;
                }
                Some(outcome)
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; polls start one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Change detector loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.check_now().await;
                    debug!(?outcome, "Change poll");
                }
            }
        }
    }

    /// Probe once and adopt remote changes if the fingerprint moved.
    pub async fn check_now(&self) -> CheckOutcome {
        if self.coordinator.is_running() {
            return CheckOutcome::Busy;
        }

        let current = match self.coordinator.probe().await {
            Probe::Current(Some(fp)) => fp,
            Probe::Current(None) => return CheckOutcome::Unchanged,
            Probe::Unavailable(Unavailable::NoTarget | Unavailable::NoCredential) => {
                return CheckOutcome::NotConfigured;
            }
            Probe::Unavailable(reason) => {
                debug!(?reason, "Skipping change check");
                return CheckOutcome::Unavailable;
            }
            Probe::Failed(e) => {
                warn!("Fingerprint probe failed: {}", e);
                return CheckOutcome::Unavailable;
            }
        };

        if self.coordinator.last_fingerprint().await.as_ref() == Some(&current) {
            return CheckOutcome::Unchanged;
        }

        info!(fingerprint = %current, "Remote changed, refreshing");
        // A sync started since the probe keeps running; this refresh yields.
        let Some(result) = self.coordinator.sync_if_idle(MergeMode::AdoptRemote).await else {
            debug!("Remote changed during a sync, leaving it to the next poll");
            return CheckOutcome::Busy;
        };
        match result {
            Ok(SyncOutcome::Completed(_)) => {
                let view = self.view.read().unwrap_or_else(|e| e.into_inner()).clone();
                self.events.emit(SyncEvent::DataRefreshed {
                    domain: view.domain,
                    chat_id: view.chat_id,
                    force_refresh: true,
                });
                CheckOutcome::Refreshed
            }
            Ok(SyncOutcome::Cancelled(_)) => CheckOutcome::Busy,
            Ok(SyncOutcome::Skipped(_)) => CheckOutcome::Unavailable,
            Err(e) => {
                warn!("Refresh failed: {}", e);
                CheckOutcome::Unavailable
            }
        }
    }
}
