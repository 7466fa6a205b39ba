//! Single-flight execution with cooperative cancellation and a time bound.
//!
//! State machine per runner:
//!
//! ```text
//! Idle --run--> Running --(completed | preempted | timed out)--> Idle
//! ```
//!
//! Starting a run cancels the token of the run before it, so the newest caller
//! always wins. The preempted run is dropped at its next suspension point and
//! any response it was waiting on is discarded with it.

use crate::blobs::BlobError;
use crate::remote::RemoteError;
use crate::settings::Unavailable;
use crate::store::StoreError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that end a sync cycle after the pull phase.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Why a run stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer run started.
    Preempted,
    /// The time bound elapsed.
    TimedOut,
}

/// Result of a sync cycle that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    /// Committed locally (and pushed when needed).
    Completed(T),
    /// Stopped before committing. Not an error.
    Cancelled(CancelReason),
    /// Remote target or credential unavailable; nothing was attempted.
    Skipped(Unavailable),
}

impl<T> SyncOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            SyncOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }
}

/// Decrements the in-flight counter when a run ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs at most one operation of a kind at a time; newer runs preempt older ones.
pub struct SingleFlight {
    name: &'static str,
    timeout: Duration,
    /// Token of the newest run, tagged with its generation.
    current: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
    in_flight: AtomicUsize,
}

impl SingleFlight {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Whether any run is still executing (including one being preempted).
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Run `op` under this runner's discipline.
    ///
    /// `op` receives the run's token so it can re-check liveness before
    /// committing side effects. Returns `Err(reason)` when the run was
    /// cancelled.
    pub async fn run<F, Fut, T>(&self, op: F) -> std::result::Result<T, CancelReason>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((generation, token.clone()));
        if let Some((_, previous)) = previous {
            debug!("{} sync preempting previous run", self.name);
            previous.cancel();
        }

        self.execute(generation, token, op).await
    }

    /// Like [`run`](Self::run), but never preempts: returns `None` without
    /// starting `op` when another run is current. The check and the start are
    /// one step, so a run begun concurrently is never cancelled by this one.
    pub async fn try_run<F, Fut, T>(&self, op: F) -> Option<std::result::Result<T, CancelReason>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let (generation, token) = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                debug!("{} sync already running, not starting another", self.name);
                return None;
            }
            let token = CancellationToken::new();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *current = Some((generation, token.clone()));
            (generation, token)
        };

        Some(self.execute(generation, token, op).await)
    }

    async fn execute<F, Fut, T>(
        &self,
        generation: u64,
        token: CancellationToken,
        op: F,
    ) -> std::result::Result<T, CancelReason>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let _in_flight = InFlight::enter(&self.in_flight);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("{} sync cancelled by a newer run", self.name);
                Err(CancelReason::Preempted)
            }
            _ = tokio::time::sleep(self.timeout) => {
                token.cancel();
                debug!("{} sync timed out after {:?}", self.name, self.timeout);
                Err(CancelReason::TimedOut)
            }
            value = op(token.clone()) => Ok(value),
        };

        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(current.as_ref(), Some((g, _)) if *g == generation) {
            *current = None;
        }
        outcome
    }
}
