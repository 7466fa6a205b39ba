//! vault-core: reconciliation engine for AI Context Vault notes.
//!
//! This crate provides:
//! - Merging local and remote note snapshots without losing either side
//! - A single-flight sync coordinator with cancellation and a time bound
//! - Remote change detection by fingerprint polling
//! - Append-biased activity-log sync with content-addressed attachments
//! - LocalStore, RemoteClient, CredentialProvider and BlobStore trait
//!   abstractions with in-memory implementations

use std::time::Duration;

pub mod blobs;
pub mod coordinator;
pub mod credentials;
pub mod detector;
pub mod events;
pub mod flight;
pub mod log_sync;
pub mod merge;
pub mod model;
pub mod notes;
pub mod remote;
pub mod settings;
pub mod snapshot;
pub mod store;

/// Upper bound on one context sync cycle.
pub const CONTEXT_SYNC_TIMEOUT: Duration = Duration::from_secs(20);
/// Interval between remote fingerprint probes.
pub const CHANGE_POLL_INTERVAL: Duration = Duration::from_secs(20);
/// Interval between activity-log syncs.
pub const LOG_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on one activity-log sync cycle.
pub const LOG_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub use blobs::{BlobError, BlobStore, InMemoryBlobStore};
pub use coordinator::{CoordinatorConfig, Probe, SyncCoordinator};
pub use credentials::{CachedCredentials, CredentialError, CredentialProvider};
pub use detector::{ChangeDetector, CheckOutcome, DetectorConfig, ViewSignal};
pub use events::{EventBus, Subscription, SyncEvent};
pub use flight::{CancelReason, SyncError, SyncOutcome};
pub use log_sync::{LogSync, LogSyncConfig, LogSyncReport};
pub use merge::{merge, MergeMode};
pub use model::{Attachment, Bookmark, ContextRecord, Entry, LogEntry, LogMetadata};
pub use notes::{Notes, WriteLock};
pub use remote::{Fingerprint, InMemoryRemote, RemoteClient, RemoteDocument, RemoteError, RemoteTarget};
pub use settings::{SyncSettings, Unavailable};
pub use snapshot::{Snapshot, SnapshotValue};
pub use store::{InMemoryStore, LocalStore, StoreError};
