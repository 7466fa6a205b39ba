//! Event infrastructure for vault-core.
//!
//! Provides `SyncEvent` for the UI layer and monitoring, and `EventBus` for
//! subscriptions. Thread-safe for the multi-threaded Tokio runtime.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync services.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A reconciliation cycle began.
    SyncStarted {
        /// `"context"` or `"logs"`.
        kind: String,
    },
    /// A reconciliation cycle committed its result.
    SyncCompleted {
        kind: String,
        /// Number of keys (or log entries) in the committed snapshot.
        count: usize,
    },
    /// A cycle was preempted by a newer one or hit its time bound.
    SyncCancelled { kind: String },
    /// A cycle failed after the pull phase.
    SyncFailed { kind: String, error: String },
    /// Remote data was adopted locally; views should re-render from the store.
    DataRefreshed {
        domain: String,
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "forceRefresh")]
        force_refresh: bool,
    },
    /// Activity logs were reconciled.
    LogsSynced {
        total: usize,
        /// Entries that arrived from the remote.
        added: usize,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit never holds the lock while callbacks run, so this cannot deadlock.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn refreshed() -> SyncEvent {
        SyncEvent::DataRefreshed {
            domain: "claude.ai".into(),
            chat_id: "abc".into(),
            force_refresh: true,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        bus.emit(refreshed());

        assert_eq!(*seen.lock().unwrap(), vec![refreshed()]);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(refreshed());
        }

        bus.emit(refreshed());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_partial_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let sub1 = bus.subscribe(move |_| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(refreshed());
        drop(sub1);
        bus.emit(refreshed());

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_drop_inside_callback_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let slot_clone = Arc::clone(&slot);
        let count_clone = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
            // Drop our own subscription while emit is dispatching.
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(refreshed());
        assert_eq!(bus.subscriber_count(), 0);

        bus.emit(refreshed());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_drop_during_emit() {
        let bus = Arc::new(EventBus::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _sub = bus.subscribe(|_| {});
                        bus.emit(SyncEvent::SyncCancelled { kind: "context".into() });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_data_refreshed_serialization() {
        let json = serde_json::to_string(&refreshed()).unwrap();
        assert!(json.contains("\"type\":\"dataRefreshed\""));
        assert!(json.contains("\"chatId\":\"abc\""));
        assert!(json.contains("\"forceRefresh\":true"));
    }
}
