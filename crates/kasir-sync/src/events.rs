//! # Events
//!
//! Status events for UI collaborators, and the hub that delivers them.
//!
//! ## Delivery
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ConnectivityMonitor ─┐                                                 │
//! │  SyncEngine ──────────┼──► EventHub<SyncEvent> ──► listener callbacks   │
//! │  SessionStore ────────┘                       └──► broadcast receivers │
//! │                                                                         │
//! │  RetryQueue ─────────────► EventHub<PrintEvent> ──► (same two paths)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Listeners are held only until `unsubscribe`. Callbacks run on the
//! emitting task and must not block.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use ts_rs::TS;

/// Capacity of the broadcast channel behind `subscribe_channel`.
const CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Sync Events
// =============================================================================

/// Phase reported by `SyncStatusChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Completed,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Syncing => write!(f, "syncing"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Events raised by the connectivity monitor, the sync engine and the
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionStatusChanged {
        is_online: bool,
        #[ts(as = "String")]
        changed_at: DateTime<Utc>,
    },

    /// `progress` is a percentage, present while a cycle is running.
    #[serde(rename_all = "camelCase")]
    SyncStatusChanged {
        status: SyncPhase,
        message: String,
        progress: Option<u8>,
    },

    #[serde(rename_all = "camelCase")]
    AuthStatusChanged {
        is_authenticated: bool,
        cashier_id: Option<String>,
    },
}

impl SyncEvent {
    pub fn sync_status(status: SyncPhase, message: impl Into<String>, progress: Option<u8>) -> Self {
        SyncEvent::SyncStatusChanged {
            status,
            message: message.into(),
            progress,
        }
    }
}

// =============================================================================
// Print Events
// =============================================================================

/// Outcome notifications of the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PrintEvent {
    #[serde(rename_all = "camelCase")]
    JobCompleted { job_id: String },

    /// The job exhausted its retries and moved to the failed set.
    #[serde(rename_all = "camelCase")]
    JobFailed {
        job_id: String,
        error: String,
        retry_count: u32,
    },

    #[serde(rename_all = "camelCase")]
    JobRetrying {
        job_id: String,
        error: String,
        retry_count: u32,
    },
}

// =============================================================================
// Event Hub
// =============================================================================

/// Token returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Explicit publish/subscribe for one event type.
pub struct EventHub<E> {
    listeners: Mutex<BTreeMap<SubscriptionId, Listener<E>>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventHub {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    /// Registers a callback. It stays registered until [`Self::unsubscribe`].
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Arc::new(listener));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// A receiver of every event emitted from now on.
    ///
    /// A receiver that falls more than the channel capacity behind observes
    /// `RecvError::Lagged` and skips ahead.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<E> {
        self.channel.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: E) {
        // Snapshot so a listener may unsubscribe itself while being called
        let listeners: Vec<Listener<E>> = self.lock().values().cloned().collect();
        trace!(listeners = listeners.len(), "Emitting event");

        for listener in listeners {
            listener(&event);
        }

        // No receivers is not an error
        let _ = self.channel.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionId, Listener<E>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
