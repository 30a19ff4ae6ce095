//! # Connectivity Monitor
//!
//! Periodic reachability probe against the sync server.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │     ┌──────────┐   probe ok                  ┌──────────┐              │
//! │     │ OFFLINE  │ ──────────────────────────► │  ONLINE  │              │
//! │     │ (start)  │   • emit ConnectionStatus   │          │              │
//! │     │          │   • wake the sync worker    │          │              │
//! │     │          │ ◄────────────────────────── │          │              │
//! │     └──────────┘   probe error / timeout /   └──────────┘              │
//! │                    non-2xx                                             │
//! │                    • emit ConnectionStatus                             │
//! │                                                                         │
//! │  In-flight requests are never cancelled by a transition.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reading the state is a single atomic load and never waits on a probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::PosApi;
use crate::config::ConnectivitySettings;
use crate::events::{EventHub, SyncEvent};

/// Watches the server and publishes the online/offline signal.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    api: Arc<dyn PosApi>,
    settings: ConnectivitySettings,
    online: Arc<AtomicBool>,
    reconnected: Arc<Notify>,
    events: Arc<EventHub<SyncEvent>>,
}

impl ConnectivityMonitor {
    pub fn new(
        api: Arc<dyn PosApi>,
        settings: ConnectivitySettings,
        events: Arc<EventHub<SyncEvent>>,
    ) -> Self {
        ConnectivityMonitor {
            api,
            settings,
            online: Arc::new(AtomicBool::new(false)),
            reconnected: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Notified on every offline → online transition.
    ///
    /// Uses `notify_one`, so a transition that happens while nobody waits
    /// is still observed by the next `notified().await`.
    pub fn reconnected(&self) -> Arc<Notify> {
        self.reconnected.clone()
    }

    /// Runs one probe immediately and returns the resulting state.
    pub async fn probe_now(&self) -> bool {
        let reachable = match self.api.health(self.settings.probe_timeout()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                false
            }
        };
        self.set_online(reachable);
        reachable
    }

    fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if was_online == online {
            return;
        }

        if online {
            info!("Server reachable, going online");
            self.reconnected.notify_one();
        } else {
            warn!("Server unreachable, going offline");
        }

        self.events.emit(SyncEvent::ConnectionStatusChanged {
            is_online: online,
            changed_at: Utc::now(),
        });
    }

    /// Probe loop. Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.probe_interval_secs,
            backoff = self.settings.backoff_enabled,
            "Connectivity monitor starting"
        );

        let mut schedule = ProbeSchedule::new(&self.settings);

        loop {
            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = self.probe_now() => online,
            };

            let delay = schedule.next_delay(online);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Connectivity monitor stopped");
    }
}

// =============================================================================
// Probe Schedule
// =============================================================================

/// Delay before the next probe: constant, or exponential with jitter while
/// offline when backoff is enabled.
struct ProbeSchedule {
    interval: Duration,
    max: Duration,
    backoff: Option<ExponentialBackoff>,
}

impl ProbeSchedule {
    fn new(settings: &ConnectivitySettings) -> Self {
        let interval = settings.probe_interval();
        let max = Duration::from_secs(settings.max_backoff_secs).max(interval);

        let backoff = settings.backoff_enabled.then(|| ExponentialBackoff {
            initial_interval: interval,
            max_interval: max,
            multiplier: 1.5,
            randomization_factor: 0.2,
            max_elapsed_time: None,
            ..Default::default()
        });

        ProbeSchedule {
            interval,
            max,
            backoff,
        }
    }

    fn next_delay(&mut self, online: bool) -> Duration {
        match self.backoff.as_mut() {
            None => self.interval,
            Some(backoff) if online => {
                backoff.reset();
                self.interval
            }
            Some(backoff) => backoff.next_backoff().unwrap_or(self.max).min(self.max),
        }
    }
}
