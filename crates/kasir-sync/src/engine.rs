//! # Sync Engine
//!
//! Push drains locally captured sales to the server; pull merges the
//! server catalog into the product cache.
//!
//! ## Push Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  guard: online && authenticated          (else PushReport::skipped)    │
//! │                                                                         │
//! │  list_pending()  Pending | Failed, ORDER BY created_at, rowid          │
//! │       │                                                                 │
//! │       ▼  for each (cancellation checked between rows)                  │
//! │  mark_syncing ──false──► skip (someone else owns it now)               │
//! │       │                                                                 │
//! │  sync_log.append(Transaction, Create, Syncing)                         │
//! │       │                                                                 │
//! │  POST /transactions  (Idempotency-Key = id)                            │
//! │       ├── ok / 409 ──► mark_synced(server invoice) ──► log complete    │
//! │       └── error ─────► mark_failed(reason, attempts+1) ──► continue    │
//! │                                                                         │
//! │  emit Syncing{progress%} per row, then Completed | Failed              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every row's outcome is committed as soon as it is known, so a cycle
//! that dies halfway leaves the finished rows `Synced` and the next cycle
//! only sends what is left. A storage error after the claim hands the row
//! back as `Failed` before the cycle aborts.
//!
//! ## Pull Merge
//! ```text
//! no local row                                  → insert
//! {price, stock, active} equal                  → no write
//! differs, local_edit_at > server updated_at    → keep local
//! differs, anything else (ties included)        → server values win
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use kasir_core::{LocalProduct, LocalTransaction, ProductSnapshot, SyncEntity, SyncOperation, SyncStatus};
use kasir_db::Database;

use crate::api::{CreateOutcome, CreateTransactionRequest, PosApi, ProductDto};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventHub, SyncEvent, SyncPhase};
use crate::session::SessionProvider;

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one push cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    /// The guard stopped the cycle before it looked at anything.
    pub skipped: bool,
    pub cancelled: bool,
}

impl PushReport {
    pub fn skipped() -> Self {
        PushReport {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Outcome of one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Newer offline edits that survived the pull.
    pub kept_local: usize,
    /// Server products that failed validation.
    pub rejected: usize,
    pub skipped: bool,
}

impl PullReport {
    pub fn skipped() -> Self {
        PullReport {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Synced,
    Failed,
    /// Another cycle claimed the row first.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullAction {
    Inserted,
    Updated,
    Unchanged,
    KeptLocal,
}

/// Last-write-wins: a local edit survives only when it is strictly newer
/// than the server's modification time, and only when the server sent one.
pub fn local_edit_wins(local: &LocalProduct, server_updated_at: Option<DateTime<Utc>>) -> bool {
    match (local.local_edit_at, server_updated_at) {
        (Some(edited), Some(server)) => edited > server,
        _ => false,
    }
}

/// Timestamps of the last finished cycles.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    db: Arc<Database>,
    api: Arc<dyn PosApi>,
    monitor: ConnectivityMonitor,
    session: Arc<dyn SessionProvider>,
    events: Arc<EventHub<SyncEvent>>,
    pull_page_size: u32,

    /// Held for the whole of a push cycle.
    push_lock: Mutex<()>,
    pull_lock: Mutex<()>,

    /// Parent of every cycle token.
    cancel_root: CancellationToken,
    current_cycle: StdMutex<Option<CancellationToken>>,
    /// Wakes the worker for an out-of-schedule push.
    push_requested: Notify,

    state: RwLock<EngineState>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        api: Arc<dyn PosApi>,
        monitor: ConnectivityMonitor,
        session: Arc<dyn SessionProvider>,
        events: Arc<EventHub<SyncEvent>>,
        pull_page_size: u32,
        cancel_root: CancellationToken,
    ) -> Self {
        SyncEngine {
            db,
            api,
            monitor,
            session,
            events,
            pull_page_size,
            push_lock: Mutex::new(()),
            pull_lock: Mutex::new(()),
            cancel_root,
            current_cycle: StdMutex::new(None),
            push_requested: Notify::new(),
            state: RwLock::new(EngineState::default()),
        }
    }

    pub async fn state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    /// Pending, syncing and failed transactions.
    pub async fn pending_count(&self) -> SyncResult<i64> {
        Ok(self.db.transactions().count_pending().await?)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Asks the worker to push as soon as it is free. The push runs on the
    /// worker task, so shutdown waits for it.
    pub fn request_push(&self) {
        self.push_requested.notify_one();
    }

    /// Cancels any running push cycle, then runs a fresh one.
    pub async fn start_sync(&self) -> SyncResult<PushReport> {
        if let Some(running) = self.cycle_slot().take() {
            debug!("Cancelling running sync cycle");
            running.cancel();
        }
        self.push().await
    }

    /// Runs one push cycle, waiting for a running cycle to finish first.
    pub async fn push(&self) -> SyncResult<PushReport> {
        let _cycle = self.push_lock.lock().await;

        if self.cancel_root.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        let cancel = self.cancel_root.child_token();
        *self.cycle_slot() = Some(cancel.clone());

        let result = self.push_cycle(&cancel).await;
        self.cycle_slot().take();

        if let Err(e) = &result {
            error!(error = %e, "Push cycle aborted");
            self.state.write().await.last_error = Some(e.to_string());
            self.emit(SyncPhase::Failed, format!("Sync failed: {e}"), None);
        }
        result
    }

    async fn push_cycle(&self, cancel: &CancellationToken) -> SyncResult<PushReport> {
        if !self.monitor.is_online() || !self.session.is_authenticated() {
            debug!(
                online = self.monitor.is_online(),
                authenticated = self.session.is_authenticated(),
                "Push skipped"
            );
            return Ok(PushReport::skipped());
        }

        let pending = self.db.transactions().list_pending().await?;
        let mut report = PushReport {
            total: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!("Nothing to push");
            return Ok(report);
        }

        info!(count = report.total, "Pushing transactions");
        self.emit(
            SyncPhase::Syncing,
            format!("Syncing {} transactions...", report.total),
            Some(0),
        );

        for (index, txn) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(synced = report.synced, "Push cycle cancelled");
                report.cancelled = true;
                self.emit(SyncPhase::Failed, "Sync cancelled", None);
                return Ok(report);
            }

            match self.push_one(txn).await? {
                RowOutcome::Synced => report.synced += 1,
                RowOutcome::Failed => report.failed += 1,
                RowOutcome::Skipped => {}
            }

            let progress = ((index + 1) * 100 / report.total) as u8;
            self.emit(
                SyncPhase::Syncing,
                format!("Synced {}/{}", report.synced, report.total),
                Some(progress),
            );
        }

        let message = format!(
            "Sync completed: {}/{} transactions synced",
            report.synced, report.total
        );
        {
            let mut state = self.state.write().await;
            state.last_push_at = Some(Utc::now());
            state.last_error = (report.failed > 0)
                .then(|| format!("{} transactions failed to sync", report.failed));
        }

        if report.failed == 0 {
            info!(synced = report.synced, "Push cycle completed");
            self.emit(SyncPhase::Completed, message, Some(100));
        } else {
            warn!(synced = report.synced, failed = report.failed, "Push cycle finished with failures");
            self.emit(SyncPhase::Failed, message, Some(100));
        }

        Ok(report)
    }

    /// Pushes one transaction. A server error leaves the row `Failed`;
    /// storage errors abort the cycle, after handing the claimed row back
    /// as `Failed` so the next cycle picks it up again.
    async fn push_one(&self, txn: &LocalTransaction) -> SyncResult<RowOutcome> {
        if !self.db.transactions().mark_syncing(&txn.id).await? {
            debug!(id = %txn.id, "Transaction no longer pending, skipping");
            return Ok(RowOutcome::Skipped);
        }

        match self.push_claimed(txn).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release(txn, &e).await;
                Err(e)
            }
        }
    }

    async fn push_claimed(&self, txn: &LocalTransaction) -> SyncResult<RowOutcome> {
        let sync_log = self.db.sync_log();
        let log_id = sync_log
            .append(SyncEntity::Transaction, &txn.id, SyncOperation::Create, SyncStatus::Syncing)
            .await?;

        let request = CreateTransactionRequest::from(txn);
        match self.api.create_transaction(&request).await {
            Ok(outcome) => {
                self.confirm(txn, &outcome).await?;
                sync_log.complete(log_id, None).await?;
                debug!(id = %txn.id, invoice_number = %txn.invoice_number, "Transaction synced");
                Ok(RowOutcome::Synced)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(id = %txn.id, error = %reason, transient = e.is_transient(), "Failed to push transaction");
                self.fail(txn, &reason).await?;
                sync_log.complete(log_id, Some(&reason)).await?;
                Ok(RowOutcome::Failed)
            }
        }
    }

    /// Moves a row this cycle claimed back out of `Syncing`. A row already
    /// `Synced` or `Failed` is left alone by the guarded update.
    async fn release(&self, txn: &LocalTransaction, cause: &SyncError) {
        match self.db.transactions().mark_failed(&txn.id, &cause.to_string()).await {
            Ok(()) => warn!(id = %txn.id, error = %cause, "Released transaction after storage error"),
            Err(e) if e.is_not_found() => {}
            Err(e) => error!(id = %txn.id, error = %e, "Failed to release transaction, it stays syncing until restart"),
        }
    }

    async fn confirm(&self, txn: &LocalTransaction, outcome: &CreateOutcome) -> SyncResult<()> {
        let transactions = self.db.transactions();
        match transactions
            .mark_synced(&txn.id, outcome.server_invoice_number(), Utc::now())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => self.expect_synced(txn, e.into()).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(&self, txn: &LocalTransaction, reason: &str) -> SyncResult<()> {
        match self.db.transactions().mark_failed(&txn.id, reason).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => self.expect_synced(txn, e.into()).await,
            Err(e) => Err(e.into()),
        }
    }

    /// A guarded update missed its row. That is fine only if an idempotent
    /// confirm already marked it `Synced`.
    async fn expect_synced(&self, txn: &LocalTransaction, err: SyncError) -> SyncResult<()> {
        let current = self.db.transactions().get(&txn.id).await?;
        match current {
            Some(row) if row.sync_status == SyncStatus::Synced => {
                debug!(id = %txn.id, "Transaction already confirmed");
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Number of `Failed` transactions, which the next push will retry.
    pub async fn failed_count(&self) -> SyncResult<i64> {
        Ok(self.db.transactions().count_failed().await?)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Fetches the catalog and merges it into the product cache.
    pub async fn pull(&self) -> SyncResult<PullReport> {
        let _pull = self.pull_lock.lock().await;

        if !self.monitor.is_online() || !self.session.is_authenticated() {
            debug!("Pull skipped");
            return Ok(PullReport::skipped());
        }

        self.emit(SyncPhase::Syncing, "Pulling product updates...", None);

        let now = Utc::now();
        let mut report = PullReport::default();
        let mut page_no = 1u32;

        loop {
            let page = match self.api.list_products(page_no, self.pull_page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(page = page_no, error = %e, "Failed to fetch products");
                    return Err(self.pull_failed(e.into()).await);
                }
            };

            let last_page = page.items.is_empty()
                || i64::from(page_no) * i64::from(self.pull_page_size) >= page.total_count;

            for dto in &page.items {
                report.fetched += 1;

                let snapshot = dto.to_snapshot();
                if let Err(e) = snapshot.validate() {
                    warn!(id = %dto.id, error = %e, "Rejecting invalid product from server");
                    report.rejected += 1;
                    continue;
                }

                match self.merge_product(dto, snapshot, now).await {
                    Ok(PullAction::Inserted) => report.inserted += 1,
                    Ok(PullAction::Updated) => report.updated += 1,
                    Ok(PullAction::Unchanged) => report.unchanged += 1,
                    Ok(PullAction::KeptLocal) => report.kept_local += 1,
                    Err(e) => {
                        error!(id = %dto.id, error = %e, "Failed to store product, stopping pull");
                        return Err(self.pull_failed(e).await);
                    }
                }
            }

            if last_page {
                break;
            }
            debug!(page = page_no, total = page.total_count, "Fetching next product page");
            page_no += 1;
        }

        {
            let mut state = self.state.write().await;
            state.last_pull_at = Some(Utc::now());
            state.last_error = None;
        }

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            kept_local = report.kept_local,
            rejected = report.rejected,
            "Pull completed"
        );
        self.emit(
            SyncPhase::Completed,
            format!("Pulled {} products from server", report.fetched),
            None,
        );
        Ok(report)
    }

    async fn merge_product(
        &self,
        dto: &ProductDto,
        snapshot: ProductSnapshot,
        now: DateTime<Utc>,
    ) -> SyncResult<PullAction> {
        let products = self.db.products();
        let sync_log = self.db.sync_log();

        let Some(local) = products.get_by_id(&snapshot.id).await? else {
            let product = LocalProduct::new(snapshot, now).map_err(|e| SyncError::Internal(e.to_string()))?;
            products.insert(&product).await?;
            sync_log
                .append(SyncEntity::Product, &product.id, SyncOperation::Create, SyncStatus::Synced)
                .await?;
            debug!(id = %product.id, "Inserted product");
            return Ok(PullAction::Inserted);
        };

        if !local.differs_from(&snapshot) {
            return Ok(PullAction::Unchanged);
        }

        if local_edit_wins(&local, dto.updated_at) {
            info!(
                id = %local.id,
                local_edit_at = ?local.local_edit_at,
                server_updated_at = ?dto.updated_at,
                "Keeping newer local edit"
            );
            return Ok(PullAction::KeptLocal);
        }

        if local.local_edit_at.is_some() {
            info!(id = %local.id, "Server values replace local edit");
        }

        let stamp = local.next_stamp(now);
        products.apply_server_values(&snapshot, stamp).await?;
        sync_log
            .append(SyncEntity::Product, &local.id, SyncOperation::Update, SyncStatus::Synced)
            .await?;
        debug!(id = %local.id, price = %snapshot.price, stock = snapshot.stock_qty, "Applied server values");
        Ok(PullAction::Updated)
    }

    async fn pull_failed(&self, err: SyncError) -> SyncError {
        self.state.write().await.last_error = Some(err.to_string());
        self.emit(SyncPhase::Failed, format!("Pull failed: {err}"), None);
        err
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Background loop: push on reconnect, on request, and periodically
    /// while online with something pending.
    pub async fn run_worker(self: Arc<Self>, push_interval: Duration, pull_on_connect: bool, cancel: CancellationToken) {
        info!(interval_secs = push_interval.as_secs(), "Sync worker starting");

        let reconnected = self.monitor.reconnected();
        let mut interval = tokio::time::interval(push_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = reconnected.notified() => {
                    info!("Connectivity restored, starting sync");
                    if let Err(e) = self.start_sync().await {
                        warn!(error = %e, "Push after reconnect failed");
                    }
                    if pull_on_connect {
                        if let Err(e) = self.pull().await {
                            warn!(error = %e, "Pull after reconnect failed");
                        }
                    }
                }

                _ = self.push_requested.notified() => {
                    debug!("Push requested");
                    if let Err(e) = self.push().await {
                        warn!(error = %e, "Requested push failed");
                    }
                }

                _ = interval.tick() => {
                    if !self.monitor.is_online() {
                        continue;
                    }
                    match self.pending_count().await {
                        Ok(0) => {}
                        Ok(pending) => {
                            debug!(pending, "Periodic push");
                            if let Err(e) = self.push().await {
                                warn!(error = %e, "Periodic push failed");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to count pending transactions"),
                    }
                }
            }
        }

        info!("Sync worker stopped");
    }

    fn cycle_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current_cycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, status: SyncPhase, message: impl Into<String>, progress: Option<u8>) {
        self.events.emit(SyncEvent::sync_status(status, message, progress));
    }
}
