//! # Sync Agent
//!
//! Wires the register's background machinery together under one
//! cancellation root and hands out the operator-facing controls.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                SyncAgent  (owns the root CancellationToken)      │  │
//! │  │                                                                  │  │
//! │  │  • Recovers interrupted pushes and restores queued receipts      │  │
//! │  │  • Spawns one task per concern, each with a child token          │  │
//! │  │  • start() returns the SyncAgentHandle                           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Connectivity   │  │  Sync worker   │  │  Receipt queue         │    │
//! │  │ Monitor        │  │                │  │  (RetryQueue)          │    │
//! │  │                │  │ push on        │  │                        │    │
//! │  │ probe loop     │─►│ reconnect and  │  │ bounded retries into   │    │
//! │  │                │  │ on interval    │  │ the ReceiptPrinter     │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  EVENTS (EventHub):                                                    │
//! │  ConnectionStatusChanged / SyncStatusChanged / AuthStatusChanged       │
//! │  JobCompleted / JobFailed / JobRetrying                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ts_rs::TS;

use kasir_core::{LocalProduct, LocalTransaction, SaleRequest, SyncEntity, SyncLogEntry, SyncStatus};
use kasir_db::{Database, ProductWrite};

use crate::api::PosApi;
use crate::config::KasirConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::engine::{PullReport, PushReport, SyncEngine};
use crate::error::{SaleResult, SyncError, SyncResult};
use crate::events::{EventHub, PrintEvent, SubscriptionId, SyncEvent};
use crate::http::HttpPosApi;
use crate::retry_queue::{QueuedJob, RetryQueue, RetryQueueConfig};
use crate::sale::{SaleProcessor, SaleReceipt};
use crate::session::SessionProvider;

/// Name of the receipt queue in `print_jobs`.
pub const RECEIPT_QUEUE: &str = "receipts";

// =============================================================================
// Receipt Printing
// =============================================================================

/// A receipt waiting for the printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptJob {
    pub transaction_id: String,
    pub invoice_number: String,
}

impl From<&LocalTransaction> for ReceiptJob {
    fn from(txn: &LocalTransaction) -> Self {
        ReceiptJob {
            transaction_id: txn.id.clone(),
            invoice_number: txn.invoice_number.clone(),
        }
    }
}

/// The device that turns a [`ReceiptJob`] into paper.
#[async_trait]
pub trait ReceiptPrinter: Send + Sync {
    async fn print(&self, job: &ReceiptJob) -> Result<(), String>;
}

// =============================================================================
// Agent Status
// =============================================================================

/// Snapshot for the status bar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub is_online: bool,
    pub is_authenticated: bool,

    /// Pending, syncing and failed transactions.
    pub pending_count: i64,
    pub failed_count: i64,

    #[ts(as = "Option<String>")]
    pub last_push_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub print_pending: usize,
    pub print_failed: usize,

    /// Failed entries in the sync audit log.
    pub sync_log_failed: i64,
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Everything the agent and its handle share.
struct Shared {
    config: Arc<KasirConfig>,
    db: Arc<Database>,
    session: Arc<dyn SessionProvider>,
    sync_events: Arc<EventHub<SyncEvent>>,
    print_events: Arc<EventHub<PrintEvent>>,
    monitor: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
    sales: SaleProcessor,
    receipts: RetryQueue<ReceiptJob>,
    printer: Option<Arc<dyn ReceiptPrinter>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The register's sync machinery, built but not yet running.
pub struct SyncAgent {
    shared: Arc<Shared>,
}

impl SyncAgent {
    /// Recovers state left by the previous run and spawns the background
    /// tasks.
    pub async fn start(self) -> SyncResult<SyncAgentHandle> {
        let shared = self.shared;
        let config = &shared.config;

        info!(
            device_id = %config.device_id(),
            server = %config.server.base_url,
            "Starting sync agent"
        );

        let recovered = shared.db.transactions().recover_interrupted().await?;
        if recovered > 0 {
            warn!(count = recovered, "Recovered transactions interrupted mid-push");
        }

        let restored = shared.receipts.restore().await?;
        if restored > 0 {
            info!(count = restored, "Restored queued receipts");
        }

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            shared.monitor.clone().run(shared.cancel.child_token()),
        ));

        tasks.push(tokio::spawn(shared.engine.clone().run_worker(
            config.push_interval(),
            config.sync.pull_on_connect,
            shared.cancel.child_token(),
        )));

        match shared.printer.clone() {
            Some(printer) => {
                shared
                    .receipts
                    .start_processing(move |job: ReceiptJob| {
                        let printer = printer.clone();
                        async move { printer.print(&job).await }
                    })
                    .await?;
            }
            None => debug!("No receipt printer attached, receipts stay queued"),
        }

        shared.tasks.lock().await.extend(tasks);

        info!("Sync agent started");
        Ok(SyncAgentHandle { shared })
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Cloneable control surface of a running [`SyncAgent`].
#[derive(Clone)]
pub struct SyncAgentHandle {
    shared: Arc<Shared>,
}

impl SyncAgentHandle {
    // =========================================================================
    // Sales
    // =========================================================================

    /// Runs a sale. A successful sale queues its receipt when a printer is
    /// attached.
    pub async fn process_sale(&self, request: SaleRequest) -> SaleResult<SaleReceipt> {
        let receipt = self.shared.sales.process_sale(request).await?;
        if self.shared.printer.is_some() {
            self.shared
                .receipts
                .enqueue(ReceiptJob::from(&receipt.transaction))
                .await;
        }
        Ok(receipt)
    }

    /// Local sales history, newest first.
    pub async fn recent_transactions(&self, page: u32, page_size: u32) -> SyncResult<Vec<LocalTransaction>> {
        Ok(self.shared.db.transactions().list_recent(page, page_size).await?)
    }

    /// Scanner lookup against the product cache.
    pub async fn lookup_barcode(&self, barcode: &str) -> SyncResult<Option<LocalProduct>> {
        Ok(self.shared.db.products().get_by_barcode(barcode).await?)
    }

    /// Sellable products, ordered by name.
    pub async fn active_products(&self) -> SyncResult<Vec<LocalProduct>> {
        Ok(self.shared.db.products().list_active().await?)
    }

    /// Offline admin edit of price, stock or active flag. A later pull
    /// keeps it only while it is newer than the server's copy.
    pub async fn edit_product(&self, id: &str, edit: ProductWrite) -> SyncResult<LocalProduct> {
        Ok(self
            .shared
            .db
            .products()
            .apply_local_edit(id, edit, Utc::now())
            .await?)
    }

    /// Latest sync audit entries, newest first.
    pub async fn sync_history(&self, limit: u32) -> SyncResult<Vec<SyncLogEntry>> {
        Ok(self.shared.db.sync_log().recent(limit).await?)
    }

    /// Every push attempt recorded for one transaction.
    pub async fn transaction_sync_history(&self, transaction_id: &str) -> SyncResult<Vec<SyncLogEntry>> {
        Ok(self
            .shared
            .db
            .sync_log()
            .for_entity(SyncEntity::Transaction, transaction_id)
            .await?)
    }

    // =========================================================================
    // Sync Controls
    // =========================================================================

    /// Number of failed transactions handed back to the push loop. The push
    /// itself runs on the sync worker.
    pub async fn retry_all_failed(&self) -> SyncResult<i64> {
        let count = self.shared.engine.failed_count().await?;
        if count > 0 {
            info!(count, "Retrying failed transactions");
            self.shared.engine.request_push();
        }
        Ok(count)
    }

    pub async fn pending_count(&self) -> SyncResult<i64> {
        self.shared.engine.pending_count().await
    }

    /// Runs a push cycle now, after any running one.
    pub async fn sync_to_server(&self) -> SyncResult<PushReport> {
        self.shared.engine.push().await
    }

    pub async fn sync_from_server(&self) -> SyncResult<PullReport> {
        self.shared.engine.pull().await
    }

    /// Cancels the running push cycle and starts a fresh one.
    pub async fn start_sync(&self) -> SyncResult<PushReport> {
        self.shared.engine.start_sync().await
    }

    pub fn is_online(&self) -> bool {
        self.shared.monitor.is_online()
    }

    /// Probes the server immediately instead of waiting for the next tick.
    pub async fn check_connection(&self) -> bool {
        self.shared.monitor.probe_now().await
    }

    pub async fn status(&self) -> SyncResult<AgentStatus> {
        let counts = self.shared.db.transactions().counts_by_status().await?;
        let engine = self.shared.engine.state().await;

        Ok(AgentStatus {
            is_online: self.shared.monitor.is_online(),
            is_authenticated: self.shared.session.is_authenticated(),
            pending_count: counts.unsynced(),
            failed_count: counts.failed,
            last_push_at: engine.last_push_at,
            last_pull_at: engine.last_pull_at,
            last_error: engine.last_error,
            print_pending: self.shared.receipts.pending_count().await,
            print_failed: self.shared.receipts.failed_count().await,
            sync_log_failed: self.shared.db.sync_log().count_by_status(SyncStatus::Failed).await?,
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.shared.sync_events.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.shared.sync_events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.sync_events.unsubscribe(id)
    }

    pub fn subscribe_print<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PrintEvent) + Send + Sync + 'static,
    {
        self.shared.print_events.subscribe(listener)
    }

    pub fn unsubscribe_print(&self, id: SubscriptionId) -> bool {
        self.shared.print_events.unsubscribe(id)
    }

    // =========================================================================
    // Print Queue Controls
    // =========================================================================

    pub async fn enqueue_receipt(&self, job: ReceiptJob) -> String {
        self.shared.receipts.enqueue(job).await
    }

    /// Reprints a receipt for a stored transaction.
    pub async fn reprint(&self, transaction_id: &str) -> SyncResult<String> {
        let txn = self
            .shared
            .db
            .transactions()
            .get(transaction_id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(transaction_id.to_string()))?;
        Ok(self.shared.receipts.enqueue(ReceiptJob::from(&txn)).await)
    }

    pub async fn retry_print_job(&self, id: &str) -> bool {
        self.shared.receipts.retry_job(id).await
    }

    pub async fn retry_failed_prints(&self) -> usize {
        self.shared.receipts.retry_all_failed().await
    }

    pub async fn remove_failed_print(&self, id: &str) -> bool {
        self.shared.receipts.remove_failed_job(id).await
    }

    pub async fn clear_failed_prints(&self) -> usize {
        self.shared.receipts.clear_failed_jobs().await
    }

    pub async fn failed_prints(&self) -> Vec<QueuedJob<ReceiptJob>> {
        self.shared.receipts.failed_jobs().await
    }

    pub async fn pending_prints(&self) -> usize {
        self.shared.receipts.pending_count().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Cancels every loop and running cycle, then waits for the tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down sync agent");

        self.shared.cancel.cancel();
        self.shared.receipts.stop_processing().await;

        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Agent task ended abnormally");
            }
        }

        info!("Sync agent stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: KasirConfig,
    db: Option<Arc<Database>>,
    session: Option<Arc<dyn SessionProvider>>,
    api: Option<Arc<dyn PosApi>>,
    printer: Option<Arc<dyn ReceiptPrinter>>,
    sync_events: Option<Arc<EventHub<SyncEvent>>>,
}

impl SyncAgentBuilder {
    pub fn new(config: KasirConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            session: None,
            api: None,
            printer: None,
            sync_events: None,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    /// Replaces the HTTP client built from the config.
    pub fn with_api(mut self, api: Arc<dyn PosApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_printer(mut self, printer: Arc<dyn ReceiptPrinter>) -> Self {
        self.printer = Some(printer);
        self
    }

    /// Shares an existing hub, typically the one the session store emits on.
    pub fn with_events(mut self, events: Arc<EventHub<SyncEvent>>) -> Self {
        self.sync_events = Some(events);
        self
    }

    pub fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let session = self
            .session
            .ok_or_else(|| SyncError::InvalidConfig("Session required".into()))?;
        let api = match self.api {
            Some(api) => api,
            None => Arc::new(HttpPosApi::new(&self.config, session.clone())?),
        };

        let config = Arc::new(self.config);
        let sync_events = self.sync_events.unwrap_or_default();
        let print_events = Arc::new(EventHub::new());
        let cancel = CancellationToken::new();

        let monitor = ConnectivityMonitor::new(api.clone(), config.connectivity.clone(), sync_events.clone());

        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            api.clone(),
            monitor.clone(),
            session.clone(),
            sync_events.clone(),
            config.sync.pull_page_size,
            cancel.child_token(),
        ));

        let sales = SaleProcessor::new(
            db.clone(),
            api,
            monitor.clone(),
            session.clone(),
            config.sale.tax_rate(),
        );

        let receipts = RetryQueue::with_store(
            RECEIPT_QUEUE,
            RetryQueueConfig::from(&config.print),
            print_events.clone(),
            db.print_jobs(),
            cancel.child_token(),
        );

        Ok(SyncAgent {
            shared: Arc::new(Shared {
                config,
                db,
                session,
                sync_events,
                print_events,
                monitor,
                engine,
                sales,
                receipts,
                printer: self.printer,
                cancel,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncPhase;
    use crate::session::{Session, SessionStore};
    use crate::testing::ScriptedApi;
    use kasir_core::{LocalProduct, Money, PaymentMethod, ProductSnapshot, SaleLine, SyncStatus};
    use kasir_db::DbConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingPrinter {
        printed: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReceiptPrinter for CountingPrinter {
        async fn print(&self, _job: &ReceiptJob) -> Result<(), String> {
            if self.fail {
                return Err("paper out".into());
            }
            self.printed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> KasirConfig {
        let mut config = KasirConfig::default();
        config.print.retry_delay_ms = 10;
        config.print.idle_poll_ms = 10;
        config
    }

    async fn setup(api: Arc<ScriptedApi>, printer: Option<Arc<CountingPrinter>>) -> (Arc<Database>, SyncAgentHandle) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let product = LocalProduct::new(
            ProductSnapshot {
                id: "a".into(),
                barcode: "899a".into(),
                name: "Kopi".into(),
                price: Money::from_minor(10_000),
                stock_qty: 50,
                category_id: None,
                category_name: None,
                is_active: true,
            },
            Utc::now(),
        )
        .unwrap();
        db.products().insert(&product).await.unwrap();

        let events = Arc::new(EventHub::new());
        let session = Arc::new(SessionStore::new(events.clone()));
        session.sign_in(Session {
            token: "tok".into(),
            cashier_id: "cashier-1".into(),
        });

        let mut builder = SyncAgentBuilder::new(test_config())
            .with_database(db.clone())
            .with_session(session)
            .with_api(api)
            .with_events(events);
        if let Some(printer) = printer {
            builder = builder.with_printer(printer);
        }

        let handle = builder.build().unwrap().start().await.unwrap();
        (db, handle)
    }

    fn one_coffee() -> SaleRequest {
        SaleRequest {
            items: vec![SaleLine {
                product_id: "a".into(),
                quantity: 1,
            }],
            payment_method: PaymentMethod::Cash,
            amount_paid: Money::from_minor(10_000),
        }
    }

    #[test]
    fn test_build_requires_database_and_session() {
        assert!(matches!(
            SyncAgentBuilder::new(KasirConfig::default()).build(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_pushes_offline_backlog() {
        let api = Arc::new(ScriptedApi::new());
        api.set_healthy(false);
        let (db, handle) = setup(api.clone(), None).await;

        handle.check_connection().await;
        assert!(!handle.is_online());
        handle.process_sale(one_coffee()).await.unwrap();
        handle.process_sale(one_coffee()).await.unwrap();
        assert_eq!(handle.pending_count().await.unwrap(), 2);

        let mut rx = handle.subscribe_channel();
        api.set_healthy(true);
        assert!(handle.check_connection().await);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SyncEvent::SyncStatusChanged {
                status: SyncPhase::Completed,
                ..
            } = event
            {
                break;
            }
        }

        let status = handle.status().await.unwrap();
        assert!(status.is_online);
        assert!(status.is_authenticated);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_push_at.is_some());

        let history = handle.recent_transactions(1, 10).await.unwrap();
        assert!(history.iter().all(|t| t.sync_status == SyncStatus::Synced));

        let attempts = handle.transaction_sync_history(&history[0].id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].sync_status, SyncStatus::Synced);
        assert_eq!(handle.sync_history(10).await.unwrap().len(), 2);
        assert_eq!(status.sync_log_failed, 0);
        assert_eq!(db.transactions().counts_by_status().await.unwrap().synced, 2);

        handle.shutdown().await;
        assert!(handle.is_shut_down());
    }

    #[tokio::test]
    async fn test_catalog_lookups() {
        let api = Arc::new(ScriptedApi::new());
        let (db, handle) = setup(api, None).await;
        let hidden = LocalProduct::new(
            ProductSnapshot {
                id: "z".into(),
                barcode: "899z".into(),
                name: "Retired".into(),
                price: Money::from_minor(1_000),
                stock_qty: 0,
                category_id: None,
                category_name: None,
                is_active: false,
            },
            Utc::now(),
        )
        .unwrap();
        db.products().insert(&hidden).await.unwrap();

        let found = handle.lookup_barcode("899a").await.unwrap().unwrap();
        assert_eq!(found.id, "a");
        assert!(handle.lookup_barcode("000").await.unwrap().is_none());

        let active = handle.active_products().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");

        let edited = handle
            .edit_product(
                "z",
                ProductWrite {
                    price: Money::from_minor(1_500),
                    stock_qty: 4,
                    is_active: true,
                },
            )
            .await
            .unwrap();
        assert!(edited.local_edit_at.is_some());
        assert_eq!(handle.active_products().await.unwrap().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sale_queues_receipt() {
        let api = Arc::new(ScriptedApi::new());
        let printer = Arc::new(CountingPrinter {
            printed: AtomicUsize::new(0),
            fail: false,
        });
        let (_db, handle) = setup(api, Some(printer.clone())).await;

        let receipt = handle.process_sale(one_coffee()).await.unwrap();
        handle.reprint(&receipt.transaction.id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while printer.printed.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(handle.reprint("missing").await, Err(SyncError::JobNotFound(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_receipts_are_operator_controlled() {
        let api = Arc::new(ScriptedApi::new());
        let printer = Arc::new(CountingPrinter {
            printed: AtomicUsize::new(0),
            fail: true,
        });
        let (_db, handle) = setup(api, Some(printer)).await;

        handle.process_sale(one_coffee()).await.unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let failed = handle.failed_prints().await;
                if !failed.is_empty() {
                    break failed;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(failed[0].retry_count, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("paper out"));

        assert!(handle.remove_failed_print(&failed[0].id).await);
        assert_eq!(handle.clear_failed_prints().await, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_all_failed_reports_count() {
        let api = Arc::new(ScriptedApi::new());
        api.set_healthy(false);
        let (db, handle) = setup(api.clone(), None).await;
        handle.check_connection().await;

        let receipt = handle.process_sale(one_coffee()).await.unwrap();
        let repo = db.transactions();
        assert!(repo.mark_syncing(&receipt.transaction.id).await.unwrap());
        repo.mark_failed(&receipt.transaction.id, "timeout").await.unwrap();

        assert_eq!(handle.retry_all_failed().await.unwrap(), 1);
        assert_eq!(handle.pending_count().await.unwrap(), 1);

        handle.shutdown().await;
        assert_eq!(repo.counts_by_status().await.unwrap().syncing, 0);
    }

    async fn wait_for_message(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>, expected: &str) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SyncEvent::SyncStatusChanged { message, .. } = event {
                if message == expected {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_retry_push_runs_on_worker_before_shutdown() {
        let api = Arc::new(ScriptedApi::new());
        api.set_healthy(false);
        let (db, handle) = setup(api.clone(), None).await;
        handle.check_connection().await;
        handle.process_sale(one_coffee()).await.unwrap();

        // Reconnect push fails the row
        let mut rx = handle.subscribe_channel();
        api.fail_next_creates(1);
        api.set_healthy(true);
        assert!(handle.check_connection().await);
        wait_for_message(&mut rx, "Sync completed: 0/1 transactions synced").await;
        assert_eq!(db.transactions().count_failed().await.unwrap(), 1);

        assert_eq!(handle.retry_all_failed().await.unwrap(), 1);
        wait_for_message(&mut rx, "Sync completed: 1/1 transactions synced").await;

        handle.shutdown().await;
        let counts = db.transactions().counts_by_status().await.unwrap();
        assert_eq!(counts.syncing, 0);
        assert_eq!(counts.synced, 1);
        assert_eq!(api.created().len(), 1);
    }
}
