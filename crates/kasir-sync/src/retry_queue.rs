//! # Retry Queue
//!
//! A generic job queue with bounded retries and a fixed retry delay. The
//! register uses it for receipt printing, but any serializable job works.
//!
//! ## Job Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue ──► PENDING ──► PROCESSING ──ok──► COMPLETED (row deleted)    │
//! │                 ▲             │                                         │
//! │                 │            err                                        │
//! │                 │             │                                         │
//! │                 │     retry_count += 1                                  │
//! │                 │             │                                         │
//! │          wait retry_delay     ├── retry_count < max ──► RETRYING        │
//! │                 └─────────────┘                                         │
//! │                               └── otherwise ──► FAILED (failed set)    │
//! │                                                                         │
//! │  retry_job / retry_all_failed: FAILED ──► PENDING with retry_count 0   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//! The working set lives in memory. With a store attached, every state
//! change is mirrored into `print_jobs`, and [`RetryQueue::restore`] reloads
//! unfinished and failed jobs after a restart. Store writes are best effort:
//! a failed write is logged and the in-memory queue carries on.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kasir_core::JobStatus;
use kasir_db::{PrintJobRecord, PrintJobRepository};

use crate::config::PrintSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventHub, PrintEvent};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryQueueConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub idle_poll: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        RetryQueueConfig::from(&PrintSettings::default())
    }
}

impl From<&PrintSettings> for RetryQueueConfig {
    fn from(settings: &PrintSettings) -> Self {
        RetryQueueConfig {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            idle_poll: Duration::from_millis(settings.idle_poll_ms),
        }
    }
}

// =============================================================================
// Queued Job
// =============================================================================

/// A job and its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob<J> {
    pub id: String,
    pub job: J,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<J: Serialize> QueuedJob<J> {
    fn to_record(&self, queue: &str) -> SyncResult<PrintJobRecord> {
        Ok(PrintJobRecord {
            id: self.id.clone(),
            queue: queue.to_string(),
            payload: serde_json::to_string(&self.job)?,
            status: self.status,
            retry_count: i64::from(self.retry_count),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        })
    }
}

impl<J: DeserializeOwned> QueuedJob<J> {
    fn from_record(record: &PrintJobRecord) -> SyncResult<Self> {
        Ok(QueuedJob {
            id: record.id.clone(),
            job: record.decode()?,
            status: record.status,
            retry_count: u32::try_from(record.retry_count).unwrap_or(0),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
        })
    }
}

// =============================================================================
// Retry Queue
// =============================================================================

struct QueueState<J> {
    pending: VecDeque<QueuedJob<J>>,
    failed: Vec<QueuedJob<J>>,
}

struct ProcessorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<J> {
    name: String,
    config: RetryQueueConfig,
    state: Mutex<QueueState<J>>,
    wakeup: Notify,
    store: Option<PrintJobRepository>,
    events: Arc<EventHub<PrintEvent>>,
    parent: CancellationToken,
    processor: Mutex<Option<ProcessorHandle>>,
}

/// Cloneable handle to one named queue.
pub struct RetryQueue<J> {
    inner: Arc<Inner<J>>,
}

impl<J> Clone for RetryQueue<J> {
    fn clone(&self) -> Self {
        RetryQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<J> RetryQueue<J>
where
    J: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// In-memory queue. Use [`Self::with_store`] for durability.
    pub fn new(name: impl Into<String>, config: RetryQueueConfig, events: Arc<EventHub<PrintEvent>>) -> Self {
        Self::build(name.into(), config, events, None, CancellationToken::new())
    }

    pub fn with_store(
        name: impl Into<String>,
        config: RetryQueueConfig,
        events: Arc<EventHub<PrintEvent>>,
        store: PrintJobRepository,
        parent: CancellationToken,
    ) -> Self {
        Self::build(name.into(), config, events, Some(store), parent)
    }

    fn build(
        name: String,
        config: RetryQueueConfig,
        events: Arc<EventHub<PrintEvent>>,
        store: Option<PrintJobRepository>,
        parent: CancellationToken,
    ) -> Self {
        RetryQueue {
            inner: Arc::new(Inner {
                name,
                config,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    failed: Vec::new(),
                }),
                wakeup: Notify::new(),
                store,
                events,
                parent,
                processor: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds a job to the back of the queue and returns its id.
    pub async fn enqueue(&self, job: J) -> String {
        let queued = QueuedJob {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        };
        let id = queued.id.clone();

        self.inner.persist_or_warn(&queued).await;
        self.inner.state.lock().await.pending.push_back(queued);
        self.inner.wakeup.notify_one();

        debug!(queue = %self.inner.name, job_id = %id, "Job enqueued");
        id
    }

    /// Spawns the processor, which hands each job to `action`.
    pub async fn start_processing<F, Fut, E>(&self, action: F) -> SyncResult<()>
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut processor = self.inner.processor.lock().await;
        if processor.as_ref().is_some_and(|p| !p.task.is_finished()) {
            return Err(SyncError::AlreadyRunning);
        }

        let cancel = self.inner.parent.child_token();
        let task = tokio::spawn(Inner::run(self.inner.clone(), action, cancel.clone()));
        *processor = Some(ProcessorHandle { cancel, task });

        info!(queue = %self.inner.name, "Queue processing started");
        Ok(())
    }

    /// Stops the processor and waits for it to exit.
    ///
    /// A job interrupted during its retry delay goes back to the front of
    /// the queue.
    pub async fn stop_processing(&self) {
        let handle = self.inner.processor.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(queue = %self.inner.name, error = %e, "Queue processor ended abnormally");
            }
            info!(queue = %self.inner.name, "Queue processing stopped");
        }
    }

    pub async fn is_processing(&self) -> bool {
        self.inner
            .processor
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    /// Moves a failed job back to the queue with a fresh retry budget.
    pub async fn retry_job(&self, id: &str) -> bool {
        let job = {
            let mut state = self.inner.state.lock().await;
            let Some(index) = state.failed.iter().position(|j| j.id == id) else {
                return false;
            };
            let mut job = state.failed.remove(index);
            job.retry_count = 0;
            job.status = JobStatus::Pending;
            state.pending.push_back(job.clone());
            job
        };

        self.inner.persist_or_warn(&job).await;
        self.inner.wakeup.notify_one();
        true
    }

    /// Retries every failed job and returns how many were requeued.
    pub async fn retry_all_failed(&self) -> usize {
        let ids: Vec<String> = {
            let state = self.inner.state.lock().await;
            state.failed.iter().map(|j| j.id.clone()).collect()
        };

        let mut count = 0;
        for id in ids {
            if self.retry_job(&id).await {
                count += 1;
            }
        }

        if count > 0 {
            info!(queue = %self.inner.name, count, "Retrying failed jobs");
        }
        count
    }

    pub async fn remove_failed_job(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let before = state.failed.len();
            state.failed.retain(|j| j.id != id);
            state.failed.len() != before
        };

        if removed {
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.delete(id).await {
                    warn!(queue = %self.inner.name, job_id = %id, error = %e, "Failed to delete job row");
                }
            }
        }
        removed
    }

    /// Drops every failed job and returns how many went.
    pub async fn clear_failed_jobs(&self) -> usize {
        let cleared = {
            let mut state = self.inner.state.lock().await;
            let count = state.failed.len();
            state.failed.clear();
            count
        };

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.delete_failed(&self.inner.name).await {
                warn!(queue = %self.inner.name, error = %e, "Failed to clear failed job rows");
            }
        }
        cleared
    }

    pub async fn failed_jobs(&self) -> Vec<QueuedJob<J>> {
        self.inner.state.lock().await.failed.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn failed_count(&self) -> usize {
        self.inner.state.lock().await.failed.len()
    }

    /// Reloads unfinished and failed jobs from the store.
    ///
    /// Jobs caught mid-attempt by a crash come back as `Pending`. Rows whose
    /// payload no longer decodes are skipped with a warning. Returns the
    /// number of jobs restored.
    pub async fn restore(&self) -> SyncResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };

        let records = store.list_unfinished(&self.inner.name).await?;
        let mut state = self.inner.state.lock().await;
        let mut restored = 0;

        for record in records {
            let known = state.pending.iter().chain(state.failed.iter()).any(|j| j.id == record.id);
            if known {
                continue;
            }

            let mut job = match QueuedJob::<J>::from_record(&record) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %self.inner.name, job_id = %record.id, error = %e, "Skipping undecodable job");
                    continue;
                }
            };

            if job.status == JobStatus::Failed {
                state.failed.push(job);
            } else {
                job.status = JobStatus::Pending;
                state.pending.push_back(job);
            }
            restored += 1;
        }
        drop(state);

        if restored > 0 {
            info!(queue = %self.inner.name, count = restored, "Restored queued jobs");
            self.inner.wakeup.notify_one();
        }
        Ok(restored)
    }
}

// =============================================================================
// Processor
// =============================================================================

impl<J> Inner<J>
where
    J: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run<F, Fut, E>(self: Arc<Self>, action: F, cancel: CancellationToken)
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        debug!(queue = %self.name, "Queue processor running");

        while !cancel.is_cancelled() {
            let next = self.state.lock().await.pending.pop_front();

            match next {
                Some(job) => self.process(job, &action, &cancel).await,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(self.config.idle_poll) => {}
                    }
                }
            }
        }

        debug!(queue = %self.name, "Queue processor exiting");
    }

    async fn process<F, Fut, E>(&self, mut job: QueuedJob<J>, action: &F, cancel: &CancellationToken)
    where
        F: Fn(J) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        job.status = JobStatus::Processing;
        self.persist_or_warn(&job).await;

        match action(job.job.clone()).await {
            Ok(()) => {
                debug!(queue = %self.name, job_id = %job.id, "Job completed");
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete(&job.id).await {
                        if !e.is_not_found() {
                            warn!(queue = %self.name, job_id = %job.id, error = %e, "Failed to delete completed job row");
                        }
                    }
                }
                self.events.emit(PrintEvent::JobCompleted { job_id: job.id });
            }
            Err(e) => {
                job.retry_count += 1;
                job.last_error = Some(e.to_string());
                self.handle_failure(job, cancel).await;
            }
        }
    }

    async fn handle_failure(&self, mut job: QueuedJob<J>, cancel: &CancellationToken) {
        let error = job.last_error.clone().unwrap_or_default();

        if job.retry_count < self.config.max_retries {
            job.status = JobStatus::Retrying;
            self.persist_or_warn(&job).await;

            warn!(queue = %self.name, job_id = %job.id, attempt = job.retry_count, error = %error, "Job failed, retrying");
            self.events.emit(PrintEvent::JobRetrying {
                job_id: job.id.clone(),
                error,
                retry_count: job.retry_count,
            });

            let interrupted = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.config.retry_delay) => false,
            };

            job.status = JobStatus::Pending;
            self.persist_or_warn(&job).await;
            let mut state = self.state.lock().await;
            if interrupted {
                state.pending.push_front(job);
            } else {
                state.pending.push_back(job);
            }
        } else {
            job.status = JobStatus::Failed;
            self.persist_or_warn(&job).await;

            warn!(queue = %self.name, job_id = %job.id, retries = job.retry_count, error = %error, "Job failed permanently");
            let event = PrintEvent::JobFailed {
                job_id: job.id.clone(),
                error,
                retry_count: job.retry_count,
            };
            self.state.lock().await.failed.push(job);
            self.events.emit(event);
        }
    }

    /// Mirrors the job into the store. Failure is logged, never fatal.
    async fn persist_or_warn(&self, job: &QueuedJob<J>) {
        let Some(store) = &self.store else {
            return;
        };

        let result = match job.to_record(&self.name) {
            Ok(record) => store.save(&record).await.map_err(SyncError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(queue = %self.name, job_id = %job.id, error = %e, "Failed to persist job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasir_db::{Database, DbConfig};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        invoice: String,
    }

    fn receipt(n: u32) -> Receipt {
        Receipt {
            invoice: format!("INV-20250301-{n:04}"),
        }
    }

    fn fast_config() -> RetryQueueConfig {
        RetryQueueConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            idle_poll: Duration::from_millis(5),
        }
    }

    async fn durable_queue(db: &Database) -> (RetryQueue<Receipt>, broadcast::Receiver<PrintEvent>) {
        let events = Arc::new(EventHub::new());
        let rx = events.subscribe_channel();
        let queue = RetryQueue::with_store(
            "receipts",
            fast_config(),
            events,
            db.print_jobs(),
            CancellationToken::new(),
        );
        (queue, rx)
    }

    async fn next_event(rx: &mut broadcast::Receiver<PrintEvent>) -> PrintEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_and_deletes_row() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (queue, mut rx) = durable_queue(&db).await;

        let id = queue.enqueue(receipt(1)).await;
        assert!(db.print_jobs().get(&id).await.unwrap().is_some());

        let printed = Arc::new(AtomicUsize::new(0));
        let counter = printed.clone();
        queue
            .start_processing(move |_r: Receipt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, PrintEvent::JobCompleted { job_id: id.clone() });
        assert_eq!(printed.load(Ordering::SeqCst), 1);
        assert!(db.print_jobs().get(&id).await.unwrap().is_none());
        assert_eq!(queue.pending_count().await, 0);

        queue.stop_processing().await;
        assert!(!queue.is_processing().await);
    }

    #[tokio::test]
    async fn test_failures_retry_then_fail() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (queue, mut rx) = durable_queue(&db).await;
        let id = queue.enqueue(receipt(1)).await;

        queue
            .start_processing(|_r: Receipt| async { Err::<(), _>("paper out") })
            .await
            .unwrap();

        for attempt in 1..=2 {
            assert_eq!(
                next_event(&mut rx).await,
                PrintEvent::JobRetrying {
                    job_id: id.clone(),
                    error: "paper out".into(),
                    retry_count: attempt,
                }
            );
        }
        assert_eq!(
            next_event(&mut rx).await,
            PrintEvent::JobFailed {
                job_id: id.clone(),
                error: "paper out".into(),
                retry_count: 3,
            }
        );
        queue.stop_processing().await;

        let failed = queue.failed_jobs().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, JobStatus::Failed);
        assert_eq!(failed[0].last_error.as_deref(), Some("paper out"));

        let row = db.print_jobs().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.retry_count, 3);
    }

    #[tokio::test]
    async fn test_retry_job_resets_budget() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (queue, mut rx) = durable_queue(&db).await;
        let id = queue.enqueue(receipt(1)).await;

        // Fails the first three attempts, succeeds afterwards
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        queue
            .start_processing(move |_r: Receipt| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err("offline")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        loop {
            if let PrintEvent::JobFailed { .. } = next_event(&mut rx).await {
                break;
            }
        }

        assert!(!queue.retry_job("unknown").await);
        assert_eq!(queue.retry_all_failed().await, 1);
        assert_eq!(next_event(&mut rx).await, PrintEvent::JobCompleted { job_id: id });
        assert_eq!(queue.failed_count().await, 0);
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let queue: RetryQueue<Receipt> = RetryQueue::new("receipts", fast_config(), Arc::new(EventHub::new()));
        queue.start_processing(|_r| async { Ok::<(), String>(()) }).await.unwrap();
        assert!(matches!(
            queue.start_processing(|_r| async { Ok::<(), String>(()) }).await,
            Err(SyncError::AlreadyRunning)
        ));
        queue.stop_processing().await;
        queue.start_processing(|_r| async { Ok::<(), String>(()) }).await.unwrap();
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let failed_id = {
            let (queue, mut rx) = durable_queue(&db).await;
            let failed_id = queue.enqueue(receipt(1)).await;
            queue
                .start_processing(|_r: Receipt| async { Err::<(), _>("jammed") })
                .await
                .unwrap();
            loop {
                if let PrintEvent::JobFailed { .. } = next_event(&mut rx).await {
                    break;
                }
            }
            queue.stop_processing().await;
            queue.enqueue(receipt(2)).await;
            failed_id
        };

        // Fresh process, same database
        let (queue, _rx) = durable_queue(&db).await;
        assert_eq!(queue.restore().await.unwrap(), 2);
        assert_eq!(queue.restore().await.unwrap(), 0);
        assert_eq!(queue.pending_count().await, 1);
        assert_eq!(queue.failed_jobs().await[0].id, failed_id);

        assert!(queue.remove_failed_job(&failed_id).await);
        assert!(db.print_jobs().get(&failed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_failed_jobs() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (queue, mut rx) = durable_queue(&db).await;
        queue.enqueue(receipt(1)).await;
        queue.enqueue(receipt(2)).await;

        queue
            .start_processing(|_r: Receipt| async { Err::<(), _>("no printer") })
            .await
            .unwrap();

        let mut failed = 0;
        while failed < 2 {
            if let PrintEvent::JobFailed { .. } = next_event(&mut rx).await {
                failed += 1;
            }
        }
        queue.stop_processing().await;

        assert_eq!(queue.clear_failed_jobs().await, 2);
        assert!(queue.failed_jobs().await.is_empty());
        assert!(db.print_jobs().list_unfinished("receipts").await.unwrap().is_empty());
    }
}
