//! # Print Job Repository
//!
//! Durable rows behind the retry queue. The queue keeps its working set in
//! memory; this table lets pending and failed jobs survive a restart.
//!
//! ```text
//! enqueue ──► save(Pending)
//! attempt ──► save(Processing)
//! failure ──► save(Retrying | Failed, retry_count, last_error)
//! success ──► delete
//! restart ──► list_unfinished ──► back into the queue
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use kasir_core::JobStatus;

/// One durable queue job. `payload` is the job serialized as JSON.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PrintJobRecord {
    pub id: String,
    pub queue: String,
    pub payload: String,
    pub status: JobStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrintJobRecord {
    /// A fresh `Pending` record with a new id.
    pub fn new<T: Serialize>(queue: &str, job: &T) -> DbResult<Self> {
        let now = Utc::now();
        Ok(PrintJobRecord {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            payload: serde_json::to_string(job)?,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> DbResult<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone)]
pub struct PrintJobRepository {
    pool: SqlitePool,
}

impl PrintJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PrintJobRepository { pool }
    }

    /// Inserts the record, or overwrites its mutable fields if it exists.
    pub async fn save(&self, record: &PrintJobRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO print_jobs (
                id, queue, payload, status, retry_count, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.queue)
        .bind(&record.payload)
        .bind(record.status)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(id = %record.id, status = ?record.status, retries = record.retry_count, "Print job saved");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<PrintJobRecord>> {
        let record = sqlx::query_as::<_, PrintJobRecord>(
            r#"
            SELECT id, queue, payload, status, retry_count, last_error, created_at, updated_at
            FROM print_jobs WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Jobs of `queue` that still need attention, oldest first.
    ///
    /// `Processing` and `Retrying` rows are included: a crash mid-attempt
    /// leaves them behind.
    pub async fn list_unfinished(&self, queue: &str) -> DbResult<Vec<PrintJobRecord>> {
        let records = sqlx::query_as::<_, PrintJobRecord>(
            r#"
            SELECT id, queue, payload, status, retry_count, last_error, created_at, updated_at
            FROM print_jobs
            WHERE queue = ?1 AND status != 'completed'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM print_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("PrintJob", id));
        }
        Ok(())
    }

    /// Deletes every `Failed` job of `queue`, returning how many went.
    pub async fn delete_failed(&self, queue: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM print_jobs WHERE queue = ?1 AND status = 'failed'")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        invoice: String,
        copies: u8,
    }

    #[tokio::test]
    async fn test_save_update_and_restore() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.print_jobs();

        let job = Receipt {
            invoice: "INV-20250301-0001".to_string(),
            copies: 2,
        };
        let mut record = PrintJobRecord::new("receipts", &job).unwrap();
        repo.save(&record).await.unwrap();

        record.status = JobStatus::Failed;
        record.retry_count = 3;
        record.last_error = Some("paper out".to_string());
        record.updated_at = Utc::now();
        repo.save(&record).await.unwrap();

        let loaded = repo.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.retry_count, 3);
        assert_eq!(loaded.decode::<Receipt>().unwrap(), job);

        let unfinished = repo.list_unfinished("receipts").await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert!(repo.list_unfinished("labels").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failed_only() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.print_jobs();

        let pending = PrintJobRecord::new("receipts", &1u32).unwrap();
        let mut failed = PrintJobRecord::new("receipts", &2u32).unwrap();
        failed.status = JobStatus::Failed;
        repo.save(&pending).await.unwrap();
        repo.save(&failed).await.unwrap();

        assert_eq!(repo.delete_failed("receipts").await.unwrap(), 1);
        let left = repo.list_unfinished("receipts").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, pending.id);

        repo.delete(&pending.id).await.unwrap();
        assert!(repo.delete(&pending.id).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let record = PrintJobRecord::new("receipts", &"plain string").unwrap();
        assert!(matches!(
            record.decode::<Receipt>(),
            Err(DbError::Serialization(_))
        ));
    }
}
