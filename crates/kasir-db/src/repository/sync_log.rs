//! # Sync Log Repository
//!
//! Append-only audit of sync attempts. Only `sync_status`, `synced_at` and
//! `error_message` are ever updated, when the attempt completes.
//! Nothing reads this table for correctness.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use kasir_core::{SyncEntity, SyncLogEntry, SyncOperation, SyncStatus};

#[derive(Debug, sqlx::FromRow)]
struct SyncLogRow {
    id: i64,
    entity_type: SyncEntity,
    entity_id: String,
    operation: SyncOperation,
    sync_status: SyncStatus,
    created_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl From<SyncLogRow> for SyncLogEntry {
    fn from(row: SyncLogRow) -> Self {
        SyncLogEntry {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            operation: row.operation,
            sync_status: row.sync_status,
            created_at: row.created_at,
            synced_at: row.synced_at,
            error_message: row.error_message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// Appends an entry and returns its id.
    pub async fn append(
        &self,
        entity_type: SyncEntity,
        entity_id: &str,
        operation: SyncOperation,
        status: SyncStatus,
    ) -> DbResult<i64> {
        let now = Utc::now();
        let synced_at = (status == SyncStatus::Synced).then_some(now);

        let result = sqlx::query(
            r#"
            INSERT INTO sync_log (entity_type, entity_id, operation, sync_status, created_at, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(operation)
        .bind(status)
        .bind(now)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(log_id = id, entity_id = %entity_id, status = %status, "Sync log appended");
        Ok(id)
    }

    /// Records the outcome of an attempt. `error` is `None` on success.
    pub async fn complete(&self, id: i64, error: Option<&str>) -> DbResult<()> {
        let (status, synced_at) = match error {
            None => (SyncStatus::Synced, Some(Utc::now())),
            Some(_) => (SyncStatus::Failed, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE sync_log SET sync_status = ?2, synced_at = ?3, error_message = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(synced_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncLog", id.to_string()));
        }
        Ok(())
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncLogEntry>> {
        let rows: Vec<SyncLogRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, operation, sync_status,
                   created_at, synced_at, error_message
            FROM sync_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SyncLogEntry::from).collect())
    }

    /// Entries for one entity, oldest first.
    pub async fn for_entity(&self, entity_type: SyncEntity, entity_id: &str) -> DbResult<Vec<SyncLogEntry>> {
        let rows: Vec<SyncLogRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, operation, sync_status,
                   created_at, synced_at, error_message
            FROM sync_log
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SyncLogEntry::from).collect())
    }

    pub async fn count_by_status(&self, status: SyncStatus) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_log WHERE sync_status = ?1")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_append_and_complete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let log = db.sync_log();

        let ok = log
            .append(SyncEntity::Transaction, "t-1", SyncOperation::Create, SyncStatus::Syncing)
            .await
            .unwrap();
        let bad = log
            .append(SyncEntity::Transaction, "t-2", SyncOperation::Create, SyncStatus::Syncing)
            .await
            .unwrap();
        log.complete(ok, None).await.unwrap();
        log.complete(bad, Some("HTTP 503")).await.unwrap();

        let entries = log.for_entity(SyncEntity::Transaction, "t-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sync_status, SyncStatus::Synced);
        assert!(entries[0].synced_at.is_some());

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent[0].entity_id, "t-2");
        assert_eq!(recent[0].error_message.as_deref(), Some("HTTP 503"));
        assert_eq!(recent[0].sync_status, SyncStatus::Failed);

        assert_eq!(log.count_by_status(SyncStatus::Failed).await.unwrap(), 1);
        assert!(log.complete(9999, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_append_synced_stamps_synced_at() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let log = db.sync_log();
        log.append(SyncEntity::Product, "p-1", SyncOperation::Update, SyncStatus::Synced)
            .await
            .unwrap();

        let entries = log.for_entity(SyncEntity::Product, "p-1").await.unwrap();
        assert_eq!(entries[0].operation, SyncOperation::Update);
        assert!(entries[0].synced_at.is_some());
    }
}
