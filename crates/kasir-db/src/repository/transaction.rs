//! # Transaction Repository
//!
//! Locally captured sales and their sync state.
//!
//! ## Guarded Status Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  mark_syncing   UPDATE … WHERE sync_status IN ('pending','failed')     │
//! │  mark_synced    UPDATE … WHERE sync_status = 'syncing'                 │
//! │  mark_failed    UPDATE … WHERE sync_status = 'syncing'                 │
//! │  recover_interrupted  'syncing' → 'failed' (startup only)              │
//! │                                                                         │
//! │  No statement ever moves a row out of 'synced'.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomic Writes
//! A sale is one SQLite transaction: header, every item, and the advisory
//! stock decrement of each product. Either all of it is visible or none.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use kasir_core::{
    advance_stamp, InvoiceNumber, LocalTransaction, LocalTransactionItem, Money, PaymentMethod,
    SyncStatus,
};

/// Number of local transactions in each sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
    pub conflict: i64,
}

impl StatusCounts {
    /// Everything the server has not confirmed yet.
    pub fn unsynced(&self) -> i64 {
        self.pending + self.syncing + self.failed
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    invoice_number: String,
    server_invoice_number: Option<String>,
    cashier_id: String,
    total_amount: i64,
    tax_amount: i64,
    amount_paid: i64,
    change_amount: i64,
    payment_method: PaymentMethod,
    created_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
    sync_status: SyncStatus,
    sync_error: Option<String>,
    sync_attempts: i64,
}

impl TransactionRow {
    fn into_transaction(self, items: Vec<LocalTransactionItem>) -> LocalTransaction {
        LocalTransaction {
            id: self.id,
            invoice_number: self.invoice_number,
            server_invoice_number: self.server_invoice_number,
            cashier_id: self.cashier_id,
            total_amount: Money::from_minor(self.total_amount),
            tax_amount: Money::from_minor(self.tax_amount),
            amount_paid: Money::from_minor(self.amount_paid),
            change: Money::from_minor(self.change_amount),
            payment_method: self.payment_method,
            created_at: self.created_at,
            synced_at: self.synced_at,
            sync_status: self.sync_status,
            sync_error: self.sync_error,
            sync_attempts: self.sync_attempts,
            items,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: String,
    product_id: String,
    product_name: String,
    quantity: i64,
    price_at_moment: i64,
    subtotal: i64,
}

impl From<ItemRow> for LocalTransactionItem {
    fn from(row: ItemRow) -> Self {
        LocalTransactionItem {
            id: row.id,
            product_id: row.product_id,
            product_name: row.product_name,
            quantity: row.quantity,
            price_at_moment: Money::from_minor(row.price_at_moment),
            subtotal: Money::from_minor(row.subtotal),
        }
    }
}

const SELECT_TRANSACTION: &str = r#"
    SELECT id, invoice_number, server_invoice_number, cashier_id,
           total_amount, tax_amount, amount_paid, change_amount, payment_method,
           created_at, synced_at, sync_status, sync_error, sync_attempts
    FROM transactions
"#;

/// Repository for local sales.
#[derive(Debug, Clone)]
pub struct TransactionRepository {
    pool: SqlitePool,
}

impl TransactionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TransactionRepository { pool }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persists an offline sale as `Pending`, atomically with its items and
    /// the stock decrement of every product sold.
    pub async fn insert_pending(&self, txn: &LocalTransaction) -> DbResult<()> {
        debug!(
            id = %txn.id,
            invoice_number = %txn.invoice_number,
            items = txn.items.len(),
            "Inserting pending transaction"
        );

        let mut tx = self.pool.begin().await?;
        insert_with_items(&mut *tx, txn, SyncStatus::Pending, None).await?;
        decrement_stock(&mut *tx, &txn.items).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Mirrors a sale the server already confirmed.
    ///
    /// Idempotent by id. The first call inserts the sale as `Synced` and
    /// applies the stock decrement; later calls only fill in
    /// `server_invoice_number`/`synced_at` if they are missing, so items and
    /// stock are never applied twice.
    ///
    /// Returns `true` when the row was newly inserted.
    pub async fn upsert_confirmed(
        &self,
        txn: &LocalTransaction,
        synced_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<SyncStatus> =
            sqlx::query_scalar("SELECT sync_status FROM transactions WHERE id = ?1")
                .bind(&txn.id)
                .fetch_optional(&mut *tx)
                .await?;

        let inserted = match existing {
            Some(status) => {
                debug!(id = %txn.id, status = %status, "Confirmed transaction already stored");
                sqlx::query(
                    r#"
                    UPDATE transactions SET
                        sync_status = 'synced',
                        synced_at = COALESCE(synced_at, ?2),
                        server_invoice_number = COALESCE(server_invoice_number, ?3),
                        sync_error = NULL
                    WHERE id = ?1
                    "#,
                )
                .bind(&txn.id)
                .bind(synced_at)
                .bind(&txn.server_invoice_number)
                .execute(&mut *tx)
                .await?;
                false
            }
            None => {
                insert_with_items(&mut *tx, txn, SyncStatus::Synced, Some(synced_at)).await?;
                decrement_stock(&mut *tx, &txn.items).await?;
                true
            }
        };

        tx.commit().await?;
        Ok(inserted)
    }

    /// Claims a transaction for a push attempt.
    ///
    /// Returns `false` when the row is no longer `Pending`/`Failed`
    /// (someone else synced it, or it never existed).
    pub async fn mark_syncing(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET sync_status = 'syncing'
            WHERE id = ?1 AND sync_status IN ('pending', 'failed')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `Syncing → Synced`. Clears the last error.
    pub async fn mark_synced(
        &self,
        id: &str,
        server_invoice_number: Option<&str>,
        synced_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                sync_status = 'synced',
                synced_at = ?2,
                server_invoice_number = ?3,
                sync_error = NULL
            WHERE id = ?1 AND sync_status = 'syncing'
            "#,
        )
        .bind(id)
        .bind(synced_at)
        .bind(server_invoice_number)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Transaction (syncing)", id));
        }

        debug!(id = %id, "Transaction marked synced");
        Ok(())
    }

    /// `Syncing → Failed`. Records the reason and counts the attempt.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                sync_status = 'failed',
                sync_error = ?2,
                sync_attempts = sync_attempts + 1
            WHERE id = ?1 AND sync_status = 'syncing'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Transaction (syncing)", id));
        }

        debug!(id = %id, error = %error, "Transaction marked failed");
        Ok(())
    }

    /// Moves rows left in `Syncing` by a crash back to `Failed`.
    ///
    /// Call once at startup, before the first push cycle.
    pub async fn recover_interrupted(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                sync_status = 'failed',
                sync_error = 'interrupted'
            WHERE sync_status = 'syncing'
            "#,
        )
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(count = recovered, "Recovered transactions interrupted mid-sync");
        }
        Ok(recovered)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: &str) -> DbResult<Option<LocalTransaction>> {
        let mut conn = self.pool.acquire().await?;

        let row: Option<TransactionRow> =
            sqlx::query_as(&format!("{SELECT_TRANSACTION} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;

        match row {
            Some(row) => {
                let items = load_items(&mut *conn, &row.id).await?;
                Ok(Some(row.into_transaction(items)))
            }
            None => Ok(None),
        }
    }

    /// Everything a push cycle should send, oldest first.
    ///
    /// `rowid` breaks ties between sales created within the same instant.
    pub async fn list_pending(&self) -> DbResult<Vec<LocalTransaction>> {
        let mut conn = self.pool.acquire().await?;

        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "{SELECT_TRANSACTION} WHERE sync_status IN ('pending', 'failed') ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(&mut *conn)
        .await?;

        with_items(&mut *conn, rows).await
    }

    /// Sales history, newest first. `page` is 1-based.
    pub async fn list_recent(&self, page: u32, page_size: u32) -> DbResult<Vec<LocalTransaction>> {
        let page = page.max(1);
        let offset = (page as i64 - 1) * page_size as i64;
        let mut conn = self.pool.acquire().await?;

        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "{SELECT_TRANSACTION} ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;

        with_items(&mut *conn, rows).await
    }

    /// Number of sales the server has not confirmed yet.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE sync_status IN ('pending', 'syncing', 'failed')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_failed(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE sync_status = 'failed'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn counts_by_status(&self) -> DbResult<StatusCounts> {
        let rows: Vec<(SyncStatus, i64)> = sqlx::query_as(
            "SELECT sync_status, COUNT(*) FROM transactions GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status {
                SyncStatus::Pending => counts.pending = n,
                SyncStatus::Syncing => counts.syncing = n,
                SyncStatus::Synced => counts.synced = n,
                SyncStatus::Failed => counts.failed = n,
                SyncStatus::Conflict => counts.conflict = n,
            }
        }
        Ok(counts)
    }

    /// Highest invoice number already issued on `date`, if any.
    pub async fn last_invoice_for(&self, date: NaiveDate) -> DbResult<Option<InvoiceNumber>> {
        let prefix = InvoiceNumber::day_prefix(date);

        let last: Option<String> = sqlx::query_scalar(
            r#"
            SELECT invoice_number FROM transactions
            WHERE substr(invoice_number, 1, length(?1)) = ?1
            ORDER BY invoice_number DESC
            LIMIT 1
            "#,
        )
        .bind(&prefix)
        .fetch_optional(&self.pool)
        .await?;

        match last {
            Some(raw) => raw
                .parse::<InvoiceNumber>()
                .map(Some)
                .map_err(|e| DbError::Internal(format!("stored invoice {raw}: {e}"))),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Helpers (run inside a caller's transaction)
// =============================================================================

async fn insert_with_items(
    conn: &mut SqliteConnection,
    txn: &LocalTransaction,
    status: SyncStatus,
    synced_at: Option<DateTime<Utc>>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, invoice_number, server_invoice_number, cashier_id,
            total_amount, tax_amount, amount_paid, change_amount, payment_method,
            created_at, synced_at, sync_status, sync_error, sync_attempts
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, 0)
        "#,
    )
    .bind(&txn.id)
    .bind(&txn.invoice_number)
    .bind(&txn.server_invoice_number)
    .bind(&txn.cashier_id)
    .bind(txn.total_amount.minor())
    .bind(txn.tax_amount.minor())
    .bind(txn.amount_paid.minor())
    .bind(txn.change.minor())
    .bind(txn.payment_method)
    .bind(txn.created_at)
    .bind(synced_at)
    .bind(status)
    .execute(&mut *conn)
    .await?;

    for item in &txn.items {
        sqlx::query(
            r#"
            INSERT INTO transaction_items (
                id, transaction_id, product_id, product_name,
                quantity, price_at_moment, subtotal
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&item.id)
        .bind(&txn.id)
        .bind(&item.product_id)
        .bind(&item.product_name)
        .bind(item.quantity)
        .bind(item.price_at_moment.minor())
        .bind(item.subtotal.minor())
        .execute(&mut *conn)
        .await?;
    }

    info!(
        id = %txn.id,
        invoice_number = %txn.invoice_number,
        status = %status,
        total = %txn.total_amount,
        "Transaction stored"
    );
    Ok(())
}

/// Advisory decrement. A product missing from the cache is skipped; stock
/// may go negative when registers oversell offline. The decrement is a
/// product write, so `last_synced_at` moves forward with it.
async fn decrement_stock(conn: &mut SqliteConnection, items: &[LocalTransactionItem]) -> DbResult<()> {
    for item in items {
        let last: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_synced_at FROM products WHERE id = ?1")
                .bind(&item.product_id)
                .fetch_optional(&mut *conn)
                .await?;
        let Some(last) = last else {
            debug!(product_id = %item.product_id, "Sold product not in cache, stock untouched");
            continue;
        };

        sqlx::query("UPDATE products SET stock_qty = stock_qty - ?2, last_synced_at = ?3 WHERE id = ?1")
            .bind(&item.product_id)
            .bind(item.quantity)
            .bind(advance_stamp(last, Utc::now()))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn load_items(
    conn: &mut SqliteConnection,
    transaction_id: &str,
) -> DbResult<Vec<LocalTransactionItem>> {
    let rows: Vec<ItemRow> = sqlx::query_as(
        r#"
        SELECT id, product_id, product_name, quantity, price_at_moment, subtotal
        FROM transaction_items
        WHERE transaction_id = ?1
        ORDER BY rowid ASC
        "#,
    )
    .bind(transaction_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(LocalTransactionItem::from).collect())
}

async fn with_items(
    conn: &mut SqliteConnection,
    rows: Vec<TransactionRow>,
) -> DbResult<Vec<LocalTransaction>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let items = load_items(conn, &row.id).await?;
        out.push(row.into_transaction(items));
    }
    Ok(out)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::{Duration, TimeZone};
    use kasir_core::{LocalProduct, ProductSnapshot};

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        for (id, price) in [("a", 10_000), ("b", 5_000)] {
            let product = LocalProduct::new(
                ProductSnapshot {
                    id: id.to_string(),
                    barcode: format!("899{id}"),
                    name: format!("Product {id}"),
                    price: Money::from_minor(price),
                    stock_qty: 10,
                    category_id: None,
                    category_name: None,
                    is_active: true,
                },
                Utc::now(),
            )
            .unwrap();
            db.products().insert(&product).await.unwrap();
        }
        db
    }

    fn item(product_id: &str, qty: i64, price: i64) -> LocalTransactionItem {
        LocalTransactionItem {
            id: uuid::Uuid::new_v4().to_string(),
            product_id: product_id.to_string(),
            product_name: format!("Product {product_id}"),
            quantity: qty,
            price_at_moment: Money::from_minor(price),
            subtotal: Money::from_minor(price * qty),
        }
    }

    fn txn(seq: u32, created_at: DateTime<Utc>) -> LocalTransaction {
        let items = vec![item("a", 2, 10_000), item("b", 1, 5_000)];
        let date = created_at.date_naive();
        LocalTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_number: InvoiceNumber::new(date, seq).unwrap().to_string(),
            server_invoice_number: None,
            cashier_id: "cashier-1".to_string(),
            total_amount: Money::from_minor(25_000),
            tax_amount: Money::zero(),
            amount_paid: Money::from_minor(30_000),
            change: Money::from_minor(5_000),
            payment_method: PaymentMethod::Cash,
            created_at,
            synced_at: None,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            sync_attempts: 0,
            items,
        }
    }

    #[tokio::test]
    async fn test_insert_pending_round_trip() {
        let db = setup().await;
        let repo = db.transactions();
        let t = txn(1, Utc::now());
        repo.insert_pending(&t).await.unwrap();

        let loaded = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded, t);
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.subtotal(), Money::from_minor(25_000));

        // Stock decremented in the same write
        let a = db.products().get_by_id("a").await.unwrap().unwrap();
        let b = db.products().get_by_id("b").await.unwrap().unwrap();
        assert_eq!(a.stock_qty, 8);
        assert_eq!(b.stock_qty, 9);

        assert_eq!(repo.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stock_decrement_advances_product_stamp() {
        let db = setup().await;
        let before = db.products().get_by_id("a").await.unwrap().unwrap();

        db.transactions().insert_pending(&txn(1, Utc::now())).await.unwrap();

        let after = db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(after.stock_qty, before.stock_qty - 2);
        assert!(after.last_synced_at > before.last_synced_at);
    }

    #[tokio::test]
    async fn test_stock_decrement_stamp_survives_clock_behind() {
        let db = setup().await;
        let ahead = Utc::now() + Duration::hours(1);
        sqlx::query("UPDATE products SET last_synced_at = ?1 WHERE id = 'a'")
            .bind(ahead)
            .execute(db.pool())
            .await
            .unwrap();

        db.transactions().insert_pending(&txn(1, Utc::now())).await.unwrap();

        let a = db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(a.last_synced_at, ahead + Duration::milliseconds(1));
    }

    #[tokio::test]
    async fn test_insert_is_atomic() {
        let db = setup().await;
        let repo = db.transactions();
        let mut t = txn(1, Utc::now());
        // Second item violates CHECK (quantity > 0) after the header is written
        t.items[1].quantity = 0;

        assert!(repo.insert_pending(&t).await.is_err());
        assert!(repo.get(&t.id).await.unwrap().is_none());
        assert_eq!(repo.count_pending().await.unwrap(), 0);

        let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transaction_items")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(items, 0);
        let a = db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(a.stock_qty, 10);
    }

    #[tokio::test]
    async fn test_duplicate_invoice_rejected() {
        let db = setup().await;
        let repo = db.transactions();
        let now = Utc::now();
        repo.insert_pending(&txn(1, now)).await.unwrap();
        let err = repo.insert_pending(&txn(1, now)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_status_transitions_are_guarded() {
        let db = setup().await;
        let repo = db.transactions();
        let t = txn(1, Utc::now());
        repo.insert_pending(&t).await.unwrap();

        // Pending cannot jump straight to Synced
        assert!(repo.mark_synced(&t.id, None, Utc::now()).await.is_err());

        assert!(repo.mark_syncing(&t.id).await.unwrap());
        // Already claimed
        assert!(!repo.mark_syncing(&t.id).await.unwrap());

        repo.mark_failed(&t.id, "timeout").await.unwrap();
        let failed = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.sync_error.as_deref(), Some("timeout"));
        assert_eq!(failed.sync_attempts, 1);

        assert!(repo.mark_syncing(&t.id).await.unwrap());
        let now = Utc::now();
        repo.mark_synced(&t.id, Some("INV-SRV-1"), now).await.unwrap();

        let synced = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.synced_at, Some(now));
        assert!(synced.sync_error.is_none());
        assert_eq!(synced.server_invoice_number.as_deref(), Some("INV-SRV-1"));
        assert_eq!(synced.invoice_number, t.invoice_number);

        // Synced is terminal
        assert!(!repo.mark_syncing(&t.id).await.unwrap());
        assert!(repo.mark_failed(&t.id, "late").await.is_err());
        assert_eq!(repo.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_pending_order_and_filter() {
        let db = setup().await;
        let repo = db.transactions();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();

        let t3 = txn(3, base + Duration::minutes(2));
        let t1 = txn(1, base);
        let t2 = txn(2, base + Duration::minutes(1));
        for t in [&t3, &t1, &t2] {
            repo.insert_pending(t).await.unwrap();
        }

        // t2 synced, t3 failed
        repo.mark_syncing(&t2.id).await.unwrap();
        repo.mark_synced(&t2.id, None, Utc::now()).await.unwrap();
        repo.mark_syncing(&t3.id).await.unwrap();
        repo.mark_failed(&t3.id, "boom").await.unwrap();

        let pending = repo.list_pending().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![t1.id.as_str(), t3.id.as_str()]);
        assert!(pending.iter().all(|t| t.items.len() == 2));

        let counts = repo.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.unsynced(), 2);
        assert_eq!(repo.count_failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_instant_keeps_insert_order() {
        let db = setup().await;
        let repo = db.transactions();
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let first = txn(1, at);
        let second = txn(2, at);
        repo.insert_pending(&first).await.unwrap();
        repo.insert_pending(&second).await.unwrap();

        let pending = repo.list_pending().await.unwrap();
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let db = setup().await;
        let repo = db.transactions();
        let t = txn(1, Utc::now());
        repo.insert_pending(&t).await.unwrap();
        repo.mark_syncing(&t.id).await.unwrap();

        assert_eq!(repo.recover_interrupted().await.unwrap(), 1);
        let loaded = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Failed);
        assert_eq!(loaded.sync_error.as_deref(), Some("interrupted"));
        assert_eq!(repo.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_confirmed_is_idempotent() {
        let db = setup().await;
        let repo = db.transactions();
        let mut t = txn(1, Utc::now());
        t.server_invoice_number = Some("INV-20250301-0100".to_string());
        let at = Utc::now();

        assert!(repo.upsert_confirmed(&t, at).await.unwrap());
        assert!(!repo.upsert_confirmed(&t, at + Duration::seconds(5)).await.unwrap());

        let loaded = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert_eq!(loaded.synced_at, Some(at));
        assert_eq!(loaded.items.len(), 2);

        // Stock applied exactly once
        let a = db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(a.stock_qty, 8);
        assert_eq!(repo.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_confirmed_over_pending_row() {
        let db = setup().await;
        let repo = db.transactions();
        let mut t = txn(1, Utc::now());
        repo.insert_pending(&t).await.unwrap();

        t.server_invoice_number = Some("INV-SRV".to_string());
        assert!(!repo.upsert_confirmed(&t, Utc::now()).await.unwrap());

        let loaded = repo.get(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert_eq!(loaded.server_invoice_number.as_deref(), Some("INV-SRV"));
        let a = db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(a.stock_qty, 8);
    }

    #[tokio::test]
    async fn test_last_invoice_for_day() {
        let db = setup().await;
        let repo = db.transactions();
        let day1 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap();

        assert!(repo.last_invoice_for(day1.date_naive()).await.unwrap().is_none());

        for seq in [1, 2, 10] {
            repo.insert_pending(&txn(seq, day1)).await.unwrap();
        }
        repo.insert_pending(&txn(1, day2)).await.unwrap();

        let last = repo.last_invoice_for(day1.date_naive()).await.unwrap().unwrap();
        assert_eq!(last.sequence(), 10);
        let last = repo.last_invoice_for(day2.date_naive()).await.unwrap().unwrap();
        assert_eq!(last.sequence(), 1);
    }

    #[tokio::test]
    async fn test_list_recent_pages_newest_first() {
        let db = setup().await;
        let repo = db.transactions();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut ids = Vec::new();
        for seq in 1..=5 {
            let t = txn(seq, base + Duration::minutes(seq as i64));
            ids.push(t.id.clone());
            repo.insert_pending(&t).await.unwrap();
        }

        let page1 = repo.list_recent(1, 2).await.unwrap();
        assert_eq!(page1[0].id, ids[4]);
        assert_eq!(page1[1].id, ids[3]);
        let page3 = repo.list_recent(3, 2).await.unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].id, ids[0]);
    }
}
