//! # Product Repository
//!
//! The local product cache. The server owns product truth; this table
//! holds the last values pulled, plus two local-only effects:
//!
//! - offline sales decrement `stock_qty` (advisory, may go negative)
//! - an offline admin edit stamps `local_edit_at` until a pull overwrites it
//!
//! Every write that changes a row moves `last_synced_at` strictly forward
//! via [`LocalProduct::next_stamp`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use kasir_core::{LocalProduct, Money, ProductSnapshot};

/// Fields an offline admin edit may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductWrite {
    pub price: Money,
    pub stock_qty: i64,
    pub is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    barcode: String,
    name: String,
    price: i64,
    stock_qty: i64,
    category_id: Option<String>,
    category_name: Option<String>,
    is_active: bool,
    last_synced_at: DateTime<Utc>,
    local_edit_at: Option<DateTime<Utc>>,
}

impl From<ProductRow> for LocalProduct {
    fn from(row: ProductRow) -> Self {
        LocalProduct {
            id: row.id,
            barcode: row.barcode,
            name: row.name,
            price: Money::from_minor(row.price),
            stock_qty: row.stock_qty,
            category_id: row.category_id,
            category_name: row.category_name,
            is_active: row.is_active,
            last_synced_at: row.last_synced_at,
            local_edit_at: row.local_edit_at,
        }
    }
}

const SELECT_PRODUCT: &str = r#"
    SELECT id, barcode, name, price, stock_qty, category_id, category_name,
           is_active, last_synced_at, local_edit_at
    FROM products
"#;

/// Repository for the product cache.
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<LocalProduct>> {
        let row: Option<ProductRow> = sqlx::query_as(&format!("{SELECT_PRODUCT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(LocalProduct::from))
    }

    pub async fn get_by_barcode(&self, barcode: &str) -> DbResult<Option<LocalProduct>> {
        let row: Option<ProductRow> =
            sqlx::query_as(&format!("{SELECT_PRODUCT} WHERE barcode = ?1"))
                .bind(barcode)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(LocalProduct::from))
    }

    /// Active products ordered by name, for the sale screen.
    pub async fn list_active(&self) -> DbResult<Vec<LocalProduct>> {
        let rows: Vec<ProductRow> = sqlx::query_as(&format!(
            "{SELECT_PRODUCT} WHERE is_active = 1 ORDER BY name COLLATE NOCASE"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LocalProduct::from).collect())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Inserts a product seen for the first time.
    pub async fn insert(&self, product: &LocalProduct) -> DbResult<()> {
        debug!(id = %product.id, barcode = %product.barcode, "Inserting product");

        sqlx::query(
            r#"
            INSERT INTO products (
                id, barcode, name, price, stock_qty, category_id, category_name,
                is_active, last_synced_at, local_edit_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&product.id)
        .bind(&product.barcode)
        .bind(&product.name)
        .bind(product.price.minor())
        .bind(product.stock_qty)
        .bind(&product.category_id)
        .bind(&product.category_name)
        .bind(product.is_active)
        .bind(product.last_synced_at)
        .bind(product.local_edit_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrites a cached row with server values.
    ///
    /// Clears `local_edit_at`: once the server's values are applied there is
    /// no pending local edit left to protect.
    pub async fn apply_server_values(
        &self,
        snapshot: &ProductSnapshot,
        stamp: DateTime<Utc>,
    ) -> DbResult<()> {
        debug!(id = %snapshot.id, price = %snapshot.price, stock = snapshot.stock_qty, "Applying server values");

        let result = sqlx::query(
            r#"
            UPDATE products SET
                barcode = ?2,
                name = ?3,
                price = ?4,
                stock_qty = ?5,
                category_id = ?6,
                category_name = ?7,
                is_active = ?8,
                last_synced_at = ?9,
                local_edit_at = NULL
            WHERE id = ?1
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.barcode)
        .bind(&snapshot.name)
        .bind(snapshot.price.minor())
        .bind(snapshot.stock_qty)
        .bind(&snapshot.category_id)
        .bind(&snapshot.category_name)
        .bind(snapshot.is_active)
        .bind(stamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", &snapshot.id));
        }

        Ok(())
    }

    /// Records an offline admin edit of price, stock or active flag.
    ///
    /// Stamps both `last_synced_at` and `local_edit_at` with the same
    /// strictly increasing value and returns the updated product.
    pub async fn apply_local_edit(
        &self,
        id: &str,
        edit: ProductWrite,
        now: DateTime<Utc>,
    ) -> DbResult<LocalProduct> {
        if !edit.price.is_positive() {
            return Err(DbError::QueryFailed("price must be positive".to_string()));
        }
        if edit.stock_qty < 0 {
            return Err(DbError::QueryFailed("stock_qty must not be negative".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<ProductRow> = sqlx::query_as(&format!("{SELECT_PRODUCT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut product = row
            .map(LocalProduct::from)
            .ok_or_else(|| DbError::not_found("Product", id))?;

        let stamp = product.next_stamp(now);

        sqlx::query(
            r#"
            UPDATE products SET
                price = ?2,
                stock_qty = ?3,
                is_active = ?4,
                last_synced_at = ?5,
                local_edit_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(edit.price.minor())
        .bind(edit.stock_qty)
        .bind(edit.is_active)
        .bind(stamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(id = %id, stamp = %stamp, "Recorded local product edit");

        product.price = edit.price;
        product.stock_qty = edit.stock_qty;
        product.is_active = edit.is_active;
        product.last_synced_at = stamp;
        product.local_edit_at = Some(stamp);
        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;

    fn snapshot(id: &str, price: i64, stock: i64) -> ProductSnapshot {
        ProductSnapshot {
            id: id.to_string(),
            barcode: format!("899{id}"),
            name: format!("Product {id}"),
            price: Money::from_minor(price),
            stock_qty: stock,
            category_id: Some("c-1".to_string()),
            category_name: Some("Minuman".to_string()),
            is_active: true,
        }
    }

    async fn setup() -> ProductRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = setup().await;
        let now = Utc::now();
        let product = LocalProduct::new(snapshot("a", 10_000, 5), now).unwrap();
        repo.insert(&product).await.unwrap();

        let loaded = repo.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(loaded, product);

        let by_barcode = repo.get_by_barcode("899a").await.unwrap().unwrap();
        assert_eq!(by_barcode.id, "a");

        assert!(repo.get_by_id("missing").await.unwrap().is_none());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_barcode_rejected() {
        let repo = setup().await;
        let now = Utc::now();
        repo.insert(&LocalProduct::new(snapshot("a", 100, 1), now).unwrap())
            .await
            .unwrap();

        let mut dup = snapshot("b", 100, 1);
        dup.barcode = "899a".to_string();
        let err = repo
            .insert(&LocalProduct::new(dup, now).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_apply_server_values_clears_local_edit() {
        let repo = setup().await;
        let t0 = Utc::now();
        repo.insert(&LocalProduct::new(snapshot("a", 10_000, 5), t0).unwrap())
            .await
            .unwrap();

        let edited = repo
            .apply_local_edit(
                "a",
                ProductWrite {
                    price: Money::from_minor(11_000),
                    stock_qty: 5,
                    is_active: true,
                },
                t0,
            )
            .await
            .unwrap();
        assert!(edited.local_edit_at.is_some());
        assert!(edited.last_synced_at > t0);

        let stamp = edited.next_stamp(Utc::now());
        repo.apply_server_values(&snapshot("a", 12_000, 9), stamp)
            .await
            .unwrap();

        let loaded = repo.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(loaded.price, Money::from_minor(12_000));
        assert_eq!(loaded.stock_qty, 9);
        assert!(loaded.local_edit_at.is_none());
        assert_eq!(loaded.last_synced_at, stamp);
    }

    #[tokio::test]
    async fn test_local_edit_stamp_strictly_increases() {
        let repo = setup().await;
        let t0 = Utc::now();
        repo.insert(&LocalProduct::new(snapshot("a", 10_000, 5), t0).unwrap())
            .await
            .unwrap();

        let edit = ProductWrite {
            price: Money::from_minor(9_000),
            stock_qty: 4,
            is_active: true,
        };
        // Same wall-clock instant, then an earlier one
        let first = repo.apply_local_edit("a", edit, t0).await.unwrap();
        let second = repo
            .apply_local_edit("a", edit, t0 - Duration::seconds(10))
            .await
            .unwrap();

        assert!(first.last_synced_at > t0);
        assert!(second.last_synced_at > first.last_synced_at);
    }

    #[tokio::test]
    async fn test_local_edit_rejects_invalid_values() {
        let repo = setup().await;
        repo.insert(&LocalProduct::new(snapshot("a", 10_000, 5), Utc::now()).unwrap())
            .await
            .unwrap();
        let edit = ProductWrite {
            price: Money::zero(),
            stock_qty: 4,
            is_active: true,
        };
        assert!(repo.apply_local_edit("a", edit, Utc::now()).await.is_err());

        let negative_stock = ProductWrite {
            price: Money::from_minor(9_000),
            stock_qty: -1,
            is_active: true,
        };
        assert!(repo.apply_local_edit("a", negative_stock, Utc::now()).await.is_err());
        let untouched = repo.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(untouched.stock_qty, 5);
        assert!(untouched.local_edit_at.is_none());

        assert!(repo
            .apply_local_edit("missing", ProductWrite { price: Money::from_minor(1), ..edit }, Utc::now())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_list_active_skips_inactive() {
        let repo = setup().await;
        let now = Utc::now();
        repo.insert(&LocalProduct::new(snapshot("a", 100, 1), now).unwrap())
            .await
            .unwrap();
        let mut off = snapshot("b", 100, 1);
        off.is_active = false;
        repo.insert(&LocalProduct::new(off, now).unwrap()).await.unwrap();

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }
}
