//! # Sale Processor
//!
//! Validates a sale against the local product cache, then commits it
//! either through the server (online) or straight to the local store
//! (offline).
//!
//! ```text
//! SaleRequest
//!     │
//!     ▼
//! validate shape ─► per line: exists → active → stock ─► totals ─► tender
//!     │                                                            │
//!     │                   any violation: Err, nothing written ◄────┘
//!     ▼
//! invoice = last local sequence today + 1
//!     │
//!     ├── online ──► POST /transactions ──ok──► upsert_confirmed (Synced)
//!     │                     │
//!     │                     └─ error ──┐
//!     ▼                                ▼
//!     └── offline ───────────────► insert_pending (Pending)
//! ```
//!
//! Sales on one processor are serialized, so two sales can never draw the
//! same invoice number.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use kasir_core::validation::validate_sale_request;
use kasir_core::{
    change_due, InvoiceNumber, LocalProduct, LocalTransaction, LocalTransactionItem, Money, SaleRequest,
    SaleTotals, SyncStatus, TaxRate,
};
use kasir_db::Database;

use crate::api::{CreateTransactionRequest, PosApi};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SaleError, SaleResult};
use crate::session::SessionProvider;

/// A committed sale.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleReceipt {
    pub transaction: LocalTransaction,
    pub change: Money,
}

impl SaleReceipt {
    /// Whether the server confirmed the sale before it was stored.
    pub fn is_synced(&self) -> bool {
        self.transaction.sync_status == SyncStatus::Synced
    }
}

/// Flat result shape handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SaleOutcome {
    pub success: bool,
    pub transaction: Option<LocalTransaction>,
    pub change: Money,
    pub error: Option<String>,
}

impl From<SaleResult<SaleReceipt>> for SaleOutcome {
    fn from(result: SaleResult<SaleReceipt>) -> Self {
        match result {
            Ok(receipt) => SaleOutcome {
                success: true,
                transaction: Some(receipt.transaction),
                change: receipt.change,
                error: None,
            },
            Err(e) => SaleOutcome {
                success: false,
                transaction: None,
                change: Money::zero(),
                error: Some(e.to_string()),
            },
        }
    }
}

pub struct SaleProcessor {
    db: Arc<Database>,
    api: Arc<dyn PosApi>,
    monitor: ConnectivityMonitor,
    session: Arc<dyn SessionProvider>,
    tax_rate: TaxRate,
    /// Held from invoice generation until the sale is stored.
    serial: Mutex<()>,
}

impl SaleProcessor {
    pub fn new(
        db: Arc<Database>,
        api: Arc<dyn PosApi>,
        monitor: ConnectivityMonitor,
        session: Arc<dyn SessionProvider>,
        tax_rate: TaxRate,
    ) -> Self {
        SaleProcessor {
            db,
            api,
            monitor,
            session,
            tax_rate,
            serial: Mutex::new(()),
        }
    }

    pub async fn process_sale(&self, request: SaleRequest) -> SaleResult<SaleReceipt> {
        validate_sale_request(&request)?;

        let _serial = self.serial.lock().await;

        let items = self.build_items(&request).await?;
        let totals = SaleTotals::from_items(&items, self.tax_rate)?;

        let amount_paid = if request.payment_method.requires_tender() {
            if request.amount_paid < totals.total {
                return Err(SaleError::InsufficientPayment {
                    total: totals.total,
                    paid: request.amount_paid,
                });
            }
            request.amount_paid
        } else {
            totals.total
        };
        let change = change_due(request.payment_method, amount_paid, totals.total);

        let created_at = Utc::now();
        let invoice_date = created_at.with_timezone(&Local).date_naive();
        let last = self.db.transactions().last_invoice_for(invoice_date).await?;
        let invoice = InvoiceNumber::next_after(invoice_date, last.as_ref())?;

        let mut txn = LocalTransaction {
            id: Uuid::new_v4().to_string(),
            invoice_number: invoice.to_string(),
            server_invoice_number: None,
            cashier_id: self.cashier_id(),
            total_amount: totals.total,
            tax_amount: totals.tax,
            amount_paid,
            change,
            payment_method: request.payment_method,
            created_at,
            synced_at: None,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            sync_attempts: 0,
            items,
        };

        if self.monitor.is_online() {
            match self.commit_online(&mut txn).await {
                Ok(()) => return Ok(SaleReceipt { transaction: txn, change }),
                Err(reason) => {
                    warn!(id = %txn.id, error = %reason, "Online sale failed, storing offline");
                }
            }
        }

        self.db.transactions().insert_pending(&txn).await?;
        info!(
            id = %txn.id,
            invoice_number = %txn.invoice_number,
            total = %txn.total_amount,
            "Sale stored offline"
        );

        Ok(SaleReceipt { transaction: txn, change })
    }

    /// Resolves every line against the cache. Stock is checked against the
    /// running total per product so split lines cannot oversell.
    async fn build_items(&self, request: &SaleRequest) -> SaleResult<Vec<LocalTransactionItem>> {
        let products = self.db.products();
        let mut cache: HashMap<String, LocalProduct> = HashMap::new();
        let mut requested: HashMap<String, i64> = HashMap::new();
        let mut items = Vec::with_capacity(request.items.len());

        for line in &request.items {
            let product = match cache.get(&line.product_id) {
                Some(product) => product.clone(),
                None => {
                    let product = products
                        .get_by_id(&line.product_id)
                        .await?
                        .ok_or_else(|| SaleError::ProductNotFound(line.product_id.clone()))?;
                    cache.insert(product.id.clone(), product.clone());
                    product
                }
            };

            if !product.is_active {
                return Err(SaleError::ProductInactive(product.id));
            }

            let total_qty = requested.entry(product.id.clone()).or_insert(0);
            *total_qty += line.quantity;
            if !product.has_stock_for(*total_qty) {
                return Err(SaleError::InsufficientStock {
                    product_id: product.id,
                    available: product.stock_qty,
                    requested: *total_qty,
                });
            }

            items.push(LocalTransactionItem::new(&product, line.quantity)?);
        }

        Ok(items)
    }

    /// Sends the sale and mirrors the confirmation. `Err` means the server
    /// did not accept it and the caller should store it offline.
    async fn commit_online(&self, txn: &mut LocalTransaction) -> Result<(), String> {
        let mut request = CreateTransactionRequest::from(&*txn);
        request.amount_paid = txn.amount_paid;

        let outcome = self
            .api
            .create_transaction(&request)
            .await
            .map_err(|e| e.to_string())?;

        let synced_at = Utc::now();
        txn.server_invoice_number = outcome.server_invoice_number().map(str::to_string);
        txn.sync_status = SyncStatus::Synced;
        txn.synced_at = Some(synced_at);

        match self.db.transactions().upsert_confirmed(txn, synced_at).await {
            Ok(_) => debug!(id = %txn.id, "Confirmed sale mirrored locally"),
            Err(e) => error!(
                id = %txn.id,
                invoice_number = %txn.invoice_number,
                error = %e,
                "Sale confirmed by server but local mirror failed"
            ),
        }

        info!(
            id = %txn.id,
            invoice_number = %txn.invoice_number,
            server_invoice_number = ?txn.server_invoice_number,
            "Sale confirmed online"
        );
        Ok(())
    }

    fn cashier_id(&self) -> String {
        self.session.cashier_id().unwrap_or_else(|| {
            debug!("No cashier signed in, recording sale anonymously");
            Uuid::nil().to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivitySettings;
    use crate::error::ApiError;
    use crate::events::EventHub;
    use crate::session::{Session, SessionStore};
    use crate::testing::ScriptedApi;
    use kasir_core::{PaymentMethod, ProductSnapshot, SaleLine};
    use kasir_db::DbConfig;

    struct Fixture {
        db: Arc<Database>,
        api: Arc<ScriptedApi>,
        monitor: ConnectivityMonitor,
        processor: SaleProcessor,
    }

    async fn fixture(online: bool, tax_bps: u32) -> Fixture {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let now = Utc::now();
        for (id, price, stock, active) in [
            ("a", 10_000, 10, true),
            ("b", 5_000, 3, true),
            ("off", 7_000, 10, false),
        ] {
            let product = LocalProduct::new(
                ProductSnapshot {
                    id: id.into(),
                    barcode: format!("899{id}"),
                    name: format!("Product {id}"),
                    price: Money::from_minor(price),
                    stock_qty: stock,
                    category_id: None,
                    category_name: None,
                    is_active: active,
                },
                now,
            )
            .unwrap();
            db.products().insert(&product).await.unwrap();
        }

        let api = Arc::new(ScriptedApi::new());
        api.set_healthy(online);
        let events = Arc::new(EventHub::new());
        let session = Arc::new(SessionStore::new(events.clone()));
        session.sign_in(Session {
            token: "tok".into(),
            cashier_id: "cashier-1".into(),
        });
        let monitor = ConnectivityMonitor::new(api.clone(), ConnectivitySettings::default(), events);
        monitor.probe_now().await;

        let processor = SaleProcessor::new(
            db.clone(),
            api.clone(),
            monitor.clone(),
            session,
            TaxRate::from_bps(tax_bps),
        );
        Fixture {
            db,
            api,
            monitor,
            processor,
        }
    }

    fn sale(lines: &[(&str, i64)], method: PaymentMethod, paid: i64) -> SaleRequest {
        SaleRequest {
            items: lines
                .iter()
                .map(|(id, qty)| SaleLine {
                    product_id: id.to_string(),
                    quantity: *qty,
                })
                .collect(),
            payment_method: method,
            amount_paid: Money::from_minor(paid),
        }
    }

    #[tokio::test]
    async fn test_offline_sale_is_pending() {
        let f = fixture(false, 0).await;

        let receipt = f
            .processor
            .process_sale(sale(&[("a", 2), ("b", 1)], PaymentMethod::Cash, 30_000))
            .await
            .unwrap();

        assert_eq!(receipt.change, Money::from_minor(5_000));
        assert!(!receipt.is_synced());

        let stored = f.db.transactions().get(&receipt.transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.total_amount, Money::from_minor(25_000));
        assert_eq!(stored.amount_paid, Money::from_minor(30_000));
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.cashier_id, "cashier-1");
        assert!(stored.invoice_number.parse::<InvoiceNumber>().is_ok());

        let a = f.db.products().get_by_id("a").await.unwrap().unwrap();
        assert_eq!(a.stock_qty, 8);
        assert!(f.api.created().is_empty());
    }

    #[tokio::test]
    async fn test_invoice_sequence_increments() {
        let f = fixture(false, 0).await;

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let receipt = f
                .processor
                .process_sale(sale(&[("a", 1)], PaymentMethod::Qris, 0))
                .await
                .unwrap();
            let invoice: InvoiceNumber = receipt.transaction.invoice_number.parse().unwrap();
            sequences.push(invoice.sequence());
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_online_sale_is_synced_with_real_tender() {
        let f = fixture(true, 0).await;
        assert!(f.monitor.is_online());

        let receipt = f
            .processor
            .process_sale(sale(&[("a", 1)], PaymentMethod::Cash, 20_000))
            .await
            .unwrap();
        assert!(receipt.is_synced());
        assert_eq!(receipt.change, Money::from_minor(10_000));

        let sent = f.api.created();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, receipt.transaction.id);
        assert_eq!(sent[0].amount_paid, Money::from_minor(20_000));

        let stored = f.db.transactions().get(&receipt.transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.synced_at.is_some());
        assert_eq!(
            stored.server_invoice_number,
            Some(format!("SRV-{}", stored.invoice_number))
        );
        assert_eq!(f.db.products().get_by_id("a").await.unwrap().unwrap().stock_qty, 9);
    }

    #[tokio::test]
    async fn test_online_failure_falls_back_with_same_id() {
        let f = fixture(true, 0).await;
        f.api.script_create(Err(ApiError::Timeout));

        let receipt = f
            .processor
            .process_sale(sale(&[("b", 1)], PaymentMethod::Card, 0))
            .await
            .unwrap();

        assert_eq!(receipt.transaction.sync_status, SyncStatus::Pending);
        assert_eq!(receipt.change, Money::zero());
        let stored = f.db.transactions().get(&receipt.transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.amount_paid, Money::from_minor(5_000));
    }

    #[tokio::test]
    async fn test_validation_errors_write_nothing() {
        let f = fixture(false, 0).await;

        let cases = [
            (sale(&[("missing", 1)], PaymentMethod::Cash, 100_000), SaleError::ProductNotFound("missing".into())),
            (sale(&[("off", 1)], PaymentMethod::Cash, 100_000), SaleError::ProductInactive("off".into())),
            (
                sale(&[("b", 2), ("b", 2)], PaymentMethod::Cash, 100_000),
                SaleError::InsufficientStock {
                    product_id: "b".into(),
                    available: 3,
                    requested: 4,
                },
            ),
            (
                sale(&[("a", 1)], PaymentMethod::Cash, 9_999),
                SaleError::InsufficientPayment {
                    total: Money::from_minor(10_000),
                    paid: Money::from_minor(9_999),
                },
            ),
        ];

        for (request, expected) in cases {
            assert_eq!(f.processor.process_sale(request).await.unwrap_err(), expected);
        }

        assert!(matches!(
            f.processor.process_sale(sale(&[], PaymentMethod::Cash, 0)).await,
            Err(SaleError::Validation(_))
        ));
        assert!(matches!(
            f.processor.process_sale(sale(&[("a", 0)], PaymentMethod::Cash, 0)).await,
            Err(SaleError::Validation(_))
        ));

        assert_eq!(f.db.transactions().count_pending().await.unwrap(), 0);
        assert_eq!(f.db.products().get_by_id("b").await.unwrap().unwrap().stock_qty, 3);
    }

    #[tokio::test]
    async fn test_total_overflow_rejected() {
        let f = fixture(false, 0).await;
        let big = LocalProduct::new(
            ProductSnapshot {
                id: "big".into(),
                barcode: "899big".into(),
                name: "Product big".into(),
                price: Money::from_minor(i64::MAX / 2 + 1),
                stock_qty: 10,
                category_id: None,
                category_name: None,
                is_active: true,
            },
            Utc::now(),
        )
        .unwrap();
        f.db.products().insert(&big).await.unwrap();

        let err = f
            .processor
            .process_sale(sale(&[("big", 1), ("big", 1)], PaymentMethod::Cash, i64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, SaleError::Validation(_)));

        assert_eq!(f.db.transactions().count_pending().await.unwrap(), 0);
        assert_eq!(f.db.products().get_by_id("big").await.unwrap().unwrap().stock_qty, 10);
    }

    #[tokio::test]
    async fn test_tax_applied_to_total() {
        let f = fixture(false, 1_100).await;

        let receipt = f
            .processor
            .process_sale(sale(&[("a", 1)], PaymentMethod::Cash, 11_100))
            .await
            .unwrap();
        assert_eq!(receipt.transaction.tax_amount, Money::from_minor(1_100));
        assert_eq!(receipt.transaction.total_amount, Money::from_minor(11_100));
        assert_eq!(receipt.change, Money::zero());
    }

    #[tokio::test]
    async fn test_outcome_shape() {
        let f = fixture(false, 0).await;

        let ok = SaleOutcome::from(
            f.processor
                .process_sale(sale(&[("a", 1)], PaymentMethod::Cash, 15_000))
                .await,
        );
        assert!(ok.success);
        assert_eq!(ok.change, Money::from_minor(5_000));
        assert!(ok.error.is_none());

        let err = SaleOutcome::from(
            f.processor
                .process_sale(sale(&[("missing", 1)], PaymentMethod::Cash, 15_000))
                .await,
        );
        assert!(!err.success);
        assert!(err.transaction.is_none());
        assert_eq!(err.error.as_deref(), Some("Product not found: missing"));
    }
}
