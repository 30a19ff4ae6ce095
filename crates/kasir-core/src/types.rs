//! # Domain Types
//!
//! Local sync entities used throughout Kasir POS.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │ LocalTransaction │  │  LocalProduct    │  │  SyncLogEntry    │      │
//! │  │ ──────────────── │  │ ──────────────── │  │ ──────────────── │      │
//! │  │ id (UUID, key)   │  │ id (server)      │  │ entity_type      │      │
//! │  │ invoice_number   │  │ barcode (unique) │  │ entity_id        │      │
//! │  │ sync_status      │  │ price, stock_qty │  │ operation        │      │
//! │  │ items[]          │  │ last_synced_at   │  │ sync_status      │      │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘      │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐      │
//! │  │   SyncStatus     │  │  PaymentMethod   │  │    JobStatus     │      │
//! │  │ Pending/Syncing/ │  │ Cash/Qris/Card   │  │ Pending/Retrying │      │
//! │  │ Synced/Failed/   │  │                  │  │ Completed/Failed │      │
//! │  │ Conflict         │  │                  │  │                  │      │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transaction Sync Lifecycle
//! ```text
//!  Pending ──► Syncing ──► Synced   (terminal, read-only mirror)
//!                 │
//!                 └──────► Failed ──► Syncing (retry)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::money::Money;

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// 1 basis point = 0.01%, so 1100 bps = 11%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }

    /// Checks if tax rate is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Payment Method
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Physical cash payment. The only method that yields change.
    Cash,
    /// QR code payment.
    Qris,
    /// Card payment on an external terminal.
    Card,
}

impl PaymentMethod {
    /// Whether the tendered amount must cover the total.
    pub fn requires_tender(&self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Cash => write!(f, "cash"),
            PaymentMethod::Qris => write!(f, "qris"),
            PaymentMethod::Card => write!(f, "card"),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "qris" => Ok(PaymentMethod::Qris),
            "card" => Ok(PaymentMethod::Card),
            _ => Err(ValidationError::NotAllowed {
                field: "payment_method".to_string(),
                allowed: vec!["cash".into(), "qris".into(), "card".into()],
            }),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Lifecycle state of a locally queued record.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written locally, never sent.
    #[default]
    Pending,
    /// Claimed by a push cycle.
    Syncing,
    /// Confirmed by the server. Terminal.
    Synced,
    /// Last push attempt failed; eligible for retry.
    Failed,
    /// Reserved for server-side divergence. Push never produces it.
    Conflict,
}

impl SyncStatus {
    /// Whether `self → next` is a legal lifecycle transition.
    ///
    /// ```text
    /// Pending → Syncing
    /// Failed  → Syncing
    /// Syncing → Synced | Failed
    /// ```
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Failed, Syncing) | (Syncing, Synced) | (Syncing, Failed)
        )
    }

    /// Whether a push cycle should pick this record up.
    pub fn is_pushable(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Log
// =============================================================================

/// What a sync log entry is about.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncEntity {
    Transaction,
    Product,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Audit record of one sync attempt. Diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub entity_type: SyncEntity,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub sync_status: SyncStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

// =============================================================================
// Local Product
// =============================================================================

/// Product values as the server states them.
///
/// Input to [`LocalProduct::new`] and to pull-time comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub id: String,
    pub barcode: String,
    pub name: String,
    pub price: Money,
    pub stock_qty: i64,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub is_active: bool,
}

impl ProductSnapshot {
    /// Rejects values the local cache must never hold.
    ///
    /// ## Rules
    /// - id, barcode and name are non-empty
    /// - price > 0
    /// - stock_qty ≥ 0
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("id", &self.id),
            ("barcode", &self.barcode),
            ("name", &self.name),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: field.to_string(),
                });
            }
        }
        if !self.price.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "price".to_string(),
            });
        }
        if self.stock_qty < 0 {
            return Err(ValidationError::OutOfRange {
                field: "stock_qty".to_string(),
                min: 0,
                max: i64::MAX,
            });
        }
        Ok(())
    }
}

/// `max(now, previous + 1ms)`: the product stamp after a write made at `now`.
pub fn advance_stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::milliseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

/// Client-side cache of server product truth.
///
/// ## Invariants
/// - `price > 0` and `stock_qty ≥ 0` at construction
/// - `last_synced_at` strictly increases on every applied update
///   (see [`LocalProduct::next_stamp`])
/// - never deleted, only deactivated with `is_active = false`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LocalProduct {
    pub id: String,
    pub barcode: String,
    pub name: String,
    pub price: Money,
    /// Advisory: offline sales decrement it and it may go negative.
    pub stock_qty: i64,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub is_active: bool,
    #[ts(as = "String")]
    pub last_synced_at: DateTime<Utc>,
    /// Set by an offline admin edit until a pull overwrites it.
    #[ts(as = "Option<String>")]
    pub local_edit_at: Option<DateTime<Utc>>,
}

impl LocalProduct {
    /// Builds a cache row from validated server values.
    pub fn new(snapshot: ProductSnapshot, synced_at: DateTime<Utc>) -> Result<Self, ValidationError> {
        snapshot.validate()?;
        Ok(LocalProduct {
            id: snapshot.id,
            barcode: snapshot.barcode,
            name: snapshot.name,
            price: snapshot.price,
            stock_qty: snapshot.stock_qty,
            category_id: snapshot.category_id,
            category_name: snapshot.category_name,
            is_active: snapshot.is_active,
            last_synced_at: synced_at,
            local_edit_at: None,
        })
    }

    /// Whether the server disagrees on a field pull is responsible for.
    ///
    /// Only price, stock and active flag count. Names and categories are
    /// refreshed whenever one of those changes but never trigger a write
    /// by themselves.
    pub fn differs_from(&self, server: &ProductSnapshot) -> bool {
        self.price != server.price
            || self.stock_qty != server.stock_qty
            || self.is_active != server.is_active
    }

    /// The next `last_synced_at` value: `max(now, previous + 1ms)`.
    ///
    /// Keeps the stamp strictly increasing when the wall clock stalls or
    /// steps backwards.
    pub fn next_stamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        advance_stamp(self.last_synced_at, now)
    }

    /// Whether stock covers `quantity`.
    #[inline]
    pub fn has_stock_for(&self, quantity: i64) -> bool {
        self.stock_qty >= quantity
    }
}

// =============================================================================
// Local Transaction
// =============================================================================

/// A line of a [`LocalTransaction`]. Name and price are frozen at sale time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransactionItem {
    pub id: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub price_at_moment: Money,
    /// Always `quantity × price_at_moment`.
    pub subtotal: Money,
}

impl LocalTransactionItem {
    /// Snapshots a product line. Quantity must be positive.
    pub fn new(product: &LocalProduct, quantity: i64) -> Result<Self, ValidationError> {
        if quantity <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            });
        }
        let subtotal =
            product
                .price
                .checked_mul(quantity)
                .ok_or_else(|| amount_overflow("subtotal"))?;
        Ok(LocalTransactionItem {
            id: uuid::Uuid::new_v4().to_string(),
            product_id: product.id.clone(),
            product_name: product.name.clone(),
            quantity,
            price_at_moment: product.price,
            subtotal,
        })
    }
}

/// A sale captured on this register, pending confirmation by the server.
///
/// ## Ownership
/// This register owns the row until it is `Synced`; after that it is a
/// read-only mirror. `id` is the idempotency key on every push attempt and
/// `invoice_number` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct LocalTransaction {
    pub id: String,
    pub invoice_number: String,
    /// Canonical number assigned by the server once synced.
    pub server_invoice_number: Option<String>,
    pub cashier_id: String,
    pub total_amount: Money,
    pub tax_amount: Money,
    pub amount_paid: Money,
    pub change: Money,
    pub payment_method: PaymentMethod,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub sync_attempts: i64,
    pub items: Vec<LocalTransactionItem>,
}

impl LocalTransaction {
    /// Sum of line subtotals, before tax.
    pub fn subtotal(&self) -> Money {
        self.items.iter().map(|i| i.subtotal).sum()
    }
}

/// Subtotal, tax and total of a set of lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SaleTotals {
    pub subtotal: Money,
    pub tax: Money,
    pub total: Money,
}

impl SaleTotals {
    /// `total = Σ subtotal + tax(Σ subtotal)`, rejecting sums that do not
    /// fit in `i64`.
    pub fn from_items(items: &[LocalTransactionItem], rate: TaxRate) -> Result<Self, ValidationError> {
        let subtotal = items
            .iter()
            .try_fold(Money::zero(), |acc, i| acc.checked_add(i.subtotal))
            .ok_or_else(|| amount_overflow("subtotal"))?;
        Self::from_subtotal(subtotal, rate)
    }

    pub fn from_subtotal(subtotal: Money, rate: TaxRate) -> Result<Self, ValidationError> {
        let tax = subtotal.calculate_tax(rate);
        let total = subtotal
            .checked_add(tax)
            .ok_or_else(|| amount_overflow("total"))?;
        Ok(SaleTotals { subtotal, tax, total })
    }
}

pub(crate) fn amount_overflow(field: &str) -> ValidationError {
    ValidationError::OutOfRange {
        field: field.to_string(),
        min: 0,
        max: i64::MAX,
    }
}

/// Change owed to the customer. Only cash produces change.
pub fn change_due(method: PaymentMethod, amount_paid: Money, total: Money) -> Money {
    if method.requires_tender() {
        amount_paid - total
    } else {
        Money::zero()
    }
}

// =============================================================================
// Sale Request
// =============================================================================

/// One requested line of a sale: which product and how many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: i64,
}

/// Input to the sale processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SaleRequest {
    pub items: Vec<SaleLine>,
    pub payment_method: PaymentMethod,
    pub amount_paid: Money,
}

// =============================================================================
// Job Status
// =============================================================================

/// Lifecycle of a durable retry-queue job.
///
/// ```text
/// Pending → Processing → Completed
///                      → Retrying → Pending
///                      → Failed
/// ```
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

// =============================================================================
// Unit Tests
// =============================================================================
