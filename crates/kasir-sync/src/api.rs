//! # Server API
//!
//! Wire DTOs of the REST sync surface and the [`PosApi`] seam the engine,
//! the sale processor and the connectivity monitor talk through.
//!
//! ```text
//! GET  /api/v1/health                      → any 2xx means online
//! POST /api/v1/transactions                → TransactionDto
//!      Idempotency-Key: <client id>          (409 = already applied)
//! GET  /api/v1/products?page=&pageSize=    → PagedResult<ProductDto>
//! ```
//!
//! JSON is camelCase and money travels as integer minor units.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use kasir_core::{LocalTransaction, Money, PaymentMethod, ProductSnapshot};

use crate::error::ApiResult;

// =============================================================================
// DTOs
// =============================================================================

/// A product as the server reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ProductDto {
    pub id: String,
    pub barcode: String,
    pub name: String,
    pub price: Money,
    pub stock_qty: i64,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Server-side modification time. Older servers omit it.
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl ProductDto {
    pub fn to_snapshot(&self) -> ProductSnapshot {
        ProductSnapshot {
            id: self.id.clone(),
            barcode: self.barcode.clone(),
            name: self.name.clone(),
            price: self.price,
            stock_qty: self.stock_qty,
            category_id: self.category_id.clone(),
            category_name: self.category_name.clone(),
            is_active: self.is_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TransactionItemRequest {
    pub product_id: String,
    pub quantity: i64,
}

/// Body of `POST /api/v1/transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    /// Client id, also sent as the `Idempotency-Key` header.
    pub id: String,
    pub client_invoice_number: String,
    pub items: Vec<TransactionItemRequest>,
    pub payment_method: PaymentMethod,
    /// The settled total. Tender and change stay on the register.
    pub amount_paid: Money,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl From<&LocalTransaction> for CreateTransactionRequest {
    fn from(txn: &LocalTransaction) -> Self {
        CreateTransactionRequest {
            id: txn.id.clone(),
            client_invoice_number: txn.invoice_number.clone(),
            items: txn
                .items
                .iter()
                .map(|item| TransactionItemRequest {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                })
                .collect(),
            payment_method: txn.payment_method,
            amount_paid: txn.total_amount,
            created_at: txn.created_at,
        }
    }
}

/// A transaction as confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub id: String,
    pub invoice_number: String,
    pub total_amount: Money,
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total_count: i64,
    pub page: u32,
    pub page_size: u32,
}

/// What the server did with a pushed transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(TransactionDto),
    /// The id was seen before (HTTP 409). Treated as success.
    AlreadyApplied,
}

impl CreateOutcome {
    pub fn server_invoice_number(&self) -> Option<&str> {
        match self {
            CreateOutcome::Created(dto) => Some(&dto.invoice_number),
            CreateOutcome::AlreadyApplied => None,
        }
    }
}

// =============================================================================
// API Trait
// =============================================================================

/// The sync server, as seen by the register.
///
/// [`crate::http::HttpPosApi`] is the production implementation; tests
/// script their own.
#[async_trait]
pub trait PosApi: Send + Sync {
    /// Reachability probe. `Ok` only for a 2xx answer within `timeout`.
    async fn health(&self, timeout: Duration) -> ApiResult<()>;

    async fn create_transaction(&self, request: &CreateTransactionRequest) -> ApiResult<CreateOutcome>;

    async fn list_products(&self, page: u32, page_size: u32) -> ApiResult<PagedResult<ProductDto>>;
}
