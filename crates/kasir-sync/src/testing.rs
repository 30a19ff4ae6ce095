//! Scripted in-process [`PosApi`] for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kasir_core::Money;

use crate::api::{CreateOutcome, CreateTransactionRequest, PagedResult, PosApi, ProductDto, TransactionDto};
use crate::error::{ApiError, ApiResult};

pub(crate) struct ScriptedApi {
    healthy: AtomicBool,
    health_calls: AtomicUsize,
    /// Consumed front to back; once empty every push succeeds.
    create_script: Mutex<VecDeque<ApiResult<CreateOutcome>>>,
    created: Mutex<Vec<CreateTransactionRequest>>,
    products: Mutex<ApiResult<Vec<ProductDto>>>,
    product_pages: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        ScriptedApi {
            healthy: AtomicBool::new(true),
            health_calls: AtomicUsize::new(0),
            create_script: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
            products: Mutex::new(Ok(Vec::new())),
            product_pages: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn script_create(&self, result: ApiResult<CreateOutcome>) {
        self.create_script.lock().unwrap().push_back(result);
    }

    pub fn fail_next_creates(&self, count: usize) {
        for _ in 0..count {
            self.script_create(Err(ApiError::Status {
                code: 503,
                body: "unavailable".into(),
            }));
        }
    }

    pub fn created(&self) -> Vec<CreateTransactionRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn set_products(&self, products: ApiResult<Vec<ProductDto>>) {
        *self.products.lock().unwrap() = products;
    }

    /// Product pages served so far.
    pub fn product_pages(&self) -> usize {
        self.product_pages.load(Ordering::SeqCst)
    }
}

pub(crate) fn product_dto(id: &str, price: i64, stock: i64, updated_at: Option<DateTime<Utc>>) -> ProductDto {
    ProductDto {
        id: id.to_string(),
        barcode: format!("899{id}"),
        name: format!("Product {id}"),
        price: Money::from_minor(price),
        stock_qty: stock,
        category_id: None,
        category_name: None,
        is_active: true,
        updated_at,
    }
}

#[async_trait]
impl PosApi for ScriptedApi {
    async fn health(&self, _timeout: Duration) -> ApiResult<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Transport("connection refused".into()))
        }
    }

    async fn create_transaction(&self, request: &CreateTransactionRequest) -> ApiResult<CreateOutcome> {
        let scripted = self.create_script.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| {
            Ok(CreateOutcome::Created(TransactionDto {
                id: request.id.clone(),
                invoice_number: format!("SRV-{}", request.client_invoice_number),
                total_amount: request.amount_paid,
                created_at: Some(request.created_at),
            }))
        });
        if result.is_ok() {
            self.created.lock().unwrap().push(request.clone());
        }
        result
    }

    async fn list_products(&self, page: u32, page_size: u32) -> ApiResult<PagedResult<ProductDto>> {
        let all = self.products.lock().unwrap().clone()?;
        let items = all
            .iter()
            .skip((page as usize - 1) * page_size as usize)
            .take(page_size as usize)
            .cloned()
            .collect();
        self.product_pages.fetch_add(1, Ordering::SeqCst);
        Ok(PagedResult {
            total_count: all.len() as i64,
            items,
            page,
            page_size,
        })
    }
}
