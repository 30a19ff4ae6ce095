//! # HTTP Client
//!
//! [`PosApi`] over reqwest. Every request carries the session's bearer
//! token when one exists; pushes also carry the client id as
//! `Idempotency-Key` so a retried push is applied at most once.
//!
//! ## Status Mapping
//! ```text
//! 2xx  → Ok
//! 401  → ApiError::Unauthorized
//! 409  → CreateOutcome::AlreadyApplied   (POST /transactions only)
//! else → ApiError::Status { code, body }
//! timeout / connect failure → ApiError::Timeout / ApiError::Transport
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::api::{CreateOutcome, CreateTransactionRequest, PagedResult, PosApi, ProductDto, TransactionDto};
use crate::config::KasirConfig;
use crate::error::{ApiError, ApiResult, SyncError, SyncResult};
use crate::session::SessionProvider;

const TRANSACTIONS_PATH: &str = "/api/v1/transactions";
const PRODUCTS_PATH: &str = "/api/v1/products";

/// Production [`PosApi`].
pub struct HttpPosApi {
    client: Client,
    base_url: Url,
    health_path: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpPosApi {
    pub fn new(config: &KasirConfig, session: Arc<dyn SessionProvider>) -> SyncResult<Self> {
        let base_url = Url::parse(&config.server.base_url)?;

        let client = Client::builder()
            .timeout(config.api_timeout())
            .user_agent(concat!("kasir-register/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(HttpPosApi {
            client,
            base_url,
            health_path: config.connectivity.health_path.clone(),
            session,
        })
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Transport(format!("Invalid endpoint {path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Maps a non-success response to an [`ApiError`].
async fn error_for(response: Response) -> ApiError {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return ApiError::Unauthorized;
    }
    let body = response.text().await.unwrap_or_default();
    ApiError::Status {
        code: status.as_u16(),
        body,
    }
}

#[async_trait]
impl PosApi for HttpPosApi {
    async fn health(&self, timeout: Duration) -> ApiResult<()> {
        let url = self.endpoint(&self.health_path)?;
        let response = self.client.get(url).timeout(timeout).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_for(response).await)
        }
    }

    async fn create_transaction(&self, request: &CreateTransactionRequest) -> ApiResult<CreateOutcome> {
        let url = self.endpoint(TRANSACTIONS_PATH)?;
        debug!(id = %request.id, items = request.items.len(), "POST transaction");

        let response = self
            .authorize(self.client.post(url))
            .header("Idempotency-Key", &request.id)
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                warn!(id = %request.id, "Server already has this transaction");
                Ok(CreateOutcome::AlreadyApplied)
            }
            status if status.is_success() => {
                let dto: TransactionDto = response.json().await?;
                Ok(CreateOutcome::Created(dto))
            }
            _ => Err(error_for(response).await),
        }
    }

    async fn list_products(&self, page: u32, page_size: u32) -> ApiResult<PagedResult<ProductDto>> {
        let url = self.endpoint(PRODUCTS_PATH)?;

        let response = self
            .authorize(self.client.get(url))
            .query(&[("page", page), ("pageSize", page_size)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        Ok(response.json().await?)
    }
}
