//! # Sync Error Types
//!
//! Error types for the sync engine, the server API, and the sale processor.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Server API    │  │     Sale                │ │
//! │  │                 │  │   (ApiError)    │  │     (SaleError)         │ │
//! │  │  InvalidConfig  │  │  Timeout        │  │  ProductNotFound        │ │
//! │  │  MissingDeviceId│  │  Transport      │  │  ProductInactive        │ │
//! │  │  InvalidUrl     │  │  Status(code)   │  │  InsufficientStock      │ │
//! │  │  ConfigLoad/Save│  │  Decode         │  │  InsufficientPayment    │ │
//! │  └─────────────────┘  │  Unauthorized   │  │  Validation             │ │
//! │                       └─────────────────┘  │  PersistenceFailure     │ │
//! │  ┌─────────────────┐  ┌─────────────────┐  └─────────────────────────┘ │
//! │  │    Database     │  │     Queue       │                              │
//! │  │                 │  │                 │                              │
//! │  │  DatabaseError  │  │  JobNotFound    │                              │
//! │  │  Serialization  │  │  AlreadyRunning │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient `ApiError`s are never fatal: the sale processor falls back to
//! the offline path, and a push cycle marks the row `Failed` and moves on.

use kasir_core::{CoreError, Money};
use kasir_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for server API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for the sale processor.
pub type SaleResult<T> = Result<T, SaleError>;

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering engine wiring, config and storage failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Server API error: {0}")]
    Api(#[from] ApiError),

    /// The connectivity monitor reports the server unreachable.
    #[error("Server is unreachable")]
    Offline,

    #[error("No active session")]
    NotAuthenticated,

    // =========================================================================
    // Database Errors
    // =========================================================================
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue processor is already running")]
    AlreadyRunning,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync agent is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Serialization(msg) => SyncError::SerializationFailed(msg),
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Transient server errors (timeouts, 5xx, connection refused)
    /// - Being offline or signed out
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Storage and serialization failures
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(api) => api.is_transient(),
            SyncError::Offline | SyncError::NotAuthenticated => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

// =============================================================================
// Server API Error
// =============================================================================

/// Failure of a single call to the sync server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,

    /// Connection refused, DNS failure, TLS failure, reset.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl ApiError {
    /// Returns true if the same request may succeed later unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Transport(_) => true,
            ApiError::Status { code, .. } => *code >= 500 || *code == 429,
            ApiError::Decode(_) | ApiError::Unauthorized => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Status {
                code: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

// =============================================================================
// Sale Error
// =============================================================================

/// Why a sale was rejected.
///
/// Every variant except `PersistenceFailure` is detected before anything is
/// written, so a rejected sale leaves no trace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaleError {
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Product is not active: {0}")]
    ProductInactive(String),

    #[error("Insufficient stock for {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: String,
        available: i64,
        requested: i64,
    },

    #[error("Insufficient payment: total {total}, paid {paid}")]
    InsufficientPayment { total: Money, paid: Money },

    #[error("Validation error: {0}")]
    Validation(String),

    /// The local write failed. Nothing partial was committed.
    #[error("Failed to persist sale: {0}")]
    PersistenceFailure(String),
}

impl From<CoreError> for SaleError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ProductNotFound(id) => SaleError::ProductNotFound(id),
            CoreError::ProductInactive(id) => SaleError::ProductInactive(id),
            CoreError::InsufficientStock {
                product_id,
                available,
                requested,
            } => SaleError::InsufficientStock {
                product_id,
                available,
                requested,
            },
            CoreError::InsufficientPayment { total, paid } => SaleError::InsufficientPayment {
                total: Money::from_minor(total),
                paid: Money::from_minor(paid),
            },
            other => SaleError::Validation(other.to_string()),
        }
    }
}

impl From<kasir_core::ValidationError> for SaleError {
    fn from(err: kasir_core::ValidationError) -> Self {
        SaleError::Validation(err.to_string())
    }
}

impl From<DbError> for SaleError {
    fn from(err: DbError) -> Self {
        SaleError::PersistenceFailure(err.to_string())
    }
}
