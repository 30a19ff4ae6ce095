//! # kasir-db: Local Durable Store for Kasir POS
//!
//! SQLite storage for everything the register must not lose while offline.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  kasir-sync (engine, sale processor, retry queue)                      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ★ kasir-db (THIS CRATE) ★                                             │
//! │  ├── products           cached server truth                            │
//! │  ├── transactions       local sales with sync_status                   │
//! │  ├── transaction_items  frozen line snapshots                          │
//! │  ├── sync_log           audit of sync attempts                         │
//! │  └── print_jobs         durable retry-queue jobs                       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  SQLite (WAL)                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kasir_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("kasir.db")).await?;
//! let pending = db.transactions().count_pending().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::print_job::{PrintJobRecord, PrintJobRepository};
pub use repository::product::{ProductRepository, ProductWrite};
pub use repository::sync_log::SyncLogRepository;
pub use repository::transaction::{StatusCounts, TransactionRepository};
