//! # Repository Module
//!
//! One repository per table group, each holding a clone of the pool.
//!
//! ```text
//! Caller                         Repository                    SQLite
//! ──────                         ──────────                    ──────
//! SaleProcessor ──insert_pending──► TransactionRepository ──► transactions
//!                                                            transaction_items
//!                                                            products.stock_qty
//! SyncEngine ──mark_syncing/synced/failed──► TransactionRepository
//! SyncEngine ──insert/apply_server_values──► ProductRepository ──► products
//! SyncEngine ──append/complete──► SyncLogRepository ──► sync_log
//! RetryQueue ──save/delete──► PrintJobRepository ──► print_jobs
//! ```
//!
//! ## Available Repositories
//!
//! - [`product::ProductRepository`] - Product cache reads and writes
//! - [`transaction::TransactionRepository`] - Local sales and their sync state
//! - [`sync_log::SyncLogRepository`] - Sync audit log
//! - [`print_job::PrintJobRepository`] - Durable queue jobs

pub mod print_job;
pub mod product;
pub mod sync_log;
pub mod transaction;
