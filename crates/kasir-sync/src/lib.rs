//! # kasir-sync: Offline Sync Engine for Kasir POS
//!
//! Keeps the register selling while the server is unreachable, and drains
//! what was sold once it comes back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Agent Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncAgent (Main Orchestrator)                    │  │
//! │  │                                                                  │  │
//! │  │  Owns the root CancellationToken                                 │  │
//! │  │  Hands out SyncAgentHandle to the UI                             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Connectivity   │  │  SyncEngine    │  │  SaleProcessor         │    │
//! │  │ Monitor        │  │                │  │                        │    │
//! │  │                │  │ push: pending  │  │ online: POST, mirror   │    │
//! │  │ GET /health    │  │ sales → server │  │ offline: store Pending │    │
//! │  │ every 30s      │  │ pull: catalog  │  │                        │    │
//! │  │                │  │ → cache (LWW)  │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  RetryQueue    │  │  HttpPosApi    │  │  EventHub              │    │
//! │  │                │  │                │  │                        │    │
//! │  │ receipt jobs,  │  │ reqwest REST   │  │ explicit subscribe /   │    │
//! │  │ bounded retry  │  │ client         │  │ unsubscribe            │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent`, its handle and builder
//! - [`api`] - Wire DTOs and the `PosApi` seam
//! - [`config`] - TOML configuration with env overrides
//! - [`connectivity`] - Online/offline probe loop
//! - [`engine`] - Push and pull
//! - [`error`] - Sync, API and sale error types
//! - [`events`] - Event payloads and the listener hub
//! - [`http`] - reqwest implementation of `PosApi`
//! - [`retry_queue`] - Durable bounded-retry job queue
//! - [`sale`] - Online-or-offline sale processing
//! - [`session`] - Cashier session state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kasir_sync::{KasirConfig, SessionStore, SyncAgentBuilder};
//!
//! let config = KasirConfig::load_or_default(None);
//! let session = Arc::new(SessionStore::new(events.clone()));
//!
//! let agent = SyncAgentBuilder::new(config)
//!     .with_database(db)
//!     .with_session(session)
//!     .with_events(events)
//!     .build()?;
//! let handle = agent.start().await?;
//!
//! let receipt = handle.process_sale(request).await?;
//! println!("Pending: {}", handle.pending_count().await?);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod api;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod retry_queue;
pub mod sale;
pub mod session;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentStatus, ReceiptJob, ReceiptPrinter, SyncAgent, SyncAgentBuilder, SyncAgentHandle};
pub use api::{CreateOutcome, CreateTransactionRequest, PagedResult, PosApi, ProductDto, TransactionDto};
pub use config::KasirConfig;
pub use connectivity::ConnectivityMonitor;
pub use engine::{PullReport, PushReport, SyncEngine};
pub use error::{ApiError, ApiResult, SaleError, SaleResult, SyncError, SyncResult};
pub use events::{EventHub, PrintEvent, SubscriptionId, SyncEvent, SyncPhase};
pub use http::HttpPosApi;
pub use retry_queue::{QueuedJob, RetryQueue, RetryQueueConfig};
pub use sale::{SaleOutcome, SaleProcessor, SaleReceipt};
pub use session::{Session, SessionProvider, SessionStore};
