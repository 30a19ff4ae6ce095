//! # Kasir Register
//!
//! Headless register runtime: keeps the local store, the connectivity
//! probe, the sync worker and the receipt queue running until Ctrl-C.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Register Startup                                  │
//! │                                                                         │
//! │  1. Initialize Logging ───────────────────────────────────────────────► │
//! │     • tracing-subscriber with env filter                                │
//! │     • Default: info,kasir=debug,sqlx=warn (override with RUST_LOG)      │
//! │                                                                         │
//! │  2. Load Configuration ───────────────────────────────────────────────► │
//! │     • kasir.toml from the platform config dir, then KASIR_* env vars    │
//! │                                                                         │
//! │  3. Open Database ────────────────────────────────────────────────────► │
//! │     • SQLite with WAL mode                                              │
//! │     • Run pending migrations, health check                              │
//! │                                                                         │
//! │  4. Session ──────────────────────────────────────────────────────────► │
//! │     • KASIR_API_TOKEN + KASIR_CASHIER_ID sign a cashier in              │
//! │     • Without them sales still work, pushes wait for a sign-in          │
//! │                                                                         │
//! │  5. Start SyncAgent, wait for Ctrl-C, shut down gracefully ──────────► │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use kasir_db::{migrations, Database, DbConfig};
use kasir_sync::{
    EventHub, KasirConfig, ReceiptJob, ReceiptPrinter, Session, SessionStore, SyncAgentBuilder, SyncEvent,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Kasir register");

    let config = KasirConfig::load(std::env::var_os("KASIR_CONFIG").map(PathBuf::from))?;
    info!(
        device_id = %config.device_id(),
        device_name = %config.device.name,
        server = %config.server.base_url,
        "Configuration loaded"
    );

    let db_path = config
        .database_path()
        .ok_or("Could not determine database path")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(?db_path, "Database path determined");

    let db = Arc::new(Database::new(DbConfig::new(db_path)).await?);
    if !db.health_check().await {
        return Err("Database did not answer the health check".into());
    }
    let (total, applied) = migrations::migration_status(db.pool()).await?;
    info!(total, applied, "Database connected and migrations applied");

    let events = Arc::new(EventHub::<SyncEvent>::new());
    let session = Arc::new(SessionStore::new(events.clone()));
    sign_in_from_env(&session);

    let status_listener = events.subscribe(log_event);

    let agent = SyncAgentBuilder::new(config)
        .with_database(db.clone())
        .with_session(session)
        .with_events(events.clone())
        .with_printer(Arc::new(LogPrinter))
        .build()?;

    let handle = agent.start().await?;
    let status = handle.status().await?;
    info!(
        pending = status.pending_count,
        failed = status.failed_count,
        products = handle.active_products().await?.len(),
        sync_log_failed = status.sync_log_failed,
        "Register running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, starting graceful shutdown...");

    handle.shutdown().await;
    events.unsubscribe(status_listener);
    db.close().await;

    info!("Register stopped");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=kasir_sync=trace` - Trace the sync engine only
/// - Default: `info,kasir=debug,sqlx=warn`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kasir=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

fn sign_in_from_env(session: &SessionStore) {
    match (std::env::var("KASIR_API_TOKEN"), std::env::var("KASIR_CASHIER_ID")) {
        (Ok(token), Ok(cashier_id)) if !token.is_empty() => {
            session.sign_in(Session { token, cashier_id });
        }
        _ => warn!("No cashier session configured, transactions will queue until sign-in"),
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::ConnectionStatusChanged { is_online, .. } => {
            info!(online = is_online, "Connection status changed");
        }
        SyncEvent::SyncStatusChanged {
            status,
            message,
            progress,
        } => {
            info!(%status, ?progress, "{message}");
        }
        SyncEvent::AuthStatusChanged {
            is_authenticated,
            cashier_id,
        } => {
            info!(authenticated = is_authenticated, ?cashier_id, "Auth status changed");
        }
    }
}

/// Stand-in printer for a register without a receipt device.
struct LogPrinter;

#[async_trait]
impl ReceiptPrinter for LogPrinter {
    async fn print(&self, job: &ReceiptJob) -> Result<(), String> {
        info!(
            transaction_id = %job.transaction_id,
            invoice_number = %job.invoice_number,
            "Receipt printed"
        );
        Ok(())
    }
}
