//! # Register Configuration
//!
//! Configuration management for the register runtime.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     KASIR_SERVER_URL=https://pos.example.com                           │
//! │     KASIR_DEVICE_ID=abc-123                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/kasir-pos/kasir.toml (Linux)                             │
//! │     ~/Library/Application Support/com.kasir.pos/kasir.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     30s probe, 60s push, 3 print retries, auto-generated device_id     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # kasir.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [server]
//! base_url = "https://pos.example.com"
//! api_timeout_secs = 30
//!
//! [connectivity]
//! probe_interval_secs = 30
//! probe_timeout_secs = 5
//!
//! [sync]
//! pull_page_size = 10000
//! push_interval_secs = 60
//!
//! [sale]
//! tax_rate_bps = 1100  # 11%
//!
//! [print]
//! max_retries = 3
//! retry_delay_ms = 5000
//!
//! [database]
//! path = "/var/lib/kasir/kasir.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use kasir_core::TaxRate;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Register".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

/// Where the sync server lives and how long to wait for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the REST API, without the `/api/v1` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for every API call except the health probe (seconds).
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            base_url: default_base_url(),
            api_timeout_secs: default_api_timeout(),
        }
    }
}

// =============================================================================
// Connectivity Settings
// =============================================================================

/// Health probe behavior.
///
/// ## Probe Timing
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  backoff_enabled = false (default)                                     │
/// │  ───────────────────────────────                                       │
/// │  probe ── 30s ── probe ── 30s ── probe ── 30s ── probe                 │
/// │                                                                         │
/// │  backoff_enabled = true (while offline)                                │
/// │  ──────────────────────────────────────                                │
/// │  probe ─ 30s ─ probe ── ~45s ── probe ──── ~68s ──── probe ... ≤ max  │
/// │  (online again resets to probe_interval_secs)                          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Path of the health endpoint, relative to `server.base_url`.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Back off exponentially (with jitter) between probes while offline.
    #[serde(default)]
    pub backoff_enabled: bool,

    /// Upper bound of the offline backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/api/v1/health".to_string()
}

fn default_max_backoff() -> u64 {
    300
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            health_path: default_health_path(),
            backoff_enabled: false,
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl ConnectivitySettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Push and pull behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Products requested per page. A pull keeps fetching pages until it
    /// has seen `totalCount` products.
    #[serde(default = "default_pull_page_size")]
    pub pull_page_size: u32,

    /// Interval between periodic push cycles while online (seconds).
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// Pull the catalog right after the first successful probe.
    #[serde(default = "default_true")]
    pub pull_on_connect: bool,
}

fn default_pull_page_size() -> u32 {
    10_000
}

fn default_push_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            pull_page_size: default_pull_page_size(),
            push_interval_secs: default_push_interval(),
            pull_on_connect: true,
        }
    }
}

// =============================================================================
// Sale Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaleSettings {
    /// Tax rate in basis points (1100 = 11%). Zero disables tax.
    #[serde(default)]
    pub tax_rate_bps: u32,
}

impl SaleSettings {
    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps)
    }
}

// =============================================================================
// Print Queue Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintSettings {
    /// Attempts before a job lands in the failed set.
    #[serde(default = "default_print_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Fallback poll of the queue when no wakeup arrives.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

fn default_print_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5_000
}

fn default_idle_poll() -> u64 {
    100
}

impl Default for PrintSettings {
    fn default() -> Self {
        PrintSettings {
            max_retries: default_print_retries(),
            retry_delay_ms: default_retry_delay(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `kasir.db` in the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete register configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KasirConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub sale: SaleSettings,

    #[serde(default)]
    pub print: PrintSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl KasirConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (kasir.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let url = Url::parse(&self.server.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Server URL must start with http:// or https://, got: {}",
                self.server.base_url
            )));
        }

        if !self.connectivity.health_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(
                "health_path must start with '/'".into(),
            ));
        }

        if self.connectivity.probe_interval_secs == 0 || self.sync.push_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "intervals must be greater than 0".into(),
            ));
        }

        if self.sync.pull_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "pull_page_size must be greater than 0".into(),
            ));
        }

        if self.sale.tax_rate_bps > 10_000 {
            return Err(SyncError::InvalidConfig(format!(
                "tax_rate_bps must be at most 10000, got {}",
                self.sale.tax_rate_bps
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("KASIR_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("KASIR_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(url) = std::env::var("KASIR_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.base_url = url;
        }

        if let Ok(secs) = std::env::var("KASIR_PROBE_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.connectivity.probe_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid KASIR_PROBE_INTERVAL_SECS"),
            }
        }

        if let Ok(bps) = std::env::var("KASIR_TAX_RATE_BPS") {
            match bps.parse::<u32>() {
                Ok(b) => self.sale.tax_rate_bps = b,
                Err(_) => warn!(value = %bps, "Ignoring invalid KASIR_TAX_RATE_BPS"),
            }
        }

        if let Ok(path) = std::env::var("KASIR_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "kasir", "pos")
            .map(|dirs| dirs.config_dir().join("kasir.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Database file, falling back to the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "kasir", "pos")
                .map(|dirs| dirs.data_dir().join("kasir.db"))
        })
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.server.api_timeout_secs)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.sync.push_interval_secs)
    }
}
