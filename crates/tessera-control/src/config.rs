//! Configuration for tessera-control.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Storage backend selection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Lease behaviour configuration.
    #[serde(default)]
    pub leases: LeaseConfig,

    /// Timeout reaper configuration.
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `TESSERA_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("control.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESSERA_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Type of lifecycle store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// PostgreSQL, falling back to memory if the connection fails.
    #[default]
    Postgres,

    /// In-memory store, for development and tests.
    Memory,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/tessera".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Lease behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseConfig {
    /// Lifetime given to pending leases when their deployment goes live.
    #[serde(default = "default_activation_ttl_secs")]
    pub activation_ttl_secs: u64,
}

const fn default_activation_ttl_secs() -> u64 {
    3600 // 1 hour
}

/// Upper bound keeping expiry arithmetic in range.
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3600;

impl LeaseConfig {
    /// Activation TTL as a signed duration for timestamp arithmetic.
    #[must_use]
    pub fn activation_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.activation_ttl_secs).unwrap_or(MAX_TTL_SECS);
        chrono::Duration::seconds(secs.min(MAX_TTL_SECS))
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            activation_ttl_secs: default_activation_ttl_secs(),
        }
    }
}

/// Timeout reaper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Whether the service runs the periodic sweep at all.
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,

    /// Start undeployment for every expired deployment found.
    ///
    /// When disabled the sweep only logs candidates.
    #[serde(default = "default_auto_undeploy")]
    pub auto_undeploy: bool,
}

const fn default_reaper_enabled() -> bool {
    true
}

const fn default_reaper_interval_secs() -> u64 {
    60
}

const fn default_auto_undeploy() -> bool {
    true
}

impl ReaperConfig {
    /// Interval between sweeps, at least one second.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval_secs(),
            auto_undeploy: default_auto_undeploy(),
        }
    }
}
