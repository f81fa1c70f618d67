//! Store configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (KBSTORE_*, nested sections split on `__`)
//! 2. TOML config file (if KBSTORE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! Every value is validated once after loading, before any connection to the
//! store is opened.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Top-level configuration handed to the store layer at construction time.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (KBSTORE_*)
/// 2. TOML config file (if KBSTORE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store file and connection tuning.
    #[serde(default)]
    pub store: StoreConfig,

    /// Connection pool limits and timeouts.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Query cache sizing and persistence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Migration loading and safety switches.
    #[serde(default)]
    pub migrations: MigrationConfig,

    /// Retry policy used by the execution coordinator.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// SQLite journal mode applied to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Wal,
    Delete,
    Truncate,
}

impl JournalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
        }
    }
}

/// SQLite `synchronous` level applied to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Off,
    Normal,
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Off => "OFF",
            SyncMode::Normal => "NORMAL",
            SyncMode::Full => "FULL",
        }
    }
}

/// Location of the store file and per-handle pragmas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    ///
    /// Set via KBSTORE_STORE__PATH environment variable.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    #[serde(default = "default_journal_mode")]
    pub journal_mode: JournalMode,

    #[serde(default = "default_sync_mode")]
    pub synchronous: SyncMode,

    /// How long SQLite itself waits on a lock before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./kb-assistant.db")
}

fn default_journal_mode() -> JournalMode {
    JournalMode::Wal
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Normal
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            journal_mode: default_journal_mode(),
            synchronous: default_sync_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_readers")]
    pub max_readers: usize,

    /// Embedded single-writer engines want this at 1.
    #[serde(default = "default_max_writers")]
    pub max_writers: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,

    /// Health-check reused connections before handing them out.
    #[serde(default)]
    pub validate_on_acquire: bool,

    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_max_readers() -> usize {
    4
}

fn default_max_writers() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_lifetime_ms() -> u64 {
    30 * 60 * 1000
}

fn default_maintenance_interval_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_readers: default_max_readers(),
            max_writers: default_max_writers(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
            validate_on_acquire: false,
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Query cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Mirror entries into the `query_cache` table.
    #[serde(default)]
    pub persist_to_disk: bool,
}

fn default_max_entries() -> usize {
    1_000
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            default_ttl_ms: default_ttl_ms(),
            persist_to_disk: false,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// Migration loading and safety switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Directory of `<version>_<description>.sql` files.
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,

    /// Refuse to run destructive plans without explicit confirmation.
    #[serde(default = "default_true")]
    pub require_confirmation_for_destructive: bool,

    /// Versions allowed to be missing between two consecutive applied
    /// versions before the gap is an error rather than a warning.
    #[serde(default = "default_max_sequence_gap")]
    pub max_sequence_gap: i64,

    /// Apply pending migrations when the server boots.
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("./migrations")
}

fn default_max_sequence_gap() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            require_confirmation_for_destructive: true,
            max_sequence_gap: default_max_sequence_gap(),
            run_on_startup: true,
        }
    }
}

/// Retry policy for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff step; doubled per attempt for queries.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_transaction_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `KBSTORE_`
    /// 2. TOML file from `KBSTORE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("KBSTORE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("KBSTORE_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        Self::from_figment(figment)
    }

    /// Extract and validate a configuration from a prepared figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.store.path, PathBuf::from("./kb-assistant.db"));
        assert_eq!(config.store.journal_mode, JournalMode::Wal);
        assert_eq!(config.pool.max_writers, 1);
        assert_eq!(config.pool.max_readers, 4);
        assert!(!config.pool.validate_on_acquire);
        assert!(!config.cache.persist_to_disk);
        assert!(config.migrations.require_confirmation_for_destructive);
        assert_eq!(config.retry.max_delay_ms, 1_000);
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.store.busy_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(
            r#"
            [pool]
            max_readers = 8
            validate_on_acquire = true

            [cache]
            persist_to_disk = true
            default_ttl_ms = 1000

            [store]
            journal_mode = "delete"
            "#,
        ));

        let config = AppConfig::from_figment(figment).unwrap();
        assert_eq!(config.pool.max_readers, 8);
        assert!(config.pool.validate_on_acquire);
        assert!(config.cache.persist_to_disk);
        assert_eq!(config.cache.default_ttl_ms, 1000);
        assert_eq!(config.store.journal_mode, JournalMode::Delete);
        assert_eq!(config.pool.max_writers, 1);
    }

    #[test]
    fn test_invalid_values_rejected_at_load() {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string("[pool]\nmax_writers = 0\n"));

        let result = AppConfig::from_figment(figment);
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "pool.max_writers"));
    }
}
