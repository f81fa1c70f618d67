//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.
//! Out-of-range values are rejected here so no connection is ever opened
//! with a bad setting.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for the first out-of-range value:
    /// - pool sizes of 0 or above 256 readers / 16 writers
    /// - acquire timeout under 10ms or above 10 minutes
    /// - lifetime shorter than the idle timeout
    /// - cache limits of 0 or a TTL of 0
    /// - a negative sequence-gap tolerance
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.path.as_os_str().is_empty() {
            return Err(invalid("store.path", "must not be empty"));
        }
        if self.store.busy_timeout_ms > 600_000 {
            return Err(invalid("store.busy_timeout_ms", "must not exceed 10 minutes (600000ms)"));
        }

        let pool = &self.pool;
        if pool.max_readers == 0 {
            return Err(invalid("pool.max_readers", "must be greater than 0"));
        }
        if pool.max_readers > 256 {
            return Err(invalid("pool.max_readers", "must not exceed 256"));
        }
        if pool.max_writers == 0 {
            return Err(invalid("pool.max_writers", "must be greater than 0"));
        }
        if pool.max_writers > 16 {
            return Err(invalid("pool.max_writers", "must not exceed 16"));
        }
        if pool.acquire_timeout_ms < 10 {
            return Err(invalid("pool.acquire_timeout_ms", "must be at least 10ms"));
        }
        if pool.acquire_timeout_ms > 600_000 {
            return Err(invalid("pool.acquire_timeout_ms", "must not exceed 10 minutes (600000ms)"));
        }
        if pool.idle_timeout_ms == 0 {
            return Err(invalid("pool.idle_timeout_ms", "must be greater than 0"));
        }
        if pool.max_lifetime_ms < pool.idle_timeout_ms {
            return Err(invalid("pool.max_lifetime_ms", "must be at least idle_timeout_ms"));
        }
        if pool.maintenance_interval_ms < 10 {
            return Err(invalid("pool.maintenance_interval_ms", "must be at least 10ms"));
        }

        let cache = &self.cache;
        if cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be greater than 0"));
        }
        if cache.max_memory_bytes == 0 {
            return Err(invalid("cache.max_memory_bytes", "must be greater than 0"));
        }
        if cache.default_ttl_ms == 0 {
            return Err(invalid("cache.default_ttl_ms", "must be greater than 0"));
        }

        if self.migrations.max_sequence_gap < 0 {
            return Err(invalid("migrations.max_sequence_gap", "must not be negative"));
        }

        let retry = &self.retry;
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must be at least base_delay_ms"));
        }
        if retry.transaction_timeout_ms == 0 {
            return Err(invalid("retry.transaction_timeout_ms", "must be greater than 0"));
        }

        if pool.max_writers > 1 {
            tracing::warn!(
                max_writers = pool.max_writers,
                "SQLite serializes writers; extra writer connections will queue on the database lock"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MigrationConfig, PoolConfig};

    fn field_of(result: Result<(), ConfigError>) -> Option<String> {
        match result {
            Err(ConfigError::Invalid { field, .. }) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_readers() {
        let config = AppConfig { pool: PoolConfig { max_readers: 0, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()).as_deref(), Some("pool.max_readers"));
    }

    #[test]
    fn test_validate_acquire_timeout_too_small() {
        let config =
            AppConfig { pool: PoolConfig { acquire_timeout_ms: 5, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()).as_deref(), Some("pool.acquire_timeout_ms"));
    }

    #[test]
    fn test_validate_lifetime_below_idle() {
        let config = AppConfig {
            pool: PoolConfig { idle_timeout_ms: 60_000, max_lifetime_ms: 1_000, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(field_of(config.validate()).as_deref(), Some("pool.max_lifetime_ms"));
    }

    #[test]
    fn test_validate_cache_limits() {
        let config = AppConfig { cache: CacheConfig { max_entries: 0, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()).as_deref(), Some("cache.max_entries"));

        let config = AppConfig { cache: CacheConfig { default_ttl_ms: 0, ..Default::default() }, ..Default::default() };
        assert_eq!(field_of(config.validate()).as_deref(), Some("cache.default_ttl_ms"));
    }

    #[test]
    fn test_validate_negative_gap_tolerance() {
        let config = AppConfig {
            migrations: MigrationConfig { max_sequence_gap: -1, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(field_of(config.validate()).as_deref(), Some("migrations.max_sequence_gap"));

        let config = AppConfig {
            migrations: MigrationConfig { max_sequence_gap: 0, ..Default::default() },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_edge_case_values() {
        let config = AppConfig {
            pool: PoolConfig {
                max_readers: 1,
                max_writers: 1,
                acquire_timeout_ms: 10,
                idle_timeout_ms: 1,
                max_lifetime_ms: 1,
                maintenance_interval_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
