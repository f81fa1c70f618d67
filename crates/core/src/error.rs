//! Unified error types for kbstore.
//!
//! SQLite failures are classified at the conversion boundary: `SQLITE_BUSY` and
//! `SQLITE_LOCKED` become [`Error::StoreBusy`] (retryable), everything else
//! becomes [`Error::Database`].

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

use crate::config::ConfigError;
use crate::pool::Role;

/// Unified error type for the store layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a malformed invalidation pattern).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Configuration failed to load or validate.
    #[error("CONFIG_ERROR: {0}")]
    Config(#[from] ConfigError),

    /// No connection of the requested role became available in time.
    #[error("POOL_TIMEOUT: no {role} connection available after {waited_ms}ms")]
    PoolTimeout { role: Role, waited_ms: u64 },

    /// The role limit is reached and the caller asked not to wait.
    #[error("POOL_EXHAUSTED: all {role} connections are in use")]
    PoolExhausted { role: Role },

    /// The pool is draining and no longer hands out connections.
    #[error("POOL_DRAINING: pool is shutting down")]
    PoolDraining,

    /// A connection failed its health check and could not be replaced.
    #[error("CONNECTION_INVALID: {0}")]
    ConnectionValidation(String),

    /// The store reported lock contention; retrying may succeed.
    #[error("STORE_BUSY: {0}")]
    StoreBusy(String),

    /// Non-transient database failure (constraint, syntax, I/O).
    #[error("DATABASE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// A retried operation kept failing.
    #[error("RETRIES_EXHAUSTED: gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A transaction callback exceeded its deadline and was aborted.
    #[error("TRANSACTION_TIMEOUT: transaction exceeded {timeout_ms}ms")]
    TransactionTimeout { timeout_ms: u64 },

    /// A transaction handle was used after its transaction ended.
    #[error("TRANSACTION_CLOSED: transaction handle used after commit or rollback")]
    TransactionClosed,

    /// Cache payload (de)serialization failed.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem access failed (e.g., reading migration files).
    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),

    /// A migration file could not be parsed.
    #[error("MIGRATION_PARSE: {0}")]
    MigrationParse(String),

    /// The migration version is already recorded in the ledger.
    #[error("MIGRATION_ALREADY_APPLIED: version {version}")]
    MigrationAlreadyApplied { version: i64 },

    /// An applied migration's script changed after it was applied.
    #[error("MIGRATION_CHECKSUM_MISMATCH: version {version} expected {expected}, found {actual}")]
    MigrationChecksumMismatch { version: i64, expected: String, actual: String },

    /// Applied versions skip more numbers than the configured tolerance allows.
    #[error("MIGRATION_SEQUENCE_GAP: versions {after} and {next} are not contiguous")]
    MigrationSequenceGap { after: i64, next: i64 },

    /// Pre- or post-validation rejected a migration.
    #[error("MIGRATION_VALIDATION: version {version}: {reason}")]
    MigrationValidation { version: i64, reason: String },

    /// A rollback targets a version with no down script.
    #[error("MISSING_ROLLBACK_SCRIPT: version {version} has no down script")]
    MissingRollbackScript { version: i64 },

    /// Rolling back a version failed; `remaining` lists versions still applied.
    #[error("MIGRATION_ROLLBACK_FAILED: version {version}: {reason} (still applied: {remaining:?})")]
    MigrationRollbackFailure { version: i64, remaining: Vec<i64>, reason: String },

    /// The requested target is not ahead of the current version.
    #[error("INVALID_TARGET: target {target} is not above current version {current}")]
    InvalidTarget { target: i64, current: i64 },

    /// The ledger moved since the plan was computed.
    #[error("STALE_PLAN: plan starts at version {planned} but store is at {current}")]
    StalePlan { planned: i64, current: i64 },

    /// A destructive plan needs explicit confirmation.
    #[error("CONFIRMATION_REQUIRED: destructive migrations {versions:?} need confirmation")]
    ConfirmationRequired { versions: Vec<i64> },

    /// No definition exists for a version the operation needs.
    #[error("UNKNOWN_MIGRATION: version {version}")]
    UnknownMigration { version: i64 },

    /// A migration run failed; the report was returned alongside.
    #[error("MIGRATION_FAILED: {0}")]
    MigrationFailed(String),
}

impl Error {
    /// Lock contention reported by the store.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::StoreBusy(_))
    }

    /// Failures where retrying unchanged inputs may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreBusy(_) | Error::PoolTimeout { .. } | Error::TransactionTimeout { .. })
    }
}

fn is_busy_code(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ffi::ErrorCode::DatabaseBusy) | Some(rusqlite::ffi::ErrorCode::DatabaseLocked)
    )
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => Error::from(e),
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy_code(&err) {
            Error::StoreBusy(err.to_string())
        } else {
            Error::Database(tokio_rusqlite::Error::Error(err))
        }
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InvalidInput(_) | Error::InvalidTarget { .. } => -32602,
            Error::Config(_) => -32603,
            Error::PoolTimeout { .. } | Error::PoolExhausted { .. } | Error::PoolDraining => -32020,
            Error::ConnectionValidation(_) => -32021,
            Error::StoreBusy(_) | Error::RetriesExhausted { .. } => -32022,
            Error::TransactionTimeout { .. } | Error::TransactionClosed => -32023,
            Error::Database(_) | Error::Io(_) => -32024,
            Error::Serialization(_) => -32025,
            Error::MigrationParse(_)
            | Error::MigrationAlreadyApplied { .. }
            | Error::MigrationChecksumMismatch { .. }
            | Error::MigrationSequenceGap { .. }
            | Error::MigrationValidation { .. }
            | Error::MissingRollbackScript { .. }
            | Error::MigrationRollbackFailure { .. }
            | Error::StalePlan { .. }
            | Error::ConfirmationRequired { .. }
            | Error::UnknownMigration { .. }
            | Error::MigrationFailed(_) => -32030,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}
