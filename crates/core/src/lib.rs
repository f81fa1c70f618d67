//! Core of kbstore: a resilient SQLite store layer.
//!
//! This crate provides:
//! - A bounded reader/writer connection pool with FIFO waiting
//! - A two-tier (memory + persisted) query result cache
//! - Versioned migrations with validation and compensating rollback
//! - An execution coordinator that retries lock contention
//! - Unified error types and layered configuration

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod rows;

pub use cache::{CacheOptions, CacheStats, QueryCache};
pub use config::AppConfig;
pub use coordinator::{ExecutionCoordinator, QueryOptions, QueryResult, Transaction, TransactionOptions};
pub use error::Error;
pub use migrations::{MigrationManager, MigrationOrchestrator, MigrationPlan};
pub use pool::{ConnectionPool, PoolStats, PooledConnection, Role};
pub use rows::{Rows, SqlValue};
