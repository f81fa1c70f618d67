//! Entry point for queries and transactions.
//!
//! The coordinator composes the pool, the query cache and the retry policy:
//! reads are answered from the cache when possible, misses and writes lease a
//! connection of the matching role, and lock contention is retried with
//! backoff before it reaches the caller.

mod retry;
pub mod transaction;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::Error;
use crate::cache::{CacheOptions, Priority, QueryCache, compute_query_key};
use crate::config::{AppConfig, MigrationConfig, RetryConfig};
use crate::migrations::{MigrationManager, MigrationOrchestrator};
use crate::pool::{ConnectionPool, PooledConnection, Role};
use crate::rows::{Rows, SqlValue, is_read_statement};
use retry::{Backoff, with_retries};

pub use transaction::{Isolation, Transaction, TransactionOptions};

/// Per-call query options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Defaults to a fingerprint of the statement and its parameters.
    pub cache_key: Option<String>,
    /// Consult and fill the cache for reads.
    pub use_cache: bool,
    /// Defaults to the configured retry count.
    pub max_retries: Option<u32>,
    pub ttl: Option<Duration>,
    /// Tags attached to a cached read.
    pub tags: Vec<String>,
    pub priority: Priority,
    pub force_refresh: bool,
    /// Cache tags to invalidate after a successful write.
    pub invalidate_tags: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cache_key: None,
            use_cache: true,
            max_retries: None,
            ttl: None,
            tags: Vec::new(),
            priority: Priority::Normal,
            force_refresh: false,
            invalidate_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub data: Rows,
    /// Wall time including cache lookup and every retry.
    pub execution_time_ms: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionCoordinator {
    pool: ConnectionPool,
    cache: Arc<QueryCache>,
    retry: RetryConfig,
}

fn retryable_in_transaction(e: &Error) -> bool {
    e.is_busy() || matches!(e, Error::TransactionTimeout { .. })
}

impl ExecutionCoordinator {
    pub fn new(pool: ConnectionPool, cache: Arc<QueryCache>, retry: RetryConfig) -> Self {
        Self { pool, cache, retry }
    }

    /// Open the pool and cache described by `config`.
    pub async fn open(config: &AppConfig) -> Result<Self, Error> {
        config.validate()?;
        let pool = ConnectionPool::open(config.store.clone(), config.pool.clone()).await?;
        let cache = Arc::new(QueryCache::with_store(config.cache.clone(), pool.clone()).await);
        Ok(Self::new(pool, cache, config.retry.clone()))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Orchestrator over the migrations in `config.directory`, wired to clear
    /// this coordinator's cache after schema changes.
    pub async fn migrations(&self, config: &MigrationConfig) -> Result<MigrationOrchestrator, Error> {
        let manager = MigrationManager::from_config(self.pool.clone(), config).await?;
        Ok(MigrationOrchestrator::new(manager, config).with_cache(Arc::clone(&self.cache)))
    }

    /// Run one statement.
    ///
    /// Reads go to a reader and, with `use_cache`, through the cache. Anything
    /// else goes to a writer and is never cached. Busy failures are retried
    /// with exponential backoff; other failures are returned as they are.
    pub async fn query(&self, sql: &str, params: Vec<SqlValue>, opts: QueryOptions) -> Result<QueryResult, Error> {
        if sql.trim().is_empty() {
            return Err(Error::InvalidInput("query is empty".into()));
        }
        let started = Instant::now();
        let read = is_read_statement(sql);
        let role = if read { Role::Reader } else { Role::Writer };
        let max_retries = opts.max_retries.unwrap_or(self.retry.max_retries);

        let (data, from_cache) = if read && opts.use_cache {
            let key = opts.cache_key.clone().unwrap_or_else(|| compute_query_key(sql, &params));
            let cache_opts = CacheOptions {
                ttl: opts.ttl,
                tags: opts.tags.clone(),
                force_refresh: opts.force_refresh,
                priority: opts.priority,
            };
            let (rows, origin) =
                self.cache.fetch(&key, || self.run_statement(sql, &params, role, max_retries), cache_opts).await?;
            (rows, origin.is_hit())
        } else {
            let rows = self.run_statement(sql, &params, role, max_retries).await?;
            if !read && !opts.invalidate_tags.is_empty() {
                self.cache.invalidate(None, &opts.invalidate_tags).await?;
            }
            (rows, false)
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(role = %role, from_cache, execution_time_ms, "query finished");
        Ok(QueryResult { data, execution_time_ms, from_cache })
    }

    async fn run_statement(&self, sql: &str, params: &[SqlValue], role: Role, max_retries: u32) -> Result<Rows, Error> {
        let backoff = Backoff::Exponential { base: self.retry.base_delay(), max: self.retry.max_delay() };
        with_retries("query", max_retries, backoff, Error::is_busy, |_| async move {
            let conn = self.pool.acquire(role).await?;
            conn.execute(sql, params.to_vec()).await
        })
        .await
    }

    /// Run `callback` inside a transaction on a writer.
    ///
    /// Commits when the callback returns `Ok`, rolls back otherwise. The
    /// callback races `opts.timeout`; losing aborts the transaction. Busy and
    /// timeout failures run the whole callback again with linear backoff, so
    /// it must be safe to repeat.
    pub async fn transaction<T, F, Fut>(&self, opts: TransactionOptions, callback: F) -> Result<T, Error>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let max_retries = opts.max_retries.unwrap_or(self.retry.max_retries);
        let step = opts.retry_delay.unwrap_or_else(|| self.retry.base_delay());
        let timeout = opts.timeout.unwrap_or_else(|| self.retry.transaction_timeout());
        let isolation = opts.isolation;
        let callback = &callback;

        with_retries("transaction", max_retries, Backoff::Linear { step }, retryable_in_transaction, |_| async move {
            self.run_transaction(isolation, timeout, callback).await
        })
        .await
    }

    async fn run_transaction<T, F, Fut>(&self, isolation: Isolation, timeout: Duration, callback: &F) -> Result<T, Error>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let conn = self.pool.acquire(Role::Writer).await?;
        let depth = conn.transaction_depth();
        conn.execute_batch(isolation.begin_sql()).await?;
        depth.fetch_add(1, Ordering::AcqRel);

        let (tx, open) = Transaction::new(conn.handle().clone());
        let outcome = tokio::time::timeout(timeout, callback(tx)).await;
        open.store(false, Ordering::Release);

        let result = match outcome {
            Ok(Ok(value)) => conn.execute_batch("COMMIT").await.map(|()| value),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(timeout_ms, "transaction timed out, rolling back");
                Err(Error::TransactionTimeout { timeout_ms })
            }
        };

        if result.is_err()
            && let Err(e) = rollback(&conn).await
        {
            // The depth stays raised so the handle is validated before reuse.
            tracing::warn!(error = %e, "rollback failed");
            return result;
        }
        depth.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Stop pool maintenance and close every connection once leases return.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

async fn rollback(conn: &PooledConnection) -> Result<(), Error> {
    conn.call(|conn| {
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    })
    .await
}
