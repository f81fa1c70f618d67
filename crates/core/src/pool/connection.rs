//! Store handles and the leases the pool hands out.
//!
//! This module opens SQLite handles with the configured pragmas and wraps a
//! checked-out handle in [`PooledConnection`], which returns itself to the
//! pool when dropped.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;
use tokio_rusqlite::{Connection, rusqlite};

use super::{PoolInner, Role};
use crate::Error;
use crate::config::StoreConfig;
use crate::rows::{Rows, SqlValue, run_statement};

/// Open a store handle for `role` and apply the configured pragmas.
///
/// Reader handles are switched to `query_only` so a reader lease cannot write.
pub(crate) async fn open_handle(path: &Path, store: &StoreConfig, role: Role) -> Result<Connection, Error> {
    let conn = Connection::open(path).await.map_err(Error::from)?;

    let busy_timeout = store.busy_timeout();
    let mut pragmas = String::new();
    if role == Role::Writer {
        pragmas.push_str(&format!("PRAGMA journal_mode={};\n", store.journal_mode.as_str()));
    }
    pragmas.push_str(&format!("PRAGMA synchronous={};\n", store.synchronous.as_str()));
    pragmas.push_str("PRAGMA foreign_keys=ON;\nPRAGMA temp_store=MEMORY;\n");
    if role == Role::Reader {
        pragmas.push_str("PRAGMA query_only=ON;\n");
    }

    conn.call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(&pragmas)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await
    .map_err(Error::from)?;

    Ok(conn)
}

/// Health check run on reused handles.
///
/// Rolls back a transaction left open by a cancelled caller before checking.
pub(crate) async fn validate_handle(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| {
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    })
    .await
    .map_err(|e: tokio_rusqlite::Error<rusqlite::Error>| Error::ConnectionValidation(e.to_string()))
}

/// A pooled handle plus the bookkeeping the pool keeps about it.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) id: u64,
    pub(crate) role: Role,
    pub(crate) handle: Connection,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) query_count: u64,
    /// Validate before the next lease (set on release when configured).
    pub(crate) needs_validation: bool,
    /// Close and reopen before the next lease (past max lifetime).
    pub(crate) needs_replacement: bool,
}

impl Slot {
    pub(crate) fn new(id: u64, role: Role, handle: Connection) -> Self {
        let now = Instant::now();
        Self {
            id,
            role,
            handle,
            created_at: now,
            last_used_at: now,
            query_count: 0,
            needs_validation: false,
            needs_replacement: false,
        }
    }
}

/// Snapshot of a leased connection's metadata.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub role: Role,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub in_use: bool,
    pub transaction_depth: u64,
    pub query_count: u64,
}

/// Exclusive lease on one store handle.
///
/// Dropping the lease (or passing it to [`super::ConnectionPool::release`])
/// returns the handle to the pool. While leased, no other caller can obtain
/// the same handle.
#[derive(Debug)]
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
    queries: AtomicU64,
    transaction_depth: Arc<AtomicU64>,
}

impl PooledConnection {
    pub(crate) fn new(slot: Slot, pool: Arc<PoolInner>) -> Self {
        Self { slot: Some(slot), pool, queries: AtomicU64::new(0), transaction_depth: Arc::new(AtomicU64::new(0)) }
    }

    fn slot(&self) -> &Slot {
        // Only `Drop` takes the slot.
        self.slot.as_ref().unwrap_or_else(|| unreachable!("lease used after release"))
    }

    pub fn id(&self) -> u64 {
        self.slot().id
    }

    pub fn role(&self) -> Role {
        self.slot().role
    }

    pub fn info(&self) -> ConnectionInfo {
        let slot = self.slot();
        ConnectionInfo {
            id: slot.id,
            role: slot.role,
            created_at: slot.created_at,
            last_used_at: slot.last_used_at,
            in_use: true,
            transaction_depth: self.transaction_depth.load(Ordering::Acquire),
            query_count: slot.query_count + self.queries.load(Ordering::Relaxed),
        }
    }

    /// The underlying handle, for building a transaction scope.
    pub(crate) fn handle(&self) -> &Connection {
        &self.slot().handle
    }

    pub(crate) fn transaction_depth(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.transaction_depth)
    }

    /// Run a closure on the handle's worker thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.handle().call(f).await.map_err(Error::from)
    }

    /// Run one statement with positional parameters.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<Rows, Error> {
        let sql = sql.to_string();
        self.call(move |conn| run_statement(conn, &sql, &params).map_err(Error::from))
            .await
    }

    /// Run a batch of statements without parameters.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), Error> {
        let sql = sql.to_string();
        self.call(move |conn| conn.execute_batch(&sql).map_err(Error::from)).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.query_count += self.queries.load(Ordering::Relaxed);
            if self.transaction_depth.load(Ordering::Acquire) > 0 {
                slot.needs_validation = true;
            }
            self.pool.release_slot(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalMode;

    #[tokio::test]
    async fn test_open_writer_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig { path: dir.path().join("kb.db"), ..Default::default() };
        let conn = open_handle(&store.path, &store, Role::Writer).await.unwrap();

        let (mode, fk): (String, i64) = conn
            .call(|conn| {
                let mode = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                let fk = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                Ok::<_, rusqlite::Error>((mode, fk))
            })
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_reader_is_query_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig { path: dir.path().join("kb.db"), journal_mode: JournalMode::Wal, ..Default::default() };
        let writer = open_handle(&store.path, &store, Role::Writer).await.unwrap();
        writer
            .call(|conn| conn.execute_batch("CREATE TABLE t (id INTEGER)"))
            .await
            .unwrap();

        let reader = open_handle(&store.path, &store, Role::Reader).await.unwrap();
        let result = reader
            .call(|conn| conn.execute("INSERT INTO t VALUES (1)", []))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_validate_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig { path: dir.path().join("kb.db"), ..Default::default() };
        let conn = open_handle(&store.path, &store, Role::Writer).await.unwrap();
        conn.call(|conn| conn.execute_batch("CREATE TABLE t (id INTEGER); BEGIN; INSERT INTO t VALUES (1);"))
            .await
            .unwrap();

        validate_handle(&conn).await.unwrap();

        let (autocommit, count): (bool, i64) = conn
            .call(|conn| {
                let count = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?;
                Ok::<_, rusqlite::Error>((conn.is_autocommit(), count))
            })
            .await
            .unwrap();
        assert!(autocommit);
        assert_eq!(count, 0);
    }
}
