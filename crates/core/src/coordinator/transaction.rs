//! Transaction scopes handed to [`super::ExecutionCoordinator::transaction`]
//! callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_rusqlite::{Connection, rusqlite};

use crate::Error;
use crate::rows::{Rows, SqlValue, run_statement};

/// How the transaction takes its locks.
///
/// SQLite has no isolation levels as such; transactions are serializable and
/// only differ in when the write lock is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Lock on first read or write.
    #[default]
    Deferred,
    /// Take the write lock at `BEGIN`.
    Immediate,
    /// Take the write lock at `BEGIN` and keep readers out (rollback journals).
    Exclusive,
}

impl Isolation {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            Isolation::Deferred => "BEGIN DEFERRED",
            Isolation::Immediate => "BEGIN IMMEDIATE",
            Isolation::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Per-call transaction options. Unset fields fall back to the configured
/// retry policy.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: Isolation,
    pub max_retries: Option<u32>,
    /// Linear backoff step between attempts.
    pub retry_delay: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Handle to an open transaction.
///
/// Cheap to clone. Every method fails with [`Error::TransactionClosed`] once
/// the transaction has committed or rolled back.
#[derive(Clone)]
pub struct Transaction {
    handle: Connection,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("open", &self.is_open()).finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(handle: Connection) -> (Self, Arc<AtomicBool>) {
        let open = Arc::new(AtomicBool::new(true));
        (Self { handle, open: Arc::clone(&open) }, open)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() { Ok(()) } else { Err(Error::TransactionClosed) }
    }

    /// Run a closure on the transaction's connection.
    pub async fn call<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_open()?;
        self.handle.call(f).await.map_err(Error::from)
    }

    /// Run a statement that returns rows.
    pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Rows, Error> {
        let sql = sql.to_string();
        self.call(move |conn| run_statement(conn, &sql, &params).map_err(Error::from)).await
    }

    /// Run a write. Returns the number of rows changed.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<usize, Error> {
        let sql = sql.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statements() {
        assert_eq!(Isolation::default().begin_sql(), "BEGIN DEFERRED");
        assert_eq!(Isolation::Immediate.begin_sql(), "BEGIN IMMEDIATE");
        assert_eq!(Isolation::Exclusive.begin_sql(), "BEGIN EXCLUSIVE");
    }

    #[tokio::test]
    async fn test_closed_handle_is_rejected() {
        let conn = Connection::open_in_memory().await.unwrap();
        let (tx, open) = Transaction::new(conn);
        assert_eq!(tx.query("SELECT 1 AS one", Vec::new()).await.unwrap().len(), 1);

        open.store(false, Ordering::Release);
        assert!(matches!(tx.query("SELECT 1", Vec::new()).await, Err(Error::TransactionClosed)));
        assert!(matches!(tx.execute("SELECT 1", Vec::new()).await, Err(Error::TransactionClosed)));
    }
}
