//! Persisted cache tier stored in the `query_cache` table.
//!
//! Reads go through reader leases and writes through writer leases of the
//! shared pool. Timestamps are wall-clock RFC 3339 strings with fixed
//! millisecond precision so they compare correctly as text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::entry::CacheEntry;
use crate::Error;
use crate::pool::{ConnectionPool, PooledConnection, Role};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS query_cache (
    cache_key TEXT PRIMARY KEY,
    value_data BLOB NOT NULL,
    value_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    data_size INTEGER NOT NULL,
    compression_used INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]',
    compute_time_ms INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_query_cache_expires ON query_cache(expires_at);
";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A row loaded from the persisted tier, ready to be promoted.
#[derive(Debug)]
pub(crate) struct PersistedRow {
    pub(crate) value: Vec<u8>,
    pub(crate) value_type: String,
    pub(crate) remaining: Duration,
    pub(crate) hit_count: u64,
    pub(crate) tags: Vec<String>,
    pub(crate) compute_time_ms: u64,
}

impl PersistedRow {
    pub(crate) fn into_entry(self, key: &str) -> CacheEntry {
        let mut entry = CacheEntry::new(
            key.to_string(),
            Arc::from(self.value),
            self.value_type,
            self.remaining,
            self.compute_time_ms,
            self.tags,
        );
        entry.hit_count = self.hit_count;
        entry
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PersistedTier {
    pool: ConnectionPool,
}

impl PersistedTier {
    /// Create the table if needed.
    pub(crate) async fn open(pool: ConnectionPool) -> Result<Self, Error> {
        let conn = pool.acquire(Role::Writer).await?;
        conn.execute_batch(SCHEMA).await?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Load an unexpired entry and record the hit when a writer is free.
    pub(crate) async fn load(&self, key: &str) -> Result<Option<PersistedRow>, Error> {
        let now = Utc::now();
        let key_owned = key.to_string();
        let now_text = timestamp(now);

        let conn = self.pool.acquire(Role::Reader).await?;
        let found = conn
            .call(move |conn| -> Result<_, Error> {
                let row = conn
                    .query_row(
                        "SELECT value_data, value_type, expires_at, hit_count, tags, compute_time_ms
                         FROM query_cache WHERE cache_key = ?1 AND expires_at > ?2",
                        params![key_owned, now_text],
                        |row| {
                            Ok((
                                row.get::<_, Vec<u8>>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, i64>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, i64>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        drop(conn);

        let Some((value, value_type, expires_at, hit_count, tags, compute_time_ms)) = found else {
            return Ok(None);
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|e| Error::InvalidInput(format!("bad expires_at for cache key {key}: {e}")))?
            .with_timezone(&Utc);
        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
        let tags: Vec<String> = serde_json::from_str(&tags)?;

        if let Err(e) = self.touch(key, now).await {
            tracing::debug!(key, error = %e, "persisted cache hit not recorded");
        }

        Ok(Some(PersistedRow {
            value,
            value_type,
            remaining,
            hit_count: hit_count.max(0) as u64 + 1,
            tags,
            compute_time_ms: compute_time_ms.max(0) as u64,
        }))
    }

    async fn touch(&self, key: &str, now: DateTime<Utc>) -> Result<(), Error> {
        let key = key.to_string();
        let now = timestamp(now);
        let conn = self.pool.try_acquire(Role::Writer).await?;
        conn.call(move |conn| {
            conn.execute(
                "UPDATE query_cache SET hit_count = hit_count + 1, last_accessed = ?2 WHERE cache_key = ?1",
                params![key, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Insert or replace the row for `entry`.
    pub(crate) async fn store(&self, entry: &CacheEntry) -> Result<(), Error> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(entry.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let key = entry.key.clone();
        let value = entry.value.to_vec();
        let value_type = entry.value_type.clone();
        let tags = serde_json::to_string(&entry.tags)?;
        let compute_time_ms = entry.compute_time_ms as i64;
        let (created, expires) = (timestamp(now), timestamp(expires_at));

        let conn = self.pool.acquire(Role::Writer).await?;
        conn.call(move |conn| {
            let size = value.len() as i64;
            conn.execute(
                "INSERT INTO query_cache (
                    cache_key, value_data, value_type, created_at, expires_at,
                    hit_count, last_accessed, data_size, compression_used, tags, compute_time_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?4, ?6, 0, ?7, ?8)
                ON CONFLICT(cache_key) DO UPDATE SET
                    value_data = excluded.value_data,
                    value_type = excluded.value_type,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    hit_count = 0,
                    last_accessed = excluded.last_accessed,
                    data_size = excluded.data_size,
                    tags = excluded.tags,
                    compute_time_ms = excluded.compute_time_ms",
                params![key, value, value_type, created, expires, size, tags, compute_time_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete rows whose key matches `pattern` or that carry any of `tags`.
    /// With neither, delete everything.
    pub(crate) async fn invalidate(&self, pattern: Option<Regex>, tags: Vec<String>) -> Result<usize, Error> {
        let conn = self.pool.acquire(Role::Writer).await?;
        conn.call(move |conn| {
            if pattern.is_none() && tags.is_empty() {
                return Ok(conn.execute("DELETE FROM query_cache", [])?);
            }

            let tx = conn.transaction()?;
            let doomed: Vec<String> = {
                let mut stmt = tx.prepare("SELECT cache_key, tags FROM query_cache")?;
                let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
                let mut doomed = Vec::new();
                for row in rows {
                    let (key, row_tags) = row?;
                    let row_tags: Vec<String> = serde_json::from_str(&row_tags).unwrap_or_default();
                    let by_pattern = pattern.as_ref().is_some_and(|re| re.is_match(&key));
                    if by_pattern || row_tags.iter().any(|t| tags.contains(t)) {
                        doomed.push(key);
                    }
                }
                doomed
            };
            {
                let mut delete = tx.prepare("DELETE FROM query_cache WHERE cache_key = ?1")?;
                for key in &doomed {
                    delete.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(doomed.len())
        })
        .await
    }

    pub(crate) async fn purge_expired(&self) -> Result<usize, Error> {
        let now = timestamp(Utc::now());
        let conn = self.pool.acquire(Role::Writer).await?;
        conn.call(move |conn| Ok(conn.execute("DELETE FROM query_cache WHERE expires_at <= ?1", params![now])?))
            .await
    }

    pub(crate) async fn count(&self) -> Result<usize, Error> {
        let conn = self.pool.acquire(Role::Reader).await?;
        conn.call(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM query_cache", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

/// Delete every row through a writer lease the caller already holds.
pub(crate) async fn purge_on(conn: &PooledConnection) -> Result<usize, Error> {
    conn.call(|conn| Ok(conn.execute("DELETE FROM query_cache", [])?)).await
}
