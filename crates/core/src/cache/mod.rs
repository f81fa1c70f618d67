//! Two-tier query result cache.
//!
//! The memory tier is a keyed index under one lock, bounded by entry count
//! and resident bytes. The optional persisted tier lives in the `query_cache`
//! table of the same store and is reached through the connection pool. A
//! persisted hit is promoted into memory.
//!
//! Values are stored as serialized JSON. Failures in the persisted tier are
//! logged and the cache carries on with memory only; the only error `get`
//! surfaces is the one the compute function returned.

pub mod entry;
pub mod hash;
mod persisted;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::Error;
use crate::config::CacheConfig;
use crate::pool::{ConnectionPool, PooledConnection};
use entry::{CacheEntry, CacheIndex, select_victims};
use persisted::PersistedTier;

pub use entry::Priority;
pub use hash::compute_query_key;

/// Per-call cache options.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Defaults to the configured TTL.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Skip lookup and recompute.
    pub force_refresh: bool,
    pub priority: Priority,
}

/// Where a `get` found its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOrigin {
    Memory,
    Persisted,
    Computed,
}

impl CacheOrigin {
    pub fn is_hit(self) -> bool {
        self != CacheOrigin::Computed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub hits: u64,
    pub memory_hits: u64,
    pub persisted_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub persist_errors: u64,
    pub hit_ratio: f64,
    pub persisted: bool,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persisted_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    persist_errors: AtomicU64,
}

#[derive(Debug)]
pub struct QueryCache {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
    persisted: Option<PersistedTier>,
    counters: Counters,
    /// Bumped when a schema change starts. Values computed or loaded under an
    /// older generation are returned to their caller but never stored.
    generation: AtomicU64,
}

impl QueryCache {
    /// Memory-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            index: Mutex::new(CacheIndex::default()),
            persisted: None,
            counters: Counters::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Cache backed by the store when `persist_to_disk` is set.
    ///
    /// If the persisted table cannot be prepared the cache runs memory-only.
    pub async fn with_store(config: CacheConfig, pool: ConnectionPool) -> Self {
        let mut cache = Self::new(config);
        if !cache.config.persist_to_disk {
            return cache;
        }
        match PersistedTier::open(pool).await {
            Ok(tier) => cache.persisted = Some(tier),
            Err(e) => {
                cache.counters.persist_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "persisted cache unavailable, using memory only");
            }
        }
        cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    pub async fn get<T, F, Fut>(&self, key: &str, compute: F, opts: CacheOptions) -> Result<T, Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.fetch(key, compute, opts).await.map(|(value, _)| value)
    }

    /// Like [`QueryCache::get`], also reporting which tier answered.
    pub async fn fetch<T, F, Fut>(&self, key: &str, compute: F, opts: CacheOptions) -> Result<(T, CacheOrigin), Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let generation = self.generation.load(Ordering::Acquire);
        if !opts.force_refresh
            && let Some(value) = self.lookup(key, generation).await
        {
            return Ok(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let value = compute().await?;
        let compute_time_ms = started.elapsed().as_millis() as u64;

        match serde_json::to_vec(&value) {
            Ok(bytes) => self.store(key, bytes, std::any::type_name::<T>(), compute_time_ms, &opts, generation).await,
            Err(e) => tracing::warn!(key, error = %e, "computed value not cacheable"),
        }
        Ok((value, CacheOrigin::Computed))
    }

    /// Store `value` unconditionally.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, opts: CacheOptions) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value)?;
        let generation = self.generation.load(Ordering::Acquire);
        self.store(key, bytes, std::any::type_name::<T>(), 0, &opts, generation).await;
        Ok(())
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, generation: u64) -> Option<(T, CacheOrigin)> {
        if let Some(bytes) = self.lookup_memory(key) {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some((value, CacheOrigin::Memory));
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "cached value has a different shape, discarding");
                    self.index.lock().remove(key);
                }
            }
        }

        let tier = self.persisted.as_ref()?;
        let row = match tier.load(key).await {
            Ok(row) => row?,
            Err(e) => {
                self.persist_failed("load", &e);
                return None;
            }
        };
        let entry = row.into_entry(key);
        match serde_json::from_slice(&entry.value) {
            Ok(value) => {
                self.counters.persisted_hits.fetch_add(1, Ordering::Relaxed);
                self.insert_memory(entry, generation);
                Some((value, CacheOrigin::Persisted))
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "persisted value has a different shape, recomputing");
                None
            }
        }
    }

    fn lookup_memory(&self, key: &str) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        let mut index = self.index.lock();
        let entry = index.entries.get_mut(key)?;
        if !entry.is_expired(now) {
            entry.hit_count += 1;
            entry.last_accessed = now;
            return Some(Arc::clone(&entry.value));
        }
        index.remove(key);
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn store(
        &self, key: &str, bytes: Vec<u8>, value_type: &str, compute_time_ms: u64, opts: &CacheOptions, generation: u64,
    ) {
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(key, "schema changed while computing, result not cached");
            return;
        }

        let ttl = opts.priority.scale(opts.ttl.unwrap_or_else(|| self.config.default_ttl()));
        let entry =
            CacheEntry::new(key.to_string(), Arc::from(bytes), value_type.to_string(), ttl, compute_time_ms, opts.tags.clone());

        if let Some(tier) = &self.persisted
            && let Err(e) = tier.store(&entry).await
        {
            self.persist_failed("store", &e);
        }
        self.insert_memory(entry, generation);
    }

    fn insert_memory(&self, entry: CacheEntry, generation: u64) {
        let max_entries = self.config.max_entries;
        let max_bytes = self.config.max_memory_bytes;
        let mut index = self.index.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        index.remove(&entry.key);

        if entry.size_bytes > max_bytes {
            tracing::debug!(key = %entry.key, size = entry.size_bytes, "entry larger than memory budget, not kept");
            return;
        }

        if index.over_limit(entry.size_bytes, max_entries, max_bytes) {
            let expired = index.purge_expired(Instant::now());
            self.counters.expirations.fetch_add(expired as u64, Ordering::Relaxed);

            let victims = select_victims(&index, entry.size_bytes, max_entries, max_bytes);
            for key in &victims {
                index.remove(key);
            }
            if !victims.is_empty() {
                self.counters.evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
                tracing::debug!(evicted = victims.len(), remaining = index.entries.len(), "cache eviction pass");
            }
        }

        index.insert(entry);
    }

    /// Remove entries whose key matches `pattern` or that carry any of `tags`.
    ///
    /// With no pattern and no tags, clears the cache. Returns the number of
    /// memory entries removed; the persisted tier is cleaned the same way.
    pub async fn invalidate(&self, pattern: Option<&str>, tags: &[String]) -> Result<usize, Error> {
        let regex = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidInput(format!("invalid invalidation pattern: {e}")))?;

        let removed = {
            let mut index = self.index.lock();
            if regex.is_none() && tags.is_empty() {
                index.retain(|_| false)
            } else {
                index.retain(|entry| !entry.matches(regex.as_ref(), tags))
            }
        };

        if let Some(tier) = &self.persisted {
            match tier.invalidate(regex, tags.to_vec()).await {
                Ok(rows) => tracing::debug!(rows, "invalidated persisted cache rows"),
                Err(e) => self.persist_failed("invalidate", &e),
            }
        }

        tracing::debug!(removed, pattern, tags = ?tags, "cache invalidated");
        Ok(removed)
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) -> usize {
        // A missing pattern cannot fail to compile.
        self.invalidate(None, &[]).await.unwrap_or_default()
    }

    /// Drop expired entries from both tiers. Returns the memory count.
    pub async fn purge_expired(&self) -> usize {
        let removed = self.index.lock().purge_expired(Instant::now());
        self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);

        if let Some(tier) = &self.persisted {
            match tier.purge_expired().await {
                Ok(rows) => tracing::debug!(rows, "purged expired persisted cache rows"),
                Err(e) => self.persist_failed("purge", &e),
            }
        }
        removed
    }

    /// Drop the memory tier ahead of a schema change.
    ///
    /// Lookups and computations already in flight keep their values but no
    /// longer store them. The persisted tier is left for
    /// [`QueryCache::purge_on`], since reaching it needs a lease.
    pub fn begin_schema_change(&self) -> usize {
        let mut index = self.index.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = index.retain(|_| false);
        tracing::debug!(removed, "memory cache cleared for schema change");
        removed
    }

    /// Drop both tiers, deleting persisted rows through `conn`.
    ///
    /// For callers that already hold a writer lease and may not take
    /// another, such as a migration run holding exclusive admission.
    pub async fn purge_on(&self, conn: &PooledConnection) -> usize {
        let removed = self.index.lock().retain(|_| false);
        if self.persisted.is_some() {
            match persisted::purge_on(conn).await {
                Ok(rows) => tracing::debug!(rows, "purged persisted cache rows"),
                Err(e) => self.persist_failed("purge", &e),
            }
        }
        removed
    }

    /// Number of entries in the memory tier.
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.lock().entries.get(key).is_some_and(|e| !e.is_expired(Instant::now()))
    }

    /// Rows in the persisted tier, when one is attached.
    pub async fn persisted_len(&self) -> Option<usize> {
        let tier = self.persisted.as_ref()?;
        match tier.count().await {
            Ok(count) => Some(count),
            Err(e) => {
                self.persist_failed("count", &e);
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, memory_bytes) = {
            let index = self.index.lock();
            (index.entries.len(), index.memory_bytes)
        };
        let c = &self.counters;
        let memory_hits = c.memory_hits.load(Ordering::Relaxed);
        let persisted_hits = c.persisted_hits.load(Ordering::Relaxed);
        let hits = memory_hits + persisted_hits;
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            entries,
            memory_bytes,
            hits,
            memory_hits,
            persisted_hits,
            misses,
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            persist_errors: c.persist_errors.load(Ordering::Relaxed),
            hit_ratio: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            persisted: self.persisted.is_some(),
        }
    }

    fn persist_failed(&self, op: &str, error: &Error) {
        self.counters.persist_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, error = %error, "persisted cache operation failed, continuing with memory tier");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::{PoolConfig, StoreConfig};

    fn memory_cache(max_entries: usize) -> QueryCache {
        QueryCache::new(CacheConfig { max_entries, ..Default::default() })
    }

    fn opts(ttl: Duration) -> CacheOptions {
        CacheOptions { ttl: Some(ttl), ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expiry_recomputes() {
        let cache = memory_cache(100);
        let ttl = Duration::from_secs(10);

        let first: i64 = cache.get("k", || async { Ok(1) }, opts(ttl)).await.unwrap();
        let second: i64 = cache.get("k", || async { Ok(2) }, opts(ttl)).await.unwrap();
        assert_eq!((first, second), (1, 1), "second compute must not run on a hit");

        tokio::time::advance(ttl + Duration::from_millis(1)).await;
        let third: i64 = cache.get("k", || async { Ok(3) }, opts(ttl)).await.unwrap();
        assert_eq!(third, 3);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_still_valid_at_exact_ttl() {
        let cache = memory_cache(10);
        let ttl = Duration::from_secs(5);
        let _: i64 = cache.get("k", || async { Ok(1) }, opts(ttl)).await.unwrap();
        tokio::time::advance(ttl).await;
        assert!(cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_extends_ttl() {
        let cache = memory_cache(10);
        let ttl = Duration::from_secs(10);
        let high = CacheOptions { ttl: Some(ttl), priority: Priority::High, ..Default::default() };
        let low = CacheOptions { ttl: Some(ttl), priority: Priority::Low, ..Default::default() };
        cache.set("high", &1, high).await.unwrap();
        cache.set("low", &1, low).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.contains("high"));
        assert!(!cache.contains("low"));
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!cache.contains("high"));
    }

    #[tokio::test]
    async fn test_compute_error_propagates_and_is_not_cached() {
        let cache = memory_cache(10);
        let result: Result<i64, Error> =
            cache.get("k", || async { Err(Error::InvalidInput("boom".into())) }, CacheOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_force_refresh_recomputes() {
        let cache = memory_cache(10);
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let compute = move || async move { Ok::<_, Error>(calls.fetch_add(1, Ordering::SeqCst) as i64) };
        let _: i64 = cache.get("k", compute, CacheOptions::default()).await.unwrap();
        let refreshed: i64 = cache
            .get("k", compute, CacheOptions { force_refresh: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(refreshed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_size_bound_and_best_entry() {
        let cache = memory_cache(10);
        for i in 0..10i64 {
            let cost = Duration::from_millis(if i == 3 { 500 } else { 5 });
            let compute = move || async move {
                tokio::time::sleep(cost).await;
                Ok(i)
            };
            let _: i64 = cache.get(&format!("k{i}"), compute, CacheOptions::default()).await.unwrap();
        }
        for _ in 0..5 {
            let _: i64 = cache.get("k3", || async { Ok(-1) }, CacheOptions::default()).await.unwrap();
        }

        for i in 10..40 {
            let key = format!("k{i}");
            let _: i64 = cache.get(&key, || async move { Ok(i) }, CacheOptions::default()).await.unwrap();
            assert!(cache.len() <= 10);
        }

        assert!(cache.contains("k3"));
        assert!(cache.stats().evictions >= 30);
    }

    #[tokio::test]
    async fn test_memory_budget_enforced() {
        let cache = QueryCache::new(CacheConfig { max_memory_bytes: 200, ..Default::default() });
        for i in 0..20 {
            cache.set(&format!("key{i}"), &"x".repeat(40), CacheOptions::default()).await.unwrap();
            assert!(cache.stats().memory_bytes <= 200);
        }
        cache.set("huge", &"y".repeat(500), CacheOptions::default()).await.unwrap();
        assert!(!cache.contains("huge"));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_and_tags() {
        let cache = memory_cache(100);
        let tagged = |tag: &str| CacheOptions { tags: vec![tag.to_string()], ..Default::default() };
        cache.set("entries:1", &1, tagged("entries")).await.unwrap();
        cache.set("entries:2", &2, tagged("entries")).await.unwrap();
        cache.set("users:1", &3, tagged("users")).await.unwrap();
        cache.set("stats", &4, CacheOptions::default()).await.unwrap();

        assert_eq!(cache.invalidate(Some("^users:"), &[]).await.unwrap(), 1);
        assert_eq!(cache.invalidate(None, &["entries".to_string()]).await.unwrap(), 2);
        assert!(cache.contains("stats"));
        assert_eq!(cache.invalidate(None, &[]).await.unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().memory_bytes, 0);
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let cache = memory_cache(10);
        assert!(matches!(cache.invalidate(Some("(unclosed"), &[]).await, Err(Error::InvalidInput(_))));
    }

    async fn persisted_cache(dir: &tempfile::TempDir) -> (ConnectionPool, QueryCache) {
        let store = StoreConfig { path: dir.path().join("cache.db"), ..Default::default() };
        let pool = ConnectionPool::open(store, PoolConfig::default()).await.unwrap();
        let config = CacheConfig { persist_to_disk: true, ..Default::default() };
        let cache = QueryCache::with_store(config, pool.clone()).await;
        (pool, cache)
    }

    #[tokio::test]
    async fn test_persisted_tier_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (pool, cache) = persisted_cache(&dir).await;
            assert!(cache.is_persisted());
            let opts = CacheOptions { tags: vec!["entries".into()], ..Default::default() };
            let _: Vec<String> = cache.get("q", || async { Ok(vec!["a".to_string()]) }, opts).await.unwrap();
            pool.shutdown().await;
        }

        let (_pool, cache) = persisted_cache(&dir).await;
        assert!(cache.is_empty());
        let (value, origin): (Vec<String>, _) =
            cache.fetch("q", || async { Ok(vec!["computed".to_string()]) }, CacheOptions::default()).await.unwrap();
        assert_eq!(value, vec!["a".to_string()]);
        assert_eq!(origin, CacheOrigin::Persisted);
        assert!(cache.contains("q"), "persisted hit is promoted to memory");

        assert_eq!(cache.invalidate(None, &["entries".into()]).await.unwrap(), 1);
        assert_eq!(cache.persisted_len().await, Some(0));
    }

    #[tokio::test]
    async fn test_persisted_errors_degrade_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, cache) = persisted_cache(&dir).await;
        let conn = pool.acquire(crate::pool::Role::Writer).await.unwrap();
        conn.execute_batch("DROP TABLE query_cache").await.unwrap();
        drop(conn);

        let value: i64 = cache.get("k", || async { Ok(9) }, CacheOptions::default()).await.unwrap();
        assert_eq!(value, 9);
        assert!(cache.contains("k"));
        assert!(cache.stats().persist_errors >= 1);
    }

    #[tokio::test]
    async fn test_value_computed_across_schema_change_not_stored() {
        let cache = Arc::new(memory_cache(10));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let task = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let compute = move || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, Error>(1_i64)
                };
                cache.fetch("k", compute, CacheOptions::default()).await
            })
        };

        started_rx.await.unwrap();
        cache.set("other", &2, CacheOptions::default()).await.unwrap();
        assert_eq!(cache.begin_schema_change(), 1);
        release_tx.send(()).unwrap();

        let (value, origin) = task.await.unwrap().unwrap();
        assert_eq!((value, origin), (1, CacheOrigin::Computed));
        assert!(!cache.contains("k"), "value computed before the change must not be cached");

        let _: i64 = cache.get("k", || async { Ok(2) }, CacheOptions::default()).await.unwrap();
        assert!(cache.contains("k"));
    }

    #[tokio::test]
    async fn test_purge_on_clears_both_tiers_through_held_writer() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, cache) = persisted_cache(&dir).await;
        cache.set("k", &1, CacheOptions::default()).await.unwrap();
        assert_eq!(cache.persisted_len().await, Some(1));

        let writer = pool.acquire(crate::pool::Role::Writer).await.unwrap();
        assert_eq!(cache.purge_on(&writer).await, 1);
        drop(writer);

        assert!(cache.is_empty());
        assert_eq!(cache.persisted_len().await, Some(0));
        assert_eq!(cache.stats().persist_errors, 0);
    }

    #[tokio::test]
    async fn test_persisted_hit_served_while_writer_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, cache) = persisted_cache(&dir).await;
        let _: i64 = cache.get("k", || async { Ok(5) }, CacheOptions::default()).await.unwrap();

        let config = CacheConfig { persist_to_disk: true, ..Default::default() };
        let cold = QueryCache::with_store(config, pool.clone()).await;
        let writer = pool.acquire(crate::pool::Role::Writer).await.unwrap();

        let (value, origin): (i64, _) = cold.fetch("k", || async { Ok(6) }, CacheOptions::default()).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(origin, CacheOrigin::Persisted);
        drop(writer);
    }
}
