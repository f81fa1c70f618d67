//! Periodic pool upkeep: closing idle and over-age handles.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::Slot;
use super::{ConnectionPool, Role};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub closed_idle: usize,
    pub closed_expired: usize,
    /// Writers kept past their lifetime because they were the last one.
    pub marked_for_replacement: usize,
}

impl ConnectionPool {
    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.maintain_at(Instant::now()).await
    }

    /// Close idle handles that sat unused past the idle timeout or outlived
    /// the max lifetime, as judged at `now`.
    ///
    /// At least one writer is always kept. A last writer past its lifetime is
    /// flagged instead, and its next lease reopens it.
    pub(crate) async fn maintain_at(&self, now: Instant) -> MaintenanceReport {
        let (stale, report) = self.collect_stale(now);
        for slot in stale {
            self.inner.close_slot(slot).await;
        }
        if report != MaintenanceReport::default() {
            tracing::debug!(
                closed_idle = report.closed_idle,
                closed_expired = report.closed_expired,
                marked_for_replacement = report.marked_for_replacement,
                "pool maintenance pass"
            );
        }
        report
    }

    fn collect_stale(&self, now: Instant) -> (Vec<Slot>, MaintenanceReport) {
        let config = &self.inner.config;
        let mut report = MaintenanceReport::default();
        let mut stale = Vec::new();

        let mut state = self.inner.state.lock();
        if state.draining {
            return (stale, report);
        }
        let mut writers_left = state.total(Role::Writer);

        for role in [Role::Reader, Role::Writer] {
            let idle = std::mem::take(&mut state.idle[role.index()]);
            for mut slot in idle {
                let expired = now.saturating_duration_since(slot.created_at) >= config.max_lifetime();
                let unused = now.saturating_duration_since(slot.last_used_at) >= config.idle_timeout();
                if !expired && !unused {
                    state.idle[role.index()].push_back(slot);
                    continue;
                }

                if role == Role::Writer {
                    if writers_left <= 1 {
                        if expired && !slot.needs_replacement {
                            slot.needs_replacement = true;
                            report.marked_for_replacement += 1;
                        }
                        state.idle[role.index()].push_back(slot);
                        continue;
                    }
                    writers_left -= 1;
                }

                if expired {
                    report.closed_expired += 1;
                } else {
                    report.closed_idle += 1;
                }
                stale.push(slot);
            }
        }

        (stale, report)
    }

    pub(crate) fn start_maintenance(&self) {
        let pool = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval();
        let mut shutdown = self.inner.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = pool.upgrade() else { break };
                        ConnectionPool { inner }.run_maintenance().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("pool maintenance stopped");
        });

        *self.inner.ticker.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{PoolConfig, StoreConfig};

    async fn test_pool(config: PoolConfig) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig { path: dir.path().join("maint.db"), ..Default::default() };
        let pool = ConnectionPool::open(store, config).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_idle_readers_closed_after_timeout() {
        let config = PoolConfig { idle_timeout_ms: 1_000, max_lifetime_ms: 60_000, ..Default::default() };
        let (_dir, pool) = test_pool(config).await;
        let a = pool.acquire(Role::Reader).await.unwrap();
        let b = pool.acquire(Role::Reader).await.unwrap();
        drop((a, b));
        assert_eq!(pool.stats().readers.idle, 2);

        let report = pool.maintain_at(Instant::now()).await;
        assert_eq!(report, MaintenanceReport::default());

        let report = pool.maintain_at(Instant::now() + Duration::from_secs(2)).await;
        assert_eq!(report.closed_idle, 2);
        let stats = pool.stats();
        assert_eq!(stats.readers.idle, 0);
        assert_eq!(stats.writers.idle, 1, "last writer is kept");
    }

    #[tokio::test]
    async fn test_last_writer_marked_instead_of_closed() {
        let config = PoolConfig { idle_timeout_ms: 1_000, max_lifetime_ms: 1_000, ..Default::default() };
        let (_dir, pool) = test_pool(config).await;
        let before = pool.acquire(Role::Writer).await.unwrap().id();

        let report = pool.maintain_at(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(report.marked_for_replacement, 1);
        assert_eq!(report.closed_expired, 0);
        assert_eq!(pool.stats().writers.idle, 1);

        let after = pool.acquire(Role::Writer).await.unwrap().id();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_extra_writers_closed_when_expired() {
        let config =
            PoolConfig { max_writers: 2, idle_timeout_ms: 1_000, max_lifetime_ms: 1_000, ..Default::default() };
        let (_dir, pool) = test_pool(config).await;
        let a = pool.acquire(Role::Writer).await.unwrap();
        let b = pool.acquire(Role::Writer).await.unwrap();
        drop((a, b));

        let report = pool.maintain_at(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(report.closed_expired, 1);
        assert_eq!(report.marked_for_replacement, 1);
        assert_eq!(pool.stats().writers.idle, 1);
    }

    #[tokio::test]
    async fn test_leased_connections_untouched() {
        let config = PoolConfig { idle_timeout_ms: 1_000, max_lifetime_ms: 60_000, ..Default::default() };
        let (_dir, pool) = test_pool(config).await;
        let held = pool.acquire(Role::Reader).await.unwrap();

        let report = pool.maintain_at(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(report.closed_idle, 0);
        assert_eq!(pool.stats().readers.active, 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticker_and_closes_handles() {
        let config = PoolConfig { maintenance_interval_ms: 10, ..Default::default() };
        let (_dir, pool) = test_pool(config).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.shutdown().await;
        assert!(pool.inner.ticker.lock().is_none());
        assert_eq!(pool.stats().total, 0);
    }
}
