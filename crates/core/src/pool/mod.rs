//! Bounded reader/writer connection pool.
//!
//! Connections are split into two roles with separate limits. Callers that
//! find no idle handle and no spare capacity join a single FIFO queue; a
//! released handle (or a freed slot) goes to the longest-waiting caller of the
//! same role before anything new is opened.
//!
//! Capacity is tracked with [`Reservation`]s: every unit of `active` capacity
//! is owned by exactly one reservation or lease, and dropping either gives the
//! unit back. That keeps a cancelled `acquire` from leaking capacity or a
//! handle, wherever it was interrupted.

pub mod connection;
mod maintenance;

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedRwLockWriteGuard, RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::Error;
use crate::config::{PoolConfig, StoreConfig};
use connection::{Slot, open_handle, validate_handle};

pub use connection::{ConnectionInfo, PooledConnection};
pub use maintenance::MaintenanceReport;

/// Pool classification of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    fn index(self) -> usize {
        match self {
            Role::Reader => 0,
            Role::Writer => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-role occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleStats {
    pub active: usize,
    pub idle: usize,
    pub max: usize,
}

/// Point-in-time pool occupancy. `active + idle == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub waiting: usize,
    pub readers: RoleStats,
    pub writers: RoleStats,
    pub created: u64,
    pub closed: u64,
    pub validation_failures: u64,
    pub timeouts: u64,
    pub draining: bool,
}

struct Waiter {
    id: u64,
    role: Role,
    grant: oneshot::Sender<Reservation>,
}

#[derive(Default)]
struct PoolState {
    idle: [VecDeque<Slot>; 2],
    /// Leased handles plus capacity reserved by callers that are opening or
    /// validating a handle.
    active: [usize; 2],
    waiters: VecDeque<Waiter>,
    draining: bool,
    next_waiter: u64,
}

impl PoolState {
    fn total(&self, role: Role) -> usize {
        self.active[role.index()] + self.idle[role.index()].len()
    }

    fn active_total(&self) -> usize {
        self.active.iter().sum()
    }
}

#[derive(Default)]
struct Counters {
    next_id: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    validation_failures: AtomicU64,
    timeouts: AtomicU64,
}

pub(crate) struct PoolInner {
    path: PathBuf,
    store: StoreConfig,
    config: PoolConfig,
    state: Mutex<PoolState>,
    counters: Counters,
    released: Notify,
    admission: Arc<RwLock<()>>,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInner").field("path", &self.path).finish_non_exhaustive()
    }
}

/// One unit of `active` capacity for a role, optionally carrying the handle
/// that fills it. Dropping an armed reservation returns it to the pool.
struct Reservation {
    pool: Arc<PoolInner>,
    role: Role,
    slot: Option<Slot>,
    armed: bool,
}

impl Reservation {
    fn new(pool: &Arc<PoolInner>, role: Role, slot: Option<Slot>) -> Self {
        Self { pool: Arc::clone(pool), role, slot, armed: true }
    }

    /// Give up ownership of the capacity unit without returning it.
    fn disarm(mut self) -> Option<Slot> {
        self.armed = false;
        self.slot.take()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.slot.take() {
            Some(slot) => self.pool.release_slot(slot),
            None => self.pool.free_reserved(self.role),
        }
    }
}

/// Exclusive admission held by the migration orchestrator.
///
/// While it is held, regular `acquire` calls queue; the holder acquires
/// through [`ConnectionPool::acquire_exclusive`].
pub struct AdmissionGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

enum Checkout {
    Ready(Reservation),
    Wait(u64, oneshot::Receiver<Reservation>),
}

impl PoolInner {
    fn max(&self, role: Role) -> usize {
        match role {
            Role::Reader => self.config.max_readers,
            Role::Writer => self.config.max_writers,
        }
    }

    /// Offer a reservation to the longest-waiting caller of its role.
    ///
    /// Returns it when nobody took it. Callers hold the state lock, so a
    /// rejected grant must come back here rather than being dropped.
    fn hand_off(state: &mut PoolState, mut reservation: Reservation) -> Option<Reservation> {
        while let Some(pos) = state.waiters.iter().position(|w| w.role == reservation.role) {
            let Some(waiter) = state.waiters.remove(pos) else { break };
            match waiter.grant.send(reservation) {
                Ok(()) => {
                    tracing::trace!(waiter = waiter.id, "handed connection to waiting caller");
                    return None;
                }
                Err(back) => reservation = back,
            }
        }
        Some(reservation)
    }

    /// Return a leased handle.
    pub(crate) fn release_slot(self: &Arc<Self>, mut slot: Slot) {
        let now = Instant::now();
        let role = slot.role;
        slot.last_used_at = now;
        if self.config.validate_on_acquire {
            slot.needs_validation = true;
        }
        if now.saturating_duration_since(slot.created_at) >= self.config.max_lifetime() {
            slot.needs_replacement = true;
        }

        let mut state = self.state.lock();
        if state.draining {
            state.active[role.index()] -= 1;
            drop(state);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            drop(slot);
            self.released.notify_waiters();
            return;
        }

        let reservation = Reservation::new(self, role, Some(slot));
        if let Some(unclaimed) = Self::hand_off(&mut state, reservation) {
            if let Some(slot) = unclaimed.disarm() {
                state.idle[role.index()].push_back(slot);
            }
            state.active[role.index()] -= 1;
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Return a capacity unit that never got (or lost) its handle.
    fn free_reserved(self: &Arc<Self>, role: Role) {
        let mut state = self.state.lock();
        if state.draining {
            state.active[role.index()] -= 1;
        } else if let Some(unclaimed) = Self::hand_off(&mut state, Reservation::new(self, role, None)) {
            unclaimed.disarm();
            state.active[role.index()] -= 1;
        }
        drop(state);
        self.released.notify_waiters();
    }

    async fn open_slot(&self, role: Role) -> Result<Slot, Error> {
        let handle = open_handle(&self.path, &self.store, role).await?;
        let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = id, %role, "opened store connection");
        Ok(Slot::new(id, role, handle))
    }

    /// Make a reused handle fit for a new lease, replacing it if needed.
    async fn ready(&self, mut slot: Slot) -> Result<Slot, Error> {
        if slot.needs_replacement {
            tracing::debug!(connection = slot.id, role = %slot.role, "replacing connection past max lifetime");
            let role = slot.role;
            self.close_slot(slot).await;
            return self.open_slot(role).await;
        }

        if slot.needs_validation {
            if let Err(e) = validate_handle(&slot.handle).await {
                self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(connection = slot.id, error = %e, "connection failed validation, replacing");
                let role = slot.role;
                self.close_slot(slot).await;
                return self
                    .open_slot(role)
                    .await
                    .map_err(|e| Error::ConnectionValidation(format!("replacement failed: {e}")));
            }
            slot.needs_validation = false;
        }

        Ok(slot)
    }

    async fn close_slot(&self, slot: Slot) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = slot.handle.close().await {
            tracing::warn!(connection = slot.id, error = %e, "error closing store connection");
        }
    }

    fn begin_checkout(self: &Arc<Self>, role: Role, wait: bool) -> Result<Checkout, Error> {
        let mut state = self.state.lock();
        if state.draining {
            return Err(Error::PoolDraining);
        }
        if let Some(slot) = state.idle[role.index()].pop_back() {
            state.active[role.index()] += 1;
            return Ok(Checkout::Ready(Reservation::new(self, role, Some(slot))));
        }
        if state.total(role) < self.max(role) {
            state.active[role.index()] += 1;
            return Ok(Checkout::Ready(Reservation::new(self, role, None)));
        }
        if !wait {
            return Err(Error::PoolExhausted { role });
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        let (grant, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, role, grant });
        Ok(Checkout::Wait(id, rx))
    }

    fn abandon_wait(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
        }
    }
}

/// Removes a queued waiter when its `acquire` gives up or is cancelled.
struct QueuedWaiter<'a> {
    pool: &'a PoolInner,
    id: u64,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        self.pool.abandon_wait(self.id);
    }
}

impl PoolInner {
    async fn checkout(self: &Arc<Self>, role: Role, deadline: Option<Instant>) -> Result<PooledConnection, Error> {
        let started = Instant::now();
        let mut reservation = match self.begin_checkout(role, deadline.is_some())? {
            Checkout::Ready(reservation) => reservation,
            Checkout::Wait(id, mut rx) => {
                let queued = QueuedWaiter { pool: self, id };
                let deadline = deadline.unwrap_or(started);
                match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(Ok(reservation)) => reservation,
                    Ok(Err(_)) => return Err(Error::PoolDraining),
                    Err(_) => {
                        drop(queued);
                        // A grant that raced the deadline returns itself on drop.
                        drop(rx);
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        let waited_ms = started.elapsed().as_millis() as u64;
                        tracing::warn!(%role, waited_ms, "timed out waiting for a connection");
                        return Err(Error::PoolTimeout { role, waited_ms });
                    }
                }
            }
        };

        let slot = match reservation.slot.take() {
            Some(slot) => self.ready(slot).await?,
            None => self.open_slot(role).await?,
        };
        reservation.disarm();
        Ok(PooledConnection::new(slot, Arc::clone(self)))
    }
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open a pool over the store at `store.path`.
    ///
    /// One writer is opened eagerly: it creates the file and switches the
    /// journal mode before any reader connects. Starts the maintenance ticker.
    pub async fn open(store: StoreConfig, config: PoolConfig) -> Result<Self, Error> {
        let pool = Self::build(store, config);
        let writer = pool.acquire(Role::Writer).await?;
        drop(writer);
        pool.start_maintenance();

        tracing::info!(
            path = %pool.inner.path.display(),
            max_readers = pool.inner.config.max_readers,
            max_writers = pool.inner.config.max_writers,
            "connection pool opened"
        );
        Ok(pool)
    }

    fn build(store: StoreConfig, config: PoolConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = PoolInner {
            path: store.path.clone(),
            store,
            config,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
            released: Notify::new(),
            admission: Arc::new(RwLock::new(())),
            shutdown,
            ticker: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection, waiting up to the configured acquire timeout.
    pub async fn acquire(&self, role: Role) -> Result<PooledConnection, Error> {
        self.acquire_timeout(role, self.inner.config.acquire_timeout()).await
    }

    /// Lease a connection, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, role: Role, timeout: Duration) -> Result<PooledConnection, Error> {
        let started = Instant::now();
        let deadline = started + timeout;
        let Ok(_admitted) = tokio::time::timeout_at(deadline, self.inner.admission.read()).await else {
            self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::PoolTimeout { role, waited_ms: started.elapsed().as_millis() as u64 });
        };
        self.inner.checkout(role, Some(deadline)).await
    }

    /// Lease a connection only if one is free right now.
    pub async fn try_acquire(&self, role: Role) -> Result<PooledConnection, Error> {
        let Ok(_admitted) = self.inner.admission.try_read() else {
            return Err(Error::PoolExhausted { role });
        };
        self.inner.checkout(role, None).await
    }

    /// Return a lease. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Stop admitting regular `acquire` calls until the guard is dropped.
    ///
    /// Waits for in-progress acquisitions to finish; leases already handed
    /// out are unaffected.
    pub async fn exclusive(&self) -> AdmissionGuard {
        let guard = Arc::clone(&self.inner.admission).write_owned().await;
        tracing::debug!("pool admission paused");
        AdmissionGuard { _guard: guard }
    }

    /// Lease a connection while holding exclusive admission.
    pub async fn acquire_exclusive(&self, role: Role, _guard: &AdmissionGuard) -> Result<PooledConnection, Error> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout();
        self.inner.checkout(role, Some(deadline)).await
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let role_stats = |role: Role| RoleStats {
            active: state.active[role.index()],
            idle: state.idle[role.index()].len(),
            max: self.inner.max(role),
        };
        let readers = role_stats(Role::Reader);
        let writers = role_stats(Role::Writer);
        let counters = &self.inner.counters;

        PoolStats {
            active: readers.active + writers.active,
            idle: readers.idle + writers.idle,
            total: readers.active + writers.active + readers.idle + writers.idle,
            waiting: state.waiters.len(),
            readers,
            writers,
            created: counters.created.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            validation_failures: counters.validation_failures.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            draining: state.draining,
        }
    }

    /// Stop handing out connections, wait for every lease to come back, then
    /// close all handles.
    ///
    /// Queued callers fail with [`Error::PoolDraining`], as do later ones.
    pub async fn drain(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.draining = true;
            std::mem::take(&mut state.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!(count = waiters.len(), "failing queued acquire calls");
        }
        drop(waiters);

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let active = self.inner.state.lock().active_total();
            if active == 0 {
                break;
            }
            tracing::debug!(active, "waiting for leased connections before closing");
            notified.await;
        }

        let idle: Vec<Slot> = {
            let mut state = self.inner.state.lock();
            state.idle.iter_mut().flat_map(std::mem::take).collect()
        };
        let count = idle.len();
        for slot in idle {
            self.inner.close_slot(slot).await;
        }
        tracing::info!(closed = count, "connection pool drained");
    }

    /// Stop the maintenance ticker and drain.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let ticker = self.inner.ticker.lock().take();
        if let Some(ticker) = ticker
            && let Err(e) = ticker.await
        {
            tracing::warn!(error = %e, "maintenance task ended abnormally");
        }
        self.drain().await;
    }
}
