//! Bounded connection pool core
//!
//! This module holds the synchronized set of idle connections and arbitrates
//! concurrent checkout/checkin. All idle/total accounting happens under a
//! single mutex whose critical sections never span connection I/O; blocked
//! checkouts wait on a [`Notify`] signaled by every checkin.

use crate::config::PoolSettings;
use crate::connection::PoolableConnection;
use crate::{PoolError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifetime counters for the pool, snapshot of [`PoolStatsInner`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Total connections established since pool creation
    pub connections_created: u64,
    /// Total connections closed (discarded or shut down)
    pub connections_closed: u64,
    /// Successful checkouts
    pub checkouts: u64,
    /// Checkouts that timed out waiting for an idle connection
    pub checkout_timeouts: u64,
    /// Liveness probes that failed (checkout-time and keepalive sweep)
    pub probes_failed: u64,
}

/// Internal stats tracking, mutated lock-free
#[derive(Debug, Default)]
struct PoolStatsInner {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    checkouts: AtomicU64,
    checkout_timeouts: AtomicU64,
    probes_failed: AtomicU64,
}

impl PoolStatsInner {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            checkout_timeouts: self.checkout_timeouts.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
        }
    }
}

/// One idle connection waiting in the pool
struct IdleEntry<C> {
    conn: C,
    id: u64,
    idle_since: Instant,
    failed_probes: u32,
}

/// Mutable pool state, guarded by a single mutex
struct CoreState<C> {
    idle: Vec<IdleEntry<C>>,
    /// Live connections, idle and checked-out alike
    total: u32,
    closed: bool,
}

/// The bounded, synchronized container of connections
pub struct PoolCore<C: PoolableConnection> {
    id: u64,
    settings: PoolSettings,
    ctx: C::Config,
    state: Mutex<CoreState<C>>,
    /// Signaled on every checkin and freed slot so blocked checkouts retry
    available: Notify,
    next_conn_id: AtomicU64,
    // Lock-free mirrors of the state counters for non-blocking introspection
    idle_count: AtomicUsize,
    total_count: AtomicUsize,
    closed_flag: AtomicBool,
    stats: PoolStatsInner,
}

/// What a checkout attempt decided to do while holding the state lock
enum CheckoutPlan<C> {
    Reuse(IdleEntry<C>),
    Grow,
    Wait,
}

impl<C: PoolableConnection> PoolCore<C> {
    /// Create the pool and eagerly establish `min_size` connections
    pub async fn new(settings: PoolSettings, ctx: C::Config) -> Result<Arc<Self>> {
        settings.validate()?;

        let core = Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            ctx,
            state: Mutex::new(CoreState {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            available: Notify::new(),
            next_conn_id: AtomicU64::new(1),
            idle_count: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
            closed_flag: AtomicBool::new(false),
            stats: PoolStatsInner::default(),
        });

        info!(
            "Initializing connection pool ({}-{} connections)",
            core.settings.min_size, core.settings.max_size
        );

        for _ in 0..core.settings.min_size {
            match C::establish(&core.ctx).await {
                Ok(conn) => core.add_idle(conn),
                Err(e) => {
                    // Startup failures are fatal; close whatever already came up
                    core.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!("Connection pool initialized successfully");
        Ok(core)
    }

    /// Pool identity, used to reject cross-pool handle returns
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Number of idle connections; lock-free
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Relaxed)
    }

    /// Number of checked-out connections; lock-free
    pub fn checked_out_count(&self) -> usize {
        self.total_count
            .load(Ordering::Relaxed)
            .saturating_sub(self.idle_count.load(Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::Relaxed)
    }

    /// Snapshot of the lifetime counters
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    pub(crate) fn record_probe_failure(&self) {
        self.stats.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove and return one connection, blocking up to `timeout` when the
    /// pool is exhausted.
    ///
    /// Grows eagerly up to `max_size` instead of blocking when every existing
    /// connection is checked out but the ceiling has not been reached. A
    /// timed-out checkout leaves the pool counters untouched.
    pub async fn checkout(self: &Arc<Self>, timeout: Duration) -> Result<PoolHandle<C>> {
        let deadline = Instant::now() + timeout;

        loop {
            let plan = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(PoolError::configuration_error(
                        "pool",
                        "pool has been shut down",
                    ));
                }

                if let Some(entry) = state.idle.pop() {
                    self.idle_count.fetch_sub(1, Ordering::Relaxed);
                    CheckoutPlan::Reuse(entry)
                } else if state.total < self.settings.max_size {
                    // Reserve the slot before dropping the lock so concurrent
                    // checkouts can never push total past max_size
                    state.total += 1;
                    self.total_count.fetch_add(1, Ordering::Relaxed);
                    CheckoutPlan::Grow
                } else {
                    CheckoutPlan::Wait
                }
            };

            match plan {
                CheckoutPlan::Reuse(entry) => {
                    self.stats.checkouts.fetch_add(1, Ordering::Relaxed);
                    debug!("Checked out idle connection {}", entry.id);
                    return Ok(PoolHandle::new(entry.conn, entry.id, Arc::clone(self)));
                }
                CheckoutPlan::Grow => match C::establish(&self.ctx).await {
                    Ok(conn) => {
                        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
                        self.stats.checkouts.fetch_add(1, Ordering::Relaxed);
                        debug!("Grew pool with new connection {}", id);
                        return Ok(PoolHandle::new(conn, id, Arc::clone(self)));
                    }
                    Err(e) => {
                        self.release_slot();
                        return Err(e);
                    }
                },
                CheckoutPlan::Wait => {
                    let notified = self.available.notified();
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.stats.checkout_timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(PoolError::pool_exhausted(timeout));
                    }
                    // Woken up; loop around and re-check under the lock
                }
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// A clean return re-enters the idle set and wakes one blocked waiter. A
    /// discard closes the resource and, when the pool has dropped below its
    /// warm floor, establishes a replacement.
    pub(crate) async fn checkin(self: &Arc<Self>, conn: C, id: u64, discard: bool) {
        if discard {
            debug!("Discarding connection {}", id);
            self.retire(conn).await;
            return;
        }

        {
            let mut state = self.lock_state();
            if !state.closed {
                state.idle.push(IdleEntry {
                    conn,
                    id,
                    idle_since: Instant::now(),
                    failed_probes: 0,
                });
                self.idle_count.fetch_add(1, Ordering::Relaxed);
                drop(state);
                self.available.notify_one();
                debug!("Returned connection {} to pool", id);
                return;
            }
            state.total -= 1;
            self.total_count.fetch_sub(1, Ordering::Relaxed);
        }

        // The pool shut down while this connection was checked out
        debug!("Pool closed; closing returned connection {}", id);
        self.close_quietly(conn).await;
    }

    /// Close a connection and restore the warm floor if needed
    async fn retire(self: &Arc<Self>, conn: C) {
        self.release_slot();
        self.close_quietly(conn).await;
        self.replenish().await;
    }

    /// Give up a reserved slot and wake one waiter so it can grow instead
    fn release_slot(&self) {
        {
            let mut state = self.lock_state();
            state.total -= 1;
        }
        self.total_count.fetch_sub(1, Ordering::Relaxed);
        self.available.notify_one();
    }

    /// Establish a fresh connection when the pool is below `min_size`
    async fn replenish(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.closed || state.total >= self.settings.min_size {
                return;
            }
            state.total += 1;
            self.total_count.fetch_add(1, Ordering::Relaxed);
        }

        match C::establish(&self.ctx).await {
            Ok(conn) => {
                self.add_replacement(conn).await;
            }
            Err(e) => {
                self.release_slot();
                warn!(
                    "Failed to replace discarded connection: {}",
                    e.user_message()
                );
            }
        }
    }

    /// Register a newly established connection as idle (startup path; the
    /// slot is not yet reserved)
    fn add_idle(&self, conn: C) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state();
        state.total += 1;
        state.idle.push(IdleEntry {
            conn,
            id,
            idle_since: Instant::now(),
            failed_probes: 0,
        });
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.idle_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a replacement connection whose slot is already reserved
    async fn add_replacement(self: &Arc<Self>, conn: C) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.lock_state();
            if !state.closed {
                state.idle.push(IdleEntry {
                    conn,
                    id,
                    idle_since: Instant::now(),
                    failed_probes: 0,
                });
                self.idle_count.fetch_add(1, Ordering::Relaxed);
                drop(state);
                self.available.notify_one();
                debug!("Replaced discarded connection with {}", id);
                return;
            }
            state.total -= 1;
            self.total_count.fetch_sub(1, Ordering::Relaxed);
        }
        self.close_quietly(conn).await;
    }

    /// Close a connection, logging failures instead of propagating them
    async fn close_quietly(&self, conn: C) {
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.close().await {
            warn!("Failed to close connection: {}", e.user_message());
        }
    }

    /// Bookkeeping-only discard for contexts that cannot run async close.
    /// Dropping the connection still releases its socket.
    pub(crate) fn forget(&self, _conn: C) {
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
    }

    /// Mark the pool terminal and close every idle connection.
    ///
    /// Checked-out connections are force-closed as they come back; close
    /// failures are logged and never halt the sweep.
    pub async fn shutdown(&self) {
        let drained = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            state.total -= drained.len() as u32;
            drained
        };

        self.closed_flag.store(true, Ordering::Relaxed);
        self.idle_count.store(0, Ordering::Relaxed);
        self.total_count.fetch_sub(drained.len(), Ordering::Relaxed);

        // Wake every blocked checkout so it fails fast
        self.available.notify_waiters();

        info!("Closing {} idle connections", drained.len());
        for entry in drained {
            self.close_quietly(entry.conn).await;
        }

        info!("Connection pool shutdown complete");
    }

    /// Spawn the background keepalive sweep.
    ///
    /// Every `keepalive_interval` the sweep probes connections that have been
    /// idle at least that long; a connection accumulating `keepalive_count`
    /// consecutive probe failures is discarded and replaced. The task exits
    /// once the pool closes.
    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let core = Arc::clone(self);
        let interval = Duration::from_secs(core.settings.keepalive_interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly created
            // connections are not probed right away
            ticker.tick().await;

            info!("Starting keepalive sweep with {}s interval", interval.as_secs());

            loop {
                ticker.tick().await;
                if core.is_closed() {
                    break;
                }
                core.sweep_idle(interval).await;
            }

            debug!("Keepalive sweep stopped");
        })
    }

    /// Probe idle connections older than `min_idle_age`, one at a time so
    /// checkouts keep flowing during the sweep
    async fn sweep_idle(self: &Arc<Self>, min_idle_age: Duration) {
        let now = Instant::now();
        let mut budget = self.idle_count();

        while budget > 0 {
            budget -= 1;

            let entry = {
                let mut state = self.lock_state();
                if state.closed {
                    return;
                }
                let due = state
                    .idle
                    .iter()
                    .position(|e| now.duration_since(e.idle_since) >= min_idle_age);
                match due {
                    Some(i) => {
                        self.idle_count.fetch_sub(1, Ordering::Relaxed);
                        state.idle.swap_remove(i)
                    }
                    None => return,
                }
            };

            let IdleEntry {
                mut conn,
                id,
                mut failed_probes,
                ..
            } = entry;

            match conn.ping().await {
                Ok(()) => {
                    failed_probes = 0;
                }
                Err(e) => {
                    failed_probes += 1;
                    self.record_probe_failure();
                    if failed_probes >= self.settings.keepalive_count {
                        warn!(
                            "Connection {} failed {} keepalive probes; discarding: {}",
                            id,
                            failed_probes,
                            e.user_message()
                        );
                        self.retire(conn).await;
                        continue;
                    }
                    debug!(
                        "Connection {} failed keepalive probe {}/{}",
                        id, failed_probes, self.settings.keepalive_count
                    );
                }
            }

            // Put the connection back with a refreshed idle stamp so it is
            // not re-probed until another interval passes
            let leftover = {
                let mut state = self.lock_state();
                if state.closed {
                    state.total -= 1;
                    self.total_count.fetch_sub(1, Ordering::Relaxed);
                    Some(conn)
                } else {
                    state.idle.push(IdleEntry {
                        conn,
                        id,
                        idle_since: Instant::now(),
                        failed_probes,
                    });
                    self.idle_count.fetch_add(1, Ordering::Relaxed);
                    None
                }
            };
            if let Some(conn) = leftover {
                self.close_quietly(conn).await;
                return;
            }
            self.available.notify_one();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One live connection checked out of the pool, exclusively owned by the
/// caller until released.
///
/// Dropping a handle without going through the manager's `release` treats the
/// connection as possibly contaminated: it is discarded and replaced, never
/// silently re-pooled.
pub struct PoolHandle<C: PoolableConnection> {
    conn: Option<C>,
    id: u64,
    core: Arc<PoolCore<C>>,
}

impl<C: PoolableConnection> PoolHandle<C> {
    fn new(conn: C, id: u64, core: Arc<PoolCore<C>>) -> Self {
        Self {
            conn: Some(conn),
            id,
            core,
        }
    }

    /// Unique id of the underlying connection
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the pool this handle belongs to
    pub fn pool_id(&self) -> u64 {
        self.core.id()
    }

    /// Access the underlying connection
    pub fn conn_mut(&mut self) -> &mut C {
        self.conn
            .as_mut()
            .expect("connection already taken from handle")
    }

    /// Take ownership of the connection, disarming the drop guard
    pub(crate) fn into_parts(mut self) -> (C, u64, Arc<PoolCore<C>>) {
        let conn = self
            .conn
            .take()
            .expect("connection already taken from handle");
        (conn, self.id, Arc::clone(&self.core))
    }
}

impl<C: PoolableConnection> std::fmt::Debug for PoolHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.id)
            .field("pool_id", &self.core.id())
            .finish_non_exhaustive()
    }
}

impl<C: PoolableConnection> Drop for PoolHandle<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "Connection {} dropped without release; discarding",
                self.id
            );
            let core = Arc::clone(&self.core);
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    debug!("Scheduling async discard for connection {}", self.id);
                    rt.spawn(async move { core.retire(conn).await });
                }
                Err(_) => {
                    debug!(
                        "No runtime available for connection {}; dropping it synchronously",
                        self.id
                    );
                    core.forget(conn);
                }
            }
        }
    }
}
