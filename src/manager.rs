//! Pool Manager: the public acquire/release/status/shutdown surface
//!
//! The manager owns the lazy initialize-once lifecycle around [`PoolCore`],
//! applies the health-check-and-replace policy at every acquire, and provides
//! [`PoolManager::with_connection`], the sanctioned scoped-acquisition path
//! that guarantees exactly-once release on every exit.
//!
//! Construct one manager at the process composition root and hand it by
//! reference to every collaborator that needs a connection; it replaces the
//! original codebase's scattered direct-connect fallbacks, which bypassed the
//! pool's accounting entirely.

use crate::config::{Config, PoolSettings};
use crate::connection::{PoolableConnection, RedshiftConnection};
use crate::pool::{PoolCore, PoolHandle, PoolStats};
use crate::{PoolError, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Read-only pool introspection, consumed by health-check endpoints.
/// Never blocks on pool contention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub initialized: bool,
    pub min_size: u32,
    pub max_size: u32,
    pub idle: usize,
    pub checked_out: usize,
}

/// Manager lifecycle: uninitialized until the first acquire, terminal after
/// shutdown
enum ManagerState<C: PoolableConnection> {
    Uninitialized,
    Ready(Arc<PoolCore<C>>),
    Terminated,
}

/// Long-lived coordinator around the pool core
pub struct PoolManager<C: PoolableConnection = RedshiftConnection> {
    settings: PoolSettings,
    ctx: C::Config,
    state: RwLock<ManagerState<C>>,
}

impl PoolManager<RedshiftConnection> {
    /// Create a manager for the configured Redshift cluster.
    ///
    /// Configuration errors surface here, before any connection attempt; the
    /// pool itself is initialized lazily on first acquire.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_context(config.pool.clone(), config))
    }
}

impl<C: PoolableConnection> PoolManager<C>
where
    C::Config: Clone,
{
    /// Create a manager over an arbitrary connection type
    pub fn with_context(settings: PoolSettings, ctx: C::Config) -> Self {
        Self {
            settings,
            ctx,
            state: RwLock::new(ManagerState::Uninitialized),
        }
    }

    /// Get the pool core, initializing it exactly once.
    ///
    /// Steady-state acquisition takes only the uncontended read path; the
    /// write lock is reached once per process lifetime (plus retries after a
    /// failed first initialization).
    async fn core(&self) -> Result<Arc<PoolCore<C>>> {
        {
            let state = self.state.read().await;
            match &*state {
                ManagerState::Ready(core) => return Ok(Arc::clone(core)),
                ManagerState::Terminated => return Err(self.terminated_error()),
                ManagerState::Uninitialized => {}
            }
        }

        let mut state = self.state.write().await;
        // Double-check: another task may have initialized while we waited
        match &*state {
            ManagerState::Ready(core) => return Ok(Arc::clone(core)),
            ManagerState::Terminated => return Err(self.terminated_error()),
            ManagerState::Uninitialized => {}
        }

        info!("Initializing pool manager");
        let core = PoolCore::new(self.settings.clone(), self.ctx.clone()).await?;
        *state = ManagerState::Ready(Arc::clone(&core));

        Ok(core)
    }

    fn terminated_error(&self) -> PoolError {
        PoolError::configuration_error("pool", "pool manager has been shut down")
    }

    /// Acquire a validated connection, blocking up to `timeout`.
    ///
    /// The returned handle passed a liveness probe. A handle that fails its
    /// probe is discarded and the checkout retried exactly once with the
    /// remaining time budget; a second failure surfaces as
    /// [`PoolError::Unavailable`] so the caller can fail its own request
    /// instead of looping against a degraded backend.
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolHandle<C>> {
        let core = self.core().await?;
        let deadline = Instant::now() + timeout;
        let mut last_error: Option<PoolError> = None;

        for attempt in 0..2 {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let mut handle = match core.checkout(remaining).await {
                Ok(handle) => handle,
                Err(e @ PoolError::Exhausted { .. }) | Err(e @ PoolError::Configuration { .. }) => {
                    return Err(e);
                }
                Err(e) => {
                    // A failed eager-growth connect gets the same single retry
                    // as a failed probe
                    if attempt == 0 {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(PoolError::backend_unavailable(e.user_message()));
                }
            };

            match handle.conn_mut().ping().await {
                Ok(()) => {
                    debug!("Acquired connection {} (attempt {})", handle.id(), attempt + 1);
                    return Ok(handle);
                }
                Err(e) => {
                    core.record_probe_failure();
                    warn!(
                        "Health check failed for connection {}: {}",
                        handle.id(),
                        e.user_message()
                    );
                    let (conn, id, owner) = handle.into_parts();
                    owner.checkin(conn, id, true).await;
                    last_error = Some(e);
                }
            }
        }

        Err(PoolError::backend_unavailable(
            last_error
                .map(|e| e.user_message())
                .unwrap_or_else(|| "no healthy connection available".to_string()),
        ))
    }

    /// Return a connection to the pool.
    ///
    /// `had_error` marks the session as possibly contaminated by an
    /// unfinished transaction: it is rolled back first, and discarded outright
    /// if the rollback fails.
    pub async fn release(&self, handle: PoolHandle<C>, had_error: bool) {
        // Reject handles that belong to a different pool instance
        {
            let state = self.state.read().await;
            if let ManagerState::Ready(current) = &*state {
                if current.id() != handle.pool_id() {
                    warn!(
                        "Connection {} returned to a pool it does not belong to; discarding",
                        handle.id()
                    );
                    let (conn, id, owner) = handle.into_parts();
                    owner.checkin(conn, id, true).await;
                    return;
                }
            }
        }

        let (mut conn, id, owner) = handle.into_parts();

        if had_error {
            match conn.rollback().await {
                Ok(()) => {
                    debug!("Rolled back transaction before returning connection {}", id);
                    owner.checkin(conn, id, false).await;
                }
                Err(e) => {
                    warn!(
                        "Rollback failed for connection {}; discarding: {}",
                        id,
                        e.user_message()
                    );
                    owner.checkin(conn, id, true).await;
                }
            }
        } else {
            owner.checkin(conn, id, false).await;
        }
    }

    /// Run `work` with a pooled connection, releasing it on every exit path.
    ///
    /// This is the only sanctioned way application code touches a connection.
    /// If `work` fails, the connection is released with `had_error = true`
    /// (rolled back or discarded) and the original error propagates; a
    /// release failure on that path is logged, never substituted for the
    /// caller's error.
    pub async fn with_connection<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        E: From<PoolError>,
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, std::result::Result<T, E>>,
    {
        let timeout = Duration::from_secs(self.settings.acquire_timeout);
        let mut handle = self.acquire(timeout).await.map_err(E::from)?;

        match work(handle.conn_mut()).await {
            Ok(value) => {
                self.release(handle, false).await;
                Ok(value)
            }
            Err(err) => {
                self.release(handle, true).await;
                Err(err)
            }
        }
    }

    /// Read-only introspection for health endpoints
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.read().await;
        match &*state {
            ManagerState::Ready(core) => PoolStatus {
                initialized: true,
                min_size: self.settings.min_size,
                max_size: self.settings.max_size,
                idle: core.idle_count(),
                checked_out: core.checked_out_count(),
            },
            _ => PoolStatus {
                initialized: false,
                min_size: self.settings.min_size,
                max_size: self.settings.max_size,
                idle: 0,
                checked_out: 0,
            },
        }
    }

    /// Snapshot of the pool's lifetime counters
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.read().await;
        match &*state {
            ManagerState::Ready(core) => core.stats(),
            _ => PoolStats::default(),
        }
    }

    /// Start the background keepalive sweep, initializing the pool if needed.
    ///
    /// The returned task runs until the pool shuts down.
    pub async fn start_keepalive(&self) -> Result<tokio::task::JoinHandle<()>> {
        let core = self.core().await?;
        Ok(core.spawn_keepalive())
    }

    /// Close every connection and mark the manager terminal.
    ///
    /// A later acquire fails with a configuration error rather than silently
    /// resurrecting a half-closed pool.
    pub async fn shutdown(&self) {
        let core = {
            let mut state = self.state.write().await;
            match std::mem::replace(&mut *state, ManagerState::Terminated) {
                ManagerState::Ready(core) => Some(core),
                _ => None,
            }
        };

        match core {
            Some(core) => core.shutdown().await,
            None => debug!("Shutdown called on an uninitialized pool manager"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct MockShared {
        ping_failures: AtomicU32,
        rollback_failures: AtomicU32,
        established: AtomicUsize,
        closed: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[derive(Debug, Clone, Default)]
    struct MockCtx(Arc<MockShared>);

    struct MockConn {
        shared: Arc<MockShared>,
    }

    #[async_trait]
    impl PoolableConnection for MockConn {
        type Config = MockCtx;

        async fn establish(ctx: &MockCtx) -> Result<Self> {
            ctx.0.established.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                shared: Arc::clone(&ctx.0),
            })
        }

        async fn ping(&mut self) -> Result<()> {
            if consume(&self.shared.ping_failures) {
                return Err(PoolError::broken("liveness probe", None));
            }
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            if consume(&self.shared.rollback_failures) {
                return Err(PoolError::broken("rollback", None));
            }
            Ok(())
        }

        async fn close(self) -> Result<()> {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Decrement a failure budget, returning true while failures remain
    fn consume(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn manager(min: u32, max: u32) -> (PoolManager<MockConn>, MockCtx) {
        let ctx = MockCtx::default();
        let settings = PoolSettings {
            min_size: min,
            max_size: max,
            ..PoolSettings::default()
        };
        (PoolManager::with_context(settings, ctx.clone()), ctx)
    }

    #[tokio::test]
    async fn test_lazy_initialization_on_first_acquire() {
        let (manager, ctx) = manager(2, 4);

        let status = manager.status().await;
        assert!(!status.initialized);
        assert_eq!(ctx.0.established.load(Ordering::SeqCst), 0);

        let handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
        let status = manager.status().await;
        assert!(status.initialized);
        assert_eq!(status.min_size, 2);
        assert_eq!(status.max_size, 4);
        assert_eq!(status.checked_out, 1);
        assert_eq!(ctx.0.established.load(Ordering::SeqCst), 2);

        manager.release(handle, false).await;
        assert_eq!(manager.status().await.checked_out, 0);
    }

    #[tokio::test]
    async fn test_acquire_discards_broken_handle_and_retries() {
        let (manager, ctx) = manager(2, 4);
        ctx.0.ping_failures.store(1, Ordering::SeqCst);

        // The caller never observes the broken handle
        let handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ctx.0.closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().await.probes_failed, 1);

        manager.release(handle, false).await;
    }

    #[tokio::test]
    async fn test_acquire_surfaces_unavailable_after_second_failure() {
        let (manager, ctx) = manager(2, 4);
        ctx.0.ping_failures.store(u32::MAX, Ordering::SeqCst);

        let result = manager.acquire(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::Unavailable { .. })));
        // Exactly one retry: two probes, two discards
        assert_eq!(ctx.0.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_with_error_rolls_back_and_reuses() {
        let (manager, ctx) = manager(1, 2);

        let handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;

        assert_eq!(ctx.0.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.0.closed.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status().await.idle, 1);
    }

    #[tokio::test]
    async fn test_release_discards_when_rollback_fails() {
        let (manager, ctx) = manager(1, 2);
        ctx.0.rollback_failures.store(1, Ordering::SeqCst);

        let handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;

        assert_eq!(ctx.0.closed.load(Ordering::SeqCst), 1);
        // The warm floor was restored with a fresh connection
        assert_eq!(manager.status().await.idle, 1);
        assert_eq!(ctx.0.established.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_success() {
        let (manager, _ctx) = manager(1, 2);

        let result: std::result::Result<u32, PoolError> = manager
            .with_connection(|_conn| Box::pin(async { Ok(41 + 1) }))
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(manager.status().await.checked_out, 0);
        assert_eq!(manager.status().await.idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_then_acquire_fails_cleanly() {
        let (manager, ctx) = manager(2, 4);

        let handle = manager.acquire(Duration::from_secs(1)).await.unwrap();
        manager.release(handle, false).await;
        manager.shutdown().await;

        let result = manager.acquire(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::Configuration { .. })));

        // Shutdown must not resurrect the pool
        assert!(!manager.status().await.initialized);
        let _ = ctx;
    }
}
