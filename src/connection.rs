//! Database connection management
//!
//! Defines the [`PoolableConnection`] trait the pool manages connections
//! through, and [`RedshiftConnection`], the production implementation over a
//! single PostgreSQL-protocol session.

use crate::{Config, PoolError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tracing::debug;

/// A connection the pool can create, probe, and retire.
///
/// Implementors represent one live session against the backing database. The
/// pool owns the full lifecycle: it establishes connections up to its ceiling,
/// probes them for liveness at checkout, rolls back contaminated sessions, and
/// closes whatever it discards.
#[async_trait]
pub trait PoolableConnection: Send + Sized + 'static {
    /// Context handed to every lifecycle method, typically connection
    /// parameters
    type Config: Send + Sync + 'static;

    /// Establish a new connection, bounded by the configured connect timeout
    async fn establish(config: &Self::Config) -> Result<Self>;

    /// Cheap liveness probe; an error means the connection must be discarded
    async fn ping(&mut self) -> Result<()>;

    /// Undo any pending transaction so the session is clean for reuse
    async fn rollback(&mut self) -> Result<()>;

    /// Close the underlying resource
    async fn close(self) -> Result<()>;
}

/// A live Redshift session managed by the pool
pub struct RedshiftConnection {
    inner: PgConnection,
}

impl RedshiftConnection {
    /// Get a mutable reference to the underlying connection for running
    /// queries
    pub fn connection_mut(&mut self) -> &mut PgConnection {
        &mut self.inner
    }
}

#[async_trait]
impl PoolableConnection for RedshiftConnection {
    type Config = Config;

    async fn establish(config: &Self::Config) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.database.host)
            .port(config.database.port)
            .database(&config.database.database)
            .username(&config.database.username)
            .password(&config.database.password);

        debug!(
            "Establishing connection to {}",
            config.database.masked_connection_url()
        );

        let connect_timeout = Duration::from_secs(config.pool.connect_timeout);
        let inner = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| PoolError::backend_unavailable(format!(
                "Connection to {} timed out after {}s",
                config.database.masked_connection_url(),
                config.pool.connect_timeout,
            )))?
            .map_err(|e| PoolError::broken("connection establish", Some(e)))?;

        debug!("Connection established successfully");
        Ok(Self { inner })
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner
            .ping()
            .await
            .map_err(|e| PoolError::broken("liveness probe", Some(e)))
    }

    async fn rollback(&mut self) -> Result<()> {
        // ROLLBACK outside a transaction is a harmless no-op warning on the
        // server side, so this is safe to run unconditionally.
        sqlx::query("ROLLBACK")
            .execute(&mut self.inner)
            .await
            .map(|_| ())
            .map_err(|e| PoolError::broken("rollback", Some(e)))
    }

    async fn close(self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| PoolError::broken("close", Some(e)))
    }
}
