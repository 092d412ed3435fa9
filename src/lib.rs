//! Redshift Connection Pool
//!
//! A bounded, task-shared cache of live Redshift connections for the AI
//! business-intelligence backend. Callers acquire validated connections
//! through a process-wide [`PoolManager`] and release them on every exit path
//! via [`PoolManager::with_connection`]; broken connections are detected at
//! checkout, discarded, and replaced.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod pool;

pub use config::{Config, DatabaseSettings, PoolSettings};
pub use connection::{PoolableConnection, RedshiftConnection};
pub use error::{PoolError, Result};
pub use manager::{PoolManager, PoolStatus};
pub use pool::{PoolHandle, PoolStats};
