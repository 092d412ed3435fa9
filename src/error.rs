//! Error types for the Redshift connection pool

use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

/// Result type alias for the pool
pub type Result<T> = std::result::Result<T, PoolError>;

/// Main error type for the connection pool
#[derive(Debug)]
pub enum PoolError {
    /// Configuration errors, including lifecycle violations such as
    /// acquiring from a pool that has been shut down
    Configuration {
        /// Configuration parameter that is invalid
        parameter: String,
        /// Error message
        message: String,
    },
    /// No handle became idle within the checkout timeout
    Exhausted {
        /// How long the caller was willing to wait, in milliseconds
        timeout_ms: u64,
    },
    /// A specific handle failed its liveness probe or rollback
    Broken {
        /// What the handle was doing when it failed
        context: String,
        /// The underlying database error, if one was observed
        source: Option<sqlx::Error>,
    },
    /// The bounded retry also failed; the backend is unreachable
    Unavailable {
        /// Error message describing the final failure
        message: String,
    },
}

impl PoolError {
    /// Create a new configuration error
    pub fn configuration_error(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        let parameter = parameter.into();
        let message = message.into();
        error!("Configuration error for '{}': {}", parameter, message);

        Self::Configuration { parameter, message }
    }

    /// Create a new pool-exhausted error
    pub fn pool_exhausted(timeout: Duration) -> Self {
        let timeout_ms = timeout.as_millis() as u64;
        warn!("Pool exhausted: no connection became idle within {}ms", timeout_ms);

        Self::Exhausted { timeout_ms }
    }

    /// Create a new broken-connection error
    pub fn broken(context: impl Into<String>, source: Option<sqlx::Error>) -> Self {
        let context = context.into();
        warn!("Connection broken during {}: {:?}", context, source);

        Self::Broken { context, source }
    }

    /// Create a new backend-unavailable error
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("Backend unavailable: {}", message);

        Self::Unavailable { message }
    }

    /// Check if this error is recoverable by retrying at a higher level
    pub fn is_recoverable(&self) -> bool {
        match self {
            PoolError::Configuration { .. } => false, // Requires an operator fix
            PoolError::Exhausted { .. } => true,      // May recover once handles are released
            PoolError::Broken { .. } => true,         // The specific handle was discarded
            PoolError::Unavailable { .. } => true,    // Fail the request, not the process
        }
    }

    /// Get a user-friendly error message (safe to surface to clients)
    pub fn user_message(&self) -> String {
        match self {
            PoolError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            PoolError::Exhausted { timeout_ms } => {
                format!("No database connection became available within {}ms", timeout_ms)
            }
            PoolError::Broken { context, .. } => {
                format!("Database connection failed during {}", context)
            }
            PoolError::Unavailable { message } => {
                format!("Database backend unavailable: {}", message)
            }
        }
    }

    /// Get detailed error information for logging
    pub fn detailed_message(&self) -> String {
        match self {
            PoolError::Configuration { parameter, message } => {
                format!("Configuration error: parameter '{}' | {}", parameter, message)
            }
            PoolError::Exhausted { timeout_ms } => {
                format!("Pool exhausted after {}ms", timeout_ms)
            }
            PoolError::Broken { context, source } => {
                format!("Broken connection during {} | Source: {:?}", context, source)
            }
            PoolError::Unavailable { message } => {
                format!("Backend unavailable: {}", message)
            }
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Broken { source: Some(source), .. } => Some(source),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        PoolError::broken("database operation", Some(err))
    }
}
