use redshift_pool::{Config, PoolError, PoolManager, Result};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so a config error is reported with at least
    // basic logging in place
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("Failed to load configuration: {}", e.user_message());
            error!("Configuration error details: {}", e.detailed_message());
            return Err(e);
        }
    };

    let log_level = match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .init();

    info!("Starting Redshift pool smoke test");
    info!("Database connection: {}", config.database.masked_connection_url());
    info!(
        "Pool sizing: {}-{} connections, acquire timeout {}s",
        config.pool.min_size, config.pool.max_size, config.pool.acquire_timeout
    );

    let manager = PoolManager::new(config)?;

    // Exercise the scoped acquisition path with a trivial round-trip
    let probe: i64 = manager
        .with_connection(|conn| {
            Box::pin(async move {
                let row: (i64,) = sqlx::query_as("SELECT 1")
                    .fetch_one(conn.connection_mut())
                    .await
                    .map_err(|e| PoolError::broken("smoke test query", Some(e)))?;
                Ok::<_, PoolError>(row.0)
            })
        })
        .await?;
    info!("Smoke test query returned {}", probe);

    let status = manager.status().await;
    info!(
        "Pool status: {}",
        serde_json::to_string(&status).unwrap_or_else(|_| "<unserializable>".to_string())
    );

    let keepalive = manager.start_keepalive().await?;
    info!("Keepalive sweep running; press Ctrl+C to shut down");

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, closing all connections");
    info!(
        "Final pool stats: {}",
        serde_json::to_string(&manager.stats().await)
            .unwrap_or_else(|_| "<unserializable>".to_string())
    );
    manager.shutdown().await;
    keepalive.abort();
    info!("Shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
