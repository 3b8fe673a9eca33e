//! loyalty-engine worker entry point.
//!
//! Connects to PostgreSQL, applies migrations and runs the delivery
//! worker loop. Until a real messaging provider is wired in, outbound
//! sends go through the dry-run channel, which logs instead of
//! delivering.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use loyalty_engine::channel::DryRunChannel;
use loyalty_engine::config::EngineConfig;
use loyalty_engine::store::PgStore;
use loyalty_engine::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = EngineConfig::from_env();
    tracing::info!("starting loyalty-engine worker");

    // Connect and migrate
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("database ready");

    // Build the worker
    let store = Arc::new(PgStore::new(pool));
    let channel = Arc::new(DryRunChannel::new());
    tracing::warn!("no outbound provider configured; using the dry-run channel");

    let worker = Worker::new(store, channel, config.worker_config());
    worker.run().await;

    Ok(())
}
