//! bmfleet allocator
//!
//! Runs the allocation worker pool for one conductor against the Postgres
//! inventory until interrupted.

use std::sync::Arc;

use anyhow::Result;
use bmfleet_allocator::{config, dispatcher::Dispatcher, store::Database};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BMFLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        conductor = %config.dispatcher.conductor,
        workers = config.dispatcher.workers,
        "Starting bmfleet allocator"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store = Arc::new(db.store());
    let dispatcher = Dispatcher::start(config.dispatcher.clone(), store.clone(), store).await?;

    match dispatcher.resume_allocations().await {
        Ok(count) => info!(count, "Allocation resume complete"),
        Err(e) => warn!(error = %e, "Failed to resume allocations"),
    }

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // No timeout: a worker holding a node lock must get to release it. Each
    // run is bounded by the retry budget and the pool's acquire timeout.
    info!("Waiting for workers to finish in-flight allocations...");
    dispatcher.shutdown().await;

    info!("Allocator shutdown complete");
    Ok(())
}
