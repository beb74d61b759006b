//! respool pool manager
//!
//! Serves the allocation API and runs the audit, archive and reservation
//! reaper workers.

use std::sync::Arc;

use anyhow::Result;
use respool_pool_manager::{
    allocation::AllocationService,
    api, config,
    db::Database,
    lock::{RedisLockBackend, ScopeLocker},
    pipeline::{Pipeline, ReservationReaper},
    state::AppState,
    store::ResourceStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to RESPOOL_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting respool pool manager");
    info!(
        listen_addr = %config.listen_addr,
        lock_ttl_secs = config.lock.ttl.as_secs(),
        lock_max_attempts = config.lock.max_attempts,
        cities = config.cities.len(),
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let lock_backend = match RedisLockBackend::connect(&config.redis_url).await {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "Failed to connect to redis");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store: Arc<dyn ResourceStore> = Arc::new(db.resource_store());
    let (pipeline, pipeline_handles) =
        Pipeline::spawn(store.clone(), config.pipeline.clone(), shutdown_rx.clone());

    let reaper = ReservationReaper::new(store.clone(), pipeline.clone(), config.reaper.clone());
    let reaper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reaper.run(shutdown_rx).await;
        }
    });

    let allocations = AllocationService::new(
        store,
        ScopeLocker::new(Arc::new(lock_backend), config.lock.clone()),
        Arc::new(config.cities.clone()),
        pipeline,
    );
    let app = api::create_router(AppState::new(allocations));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reaper_handle).await {
        warn!(error = %e, "Reservation reaper did not shut down in time");
    }

    for handle in pipeline_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Pipeline worker did not drain in time");
        }
    }

    info!("Pool manager shutdown complete");
    Ok(())
}
