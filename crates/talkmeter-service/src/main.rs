//! Talkmeter Service - HTTP API for per-minute metered sessions
//!
//! This is the main entry point for the talkmeter service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkmeter_engine::RecoverySweeper;
use talkmeter_service::{create_router, AppState, ServiceConfig};
use talkmeter_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,talkmeter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Talkmeter Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();
    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        tick_interval = ?config.engine.tick_interval,
        sweep_interval = ?config.engine.sweep_interval,
        admin_configured = %config.admin_api_key.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config)?;

    let state = AppState::new(store, config.clone())?;
    let engine = state.engine.clone();

    // Pick up sessions that were metering when the last process exited.
    let recovered = engine.recover().await?;
    tracing::info!(
        released_locks = recovered.released_locks,
        resumed = recovered.resumed_sessions,
        paused = recovered.paused_sessions,
        finalized = recovered.finalized_sessions,
        errors = recovered.errors,
        "Startup recovery complete"
    );

    let cancel = CancellationToken::new();
    let sweeper = RecoverySweeper::new(engine.clone()).start(cancel.clone());

    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, shutting down engine");
    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Recovery sweeper task failed");
    }
    // Drivers stop without finalizing; the next startup recovers them.
    engine.shutdown();

    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(talkmeter_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!(
        data_dir = %config.data_dir,
        "Built without rocksdb-backend, using in-memory store; state is lost on restart"
    );
    Ok(Arc::new(talkmeter_store::MemoryStore::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
