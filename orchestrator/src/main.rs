//! Runtime manager service
//!
//! Loads the system catalog, recovers session records from a previous run,
//! connects to the container runtime and serves the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use tokio::signal;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use runtime_manager::api::create_router;
use runtime_manager::config::AppConfig;
use runtime_manager::logging::init_logging;
use runtime_manager::session::SessionManager;
use runtime_manager::store::SessionRecordStore;
use runtime_manager::sysdef::SystemCatalog;
use runtime_manager::{container, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, &config.log_dir)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting runtime manager");

    if config.metrics.enabled {
        runtime_manager::metrics::init_metrics();
        info!("Prometheus metrics initialized");
    }

    tokio::fs::create_dir_all(&config.systems_dir)
        .await
        .context("Failed to create systems directory")?;
    let catalog = Arc::new(SystemCatalog::load(&config.systems_dir).await?);
    if catalog.len().await == 0 {
        warn!(dir = %config.systems_dir.display(), "No system definitions loaded");
    }

    let store = Arc::new(SessionRecordStore::open(&config.sessions_dir()).await?);

    let driver = container::connect(&config.container).await?;
    match driver.runtime_version().await {
        Ok(version) => info!(runtime = driver.name(), version = %version, "Container runtime connected"),
        Err(e) => warn!(runtime = driver.name(), error = %e, "Container runtime not responding"),
    }

    let sessions = Arc::new(SessionManager::new(&config, catalog.clone(), driver, store));
    sessions.reap_interrupted().await;

    // Create shared application state
    let state = Arc::new(AppState {
        config: config.clone(),
        sessions: sessions.clone(),
        catalog,
    });

    // Archive terminal sessions once their retention has passed
    let gc_sessions = sessions.clone();
    let gc_interval = Duration::from_secs(config.sessions.gc_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gc_interval);
        loop {
            interval.tick().await;
            gc_sessions.evict_expired().await;
        }
    });

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state)
        .layer(GlobalConcurrencyLimitLayer::new(config.max_concurrent_requests))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    sessions.shutdown().await;

    info!("Runtime manager stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
