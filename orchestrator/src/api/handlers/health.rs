//! Health and version handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use once_cell::sync::Lazy;

use crate::models::{HealthResponse, HealthStatus, VersionResponse};
use crate::sysdef::{SYSCFG_DATAFORMAT, SYSDEF_DATAFORMAT};
use crate::AppState;

/// Server start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.elapsed().as_secs();
    let active_sessions = state.sessions.active_session_count().await as u64;
    let systems = state.catalog.len().await as u64;

    let driver = state.sessions.driver();
    let runtime_version = driver.runtime_version().await.ok();

    // Determine health status
    let status = if runtime_version.is_some() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        active_sessions,
        systems,
        runtime: driver.name().to_string(),
        runtime_version,
    })
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sysdef_dataformat: SYSDEF_DATAFORMAT.to_string(),
        syscfg_dataformat: SYSCFG_DATAFORMAT.to_string(),
    })
}
