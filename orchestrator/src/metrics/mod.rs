//! Prometheus metrics export
//!
//! Session lifecycle and artifact ingestion counters, exposed at `/metrics`

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

use crate::AppState;

static METRICS_HANDLE: Lazy<Option<PrometheusHandle>> = Lazy::new(|| {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("rtm_session_duration_seconds".to_string()),
            &[1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 14400.0, 86400.0],
        )
        .ok()?;

    match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder unavailable");
            None
        }
    }
});

/// Initialize metrics system
pub fn init_metrics() {
    Lazy::force(&METRICS_HANDLE);
}

/// Session admitted
pub fn record_session_created(system: &str) {
    counter!("rtm_sessions_created_total", "system" => system.to_string()).increment(1);
}

/// Session refused by admission control
pub fn record_admission_rejected(reason: &'static str) {
    counter!("rtm_admission_rejected_total", "reason" => reason).increment(1);
}

/// Session reached a terminal state
pub fn record_session_finished(system: &str, state: &str, cause: Option<&str>, duration_secs: f64) {
    counter!(
        "rtm_sessions_finished_total",
        "system" => system.to_string(),
        "state" => state.to_string(),
        "cause" => cause.unwrap_or("none").to_string()
    )
    .increment(1);

    histogram!("rtm_session_duration_seconds", "system" => system.to_string()).record(duration_secs);
}

pub fn record_artifact(result_type: &str, accepted: bool, size_bytes: u64) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!("rtm_artifacts_total", "type" => result_type.to_string(), "outcome" => outcome).increment(1);
    if accepted {
        counter!("rtm_artifact_bytes_total", "type" => result_type.to_string()).increment(size_bytes);
    }
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    gauge!("rtm_active_sessions").set(state.sessions.active_session_count().await as f64);
    gauge!("rtm_known_systems").set(state.catalog.len().await as f64);

    let metrics = METRICS_HANDLE
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}
