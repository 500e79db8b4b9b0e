//! System catalog handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::api::ApiError;
use crate::models::{SystemEntry, SystemsResponse};
use crate::sysdef::{SystemConfiguration, SystemDefinition, SystemRef};
use crate::AppState;

pub async fn list_systems(State(state): State<Arc<AppState>>) -> Json<SystemsResponse> {
    let mut systems = Vec::new();
    for name in state.catalog.names().await {
        let versions = state.catalog.versions(&name).await;
        systems.push(SystemEntry { name, versions });
    }
    Json(SystemsResponse { systems })
}

/// Register a new system definition
pub async fn register_system(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SystemDefinition>, JsonRejection>,
) -> Result<(StatusCode, Json<SystemRef>), ApiError> {
    let Json(sysdef) = payload.map_err(|rejection| ApiError::MalformedDefinition(rejection.body_text()))?;
    let sysdef = state.catalog.register(sysdef).await?;
    Ok((StatusCode::CREATED, Json(sysdef.reference())))
}

pub async fn get_system_versions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SystemEntry>, ApiError> {
    let versions = state.catalog.versions(&name).await;
    if versions.is_empty() {
        return Err(ApiError::NotFound(format!("system '{}'", name)));
    }
    Ok(Json(SystemEntry { name, versions }))
}

pub async fn get_system(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<SystemDefinition>, ApiError> {
    let system = SystemRef::new(name, version);
    let sysdef = state
        .catalog
        .get(&system)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("system {}", system)))?;
    Ok(Json(sysdef.as_ref().clone()))
}

/// Configuration holding every default of a system
pub async fn default_configuration(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<SystemConfiguration>, ApiError> {
    let system = SystemRef::new(name, version);
    state
        .catalog
        .default_configuration(&system)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("system {}", system)))
}

/// Markdown description from the system's documentation
pub async fn get_system_description(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let system = SystemRef::new(name, version);
    let description = state
        .catalog
        .description(&system)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("system {}", system)))?
        .ok_or_else(|| ApiError::NotFound(format!("system {} has no description", system)))?;

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        description,
    ))
}
