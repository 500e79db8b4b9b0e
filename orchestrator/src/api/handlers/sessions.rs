//! Session handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::{CreateSessionRequest, CreateSessionResponse, ListSessionsQuery, SessionListResponse};
use crate::session::{SessionError, SessionFilter, SessionRecord};
use crate::AppState;

/// Create a session; returns once it is provisioning
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| SessionError::ConfigurationInvalid(rejection.body_text()))?;
    let record = state.sessions.create_session(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: record.id,
            system: record.system,
            state: record.state,
            timeout_seconds: record.timeout_seconds,
        }),
    ))
}

/// List live and archived sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<SessionListResponse> {
    let sessions = state.sessions.list_sessions(&SessionFilter::from(query)).await;
    Json(SessionListResponse {
        total: sessions.len(),
        sessions,
    })
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.sessions.get_session(&session_id).await?))
}

/// Cancel a session
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.sessions.cancel_session(&session_id).await?))
}
