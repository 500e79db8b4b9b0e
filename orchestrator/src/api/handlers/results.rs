//! Result slot handlers

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::{ResultTypeQuery, ResultsResponse, RtfResponse};
use crate::results::{ResultArtifact, ResultError, ResultType, StoredArtifact};
use crate::session::SessionError;
use crate::AppState;

fn parse_type(query: &ResultTypeQuery) -> Result<Option<ResultType>, ApiError> {
    match query.result_type.as_deref() {
        None => Ok(None),
        Some(tag) => ResultType::from_tag(tag)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown result type '{}'", tag))),
    }
}

/// Declared slots of a session and what they hold
pub async fn list_results(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let results = state.sessions.result_infos(&session_id).await?;
    Ok(Json(ResultsResponse { session_id, results }))
}

/// Push an artifact into a slot; the type defaults to the slot's declared one
pub async fn upload_result(
    State(state): State<Arc<AppState>>,
    Path((session_id, slot)): Path<(Uuid, String)>,
    Query(query): Query<ResultTypeQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<StoredArtifact>), ApiError> {
    let result_type = match parse_type(&query)? {
        Some(result_type) => result_type,
        None => {
            let record = state.sessions.get_session(&session_id).await?;
            record
                .slots
                .get(&slot)
                .map(|info| info.result_type)
                .ok_or_else(|| SessionError::from(ResultError::UnknownSlot(slot.clone())))?
        }
    };

    let stored = state
        .sessions
        .ingest_artifact(&session_id, &slot, ResultArtifact::new(result_type, body.to_vec()))
        .await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

/// Download the artifact stored in a slot
pub async fn download_result(
    State(state): State<Arc<AppState>>,
    Path((session_id, slot)): Path<(Uuid, String)>,
    Query(query): Query<ResultTypeQuery>,
) -> Result<Response, ApiError> {
    let expected = parse_type(&query)?;
    let (stored, content) = state
        .sessions
        .result_content(&session_id, &slot, expected)
        .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, stored.result_type.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", stored.file_name),
        )
        .header("x-content-sha256", stored.sha256.as_str())
        .body(Body::from(content))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Real-time factor of a `simulation_speed` slot
pub async fn real_time_factor(
    State(state): State<Arc<AppState>>,
    Path((session_id, slot)): Path<(Uuid, String)>,
) -> Result<Json<RtfResponse>, ApiError> {
    let real_time_factor = state.sessions.real_time_factor(&session_id, &slot).await?;
    Ok(Json(RtfResponse {
        session_id,
        slot,
        real_time_factor,
    }))
}
