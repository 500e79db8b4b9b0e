//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::session::SessionError;
use crate::sysdef::CatalogError;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Malformed system definition: {0}")]
    MalformedDefinition(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Session(e) => {
                let kind = e.kind();
                let status = match kind {
                    "ConfigurationInvalid" | "UnknownSlot" => StatusCode::BAD_REQUEST,
                    "CapacityExceeded" => StatusCode::TOO_MANY_REQUESTS,
                    "NotFound" => StatusCode::NOT_FOUND,
                    "AlreadyTerminal" => StatusCode::CONFLICT,
                    "TypeMismatch" | "SchemaViolation" | "DivisionUndefined" => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, kind)
            }
            ApiError::Catalog(CatalogError::Invalid(_)) => (StatusCode::BAD_REQUEST, "DefinitionInvalid"),
            ApiError::Catalog(CatalogError::AlreadyExists(_) | CatalogError::FileConflict { .. }) => {
                (StatusCode::CONFLICT, "AlreadyExists")
            }
            ApiError::Catalog(CatalogError::Io(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
            ApiError::MalformedDefinition(_) => (StatusCode::BAD_REQUEST, "DefinitionInvalid"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let message = match &self {
            ApiError::MalformedDefinition(msg)
            | ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Internal(msg) => msg.clone(),
            other => other.to_string(),
        };

        let mut body = ErrorResponse::new(error_code, message);
        if let ApiError::Session(SessionError::CapacityExceeded { limit }) = &self {
            body = body.with_details(serde_json::json!({ "limit": limit }));
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "Internal error");
        ApiError::Internal(err.to_string())
    }
}
