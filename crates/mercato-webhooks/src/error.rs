//! Error types for the webhook gateway and its API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Gateway error variants.
///
/// These reject a delivery *before* it is accepted into the pipeline;
/// anything after acceptance is reported through the webhook event's
/// status, not the HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Instance {0} not found")]
    InstanceNotFound(uuid::Uuid),

    #[error("Instance {0} is not active")]
    InstanceInactive(uuid::Uuid),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid JSON payload")]
    MalformedPayload,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// JSON error response returned by the API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "instance_not_found"),
            GatewayError::InstanceInactive(_) => (StatusCode::FORBIDDEN, "instance_inactive"),
            GatewayError::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            GatewayError::MalformedPayload => (StatusCode::BAD_REQUEST, "malformed_payload"),
            GatewayError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            GatewayError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, GatewayError>;
