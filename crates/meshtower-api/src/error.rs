//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meshtower_coordinator::{CoordinatorError, TransportError};
use meshtower_ipam::AllocationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let message = err.to_string();
        match err {
            CoordinatorError::NotFound(_) => ApiError::NotFound(message),
            CoordinatorError::ZoneExists(_) | CoordinatorError::PeerConflict { .. } => {
                ApiError::Conflict(message)
            }
            CoordinatorError::Allocation(alloc) => match alloc {
                AllocationError::Conflict { .. }
                | AllocationError::Overlap { .. }
                | AllocationError::Exhausted(_) => ApiError::Conflict(message),
                AllocationError::InvalidCidr(_) | AllocationError::OutOfRange { .. } => {
                    ApiError::BadRequest(message)
                }
                AllocationError::UnknownPrefix(_) => ApiError::NotFound(message),
            },
            CoordinatorError::Protocol(_) | CoordinatorError::Config(_) => {
                ApiError::BadRequest(message)
            }
            CoordinatorError::Transport(TransportError::Closed(_) | TransportError::Timeout(_)) => {
                ApiError::ServiceUnavailable(message)
            }
            CoordinatorError::Transport(_) | CoordinatorError::Persistence(_) => {
                ApiError::Internal(message)
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
