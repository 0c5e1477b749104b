//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ApiState;

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Number of running zones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<usize>,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse),
    ),
    tag = "Health"
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        zones: None,
    })
}

/// Readiness probe; fails once the coordinator is shutting down
#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "Coordinator is serving zones", body = HealthResponse),
        (status = 503, description = "Coordinator is shutting down", body = HealthResponse),
    ),
    tag = "Health"
)]
pub async fn readiness(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let shutting_down = state.coordinator.is_shutting_down();
    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(HealthResponse {
            status: if shutting_down { "stopping" } else { "ok" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            zones: Some(state.coordinator.zone_names().len()),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let response = liveness().await;
        assert_eq!(response.status, "ok");
        assert!(!response.version.is_empty());
        assert!(response.zones.is_none());
    }
}
