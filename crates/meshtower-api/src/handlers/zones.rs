//! Zone listing and runtime zone creation

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use meshtower_coordinator::{ZoneConfig, ZoneSummary};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{count, ApiState};
use crate::error::Result;

/// Zone summary
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ZoneResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Canonical zone prefix
    pub cidr: String,
    pub peer_count: usize,
    /// Assignable addresses in the zone prefix
    pub capacity: u64,
    pub allocated: u64,
    pub available: u64,
}

impl From<ZoneSummary> for ZoneResponse {
    fn from(summary: ZoneSummary) -> Self {
        Self {
            id: summary.info.id.to_string(),
            name: summary.info.name,
            description: summary.info.description,
            cidr: summary.info.cidr.to_string(),
            peer_count: summary.peer_count,
            capacity: count(summary.usage.capacity),
            allocated: count(summary.usage.allocated),
            available: count(summary.usage.available),
        }
    }
}

/// Create zone request
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateZoneRequest {
    /// Zone name, also its pub/sub channel
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Address prefix, e.g. `10.201.0.0/20`
    pub cidr: String,
}

/// List zones
#[utoipa::path(
    get,
    path = "/zones",
    responses(
        (status = 200, description = "Running zones", body = Vec<ZoneResponse>),
    ),
    tag = "Zones"
)]
pub async fn list_zones(State(state): State<ApiState>) -> Json<Vec<ZoneResponse>> {
    let mut zones = Vec::new();
    for zone in state.coordinator.zones() {
        zones.push(zone.summary().await.into());
    }
    Json(zones)
}

/// Describe a zone
#[utoipa::path(
    get,
    path = "/zones/{zone}",
    params(
        ("zone" = String, Path, description = "Zone name"),
    ),
    responses(
        (status = 200, description = "Zone summary", body = ZoneResponse),
        (status = 404, description = "Zone not found", body = crate::error::ErrorResponse),
    ),
    tag = "Zones"
)]
pub async fn get_zone(
    State(state): State<ApiState>,
    Path(zone): Path<String>,
) -> Result<Json<ZoneResponse>> {
    let zone = state.coordinator.zone(&zone)?;
    Ok(Json(zone.summary().await.into()))
}

/// Create a zone and start serving its channel
#[utoipa::path(
    post,
    path = "/zones",
    request_body = CreateZoneRequest,
    responses(
        (status = 201, description = "Zone created", body = ZoneResponse),
        (status = 400, description = "Invalid name or prefix", body = crate::error::ErrorResponse),
        (status = 409, description = "Zone exists", body = crate::error::ErrorResponse),
    ),
    tag = "Zones"
)]
pub async fn create_zone(
    State(state): State<ApiState>,
    Json(request): Json<CreateZoneRequest>,
) -> Result<(StatusCode, Json<ZoneResponse>)> {
    let config = ZoneConfig::new(request.name, request.cidr).with_description(request.description);
    let zone = state.coordinator.add_zone(config).await?;
    Ok((StatusCode::CREATED, Json(zone.summary().await.into())))
}
