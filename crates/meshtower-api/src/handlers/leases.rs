//! Allocator lease inspection

use axum::{
    extract::{Path, State},
    Json,
};
use meshtower_coordinator::PrefixLease;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{count, ApiState};
use crate::error::Result;

/// One held address
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LeaseResponse {
    pub address: String,
    /// Public key holding the address
    pub owner: String,
}

/// A prefix of the zone forest and its leases
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PrefixLeaseResponse {
    pub cidr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub leases: Vec<LeaseResponse>,
    pub capacity: u64,
    pub allocated: u64,
    pub delegated: u64,
    pub available: u64,
}

impl From<PrefixLease> for PrefixLeaseResponse {
    fn from(prefix: PrefixLease) -> Self {
        Self {
            cidr: prefix.cidr.to_string(),
            parent: prefix.parent.map(|p| p.to_string()),
            leases: prefix
                .leases
                .into_iter()
                .map(|lease| LeaseResponse {
                    address: lease.address.to_string(),
                    owner: lease.owner,
                })
                .collect(),
            capacity: count(prefix.usage.capacity),
            allocated: count(prefix.usage.allocated),
            delegated: count(prefix.usage.delegated),
            available: count(prefix.usage.available),
        }
    }
}

/// List every prefix of a zone with its allocated addresses
#[utoipa::path(
    get,
    path = "/ipam/leases/{zone}",
    params(
        ("zone" = String, Path, description = "Zone name"),
    ),
    responses(
        (status = 200, description = "Prefixes and leases", body = Vec<PrefixLeaseResponse>),
        (status = 404, description = "Zone not found", body = crate::error::ErrorResponse),
    ),
    tag = "IPAM"
)]
pub async fn list_leases(
    State(state): State<ApiState>,
    Path(zone): Path<String>,
) -> Result<Json<Vec<PrefixLeaseResponse>>> {
    let zone = state.coordinator.zone(&zone)?;
    Ok(Json(
        zone.leases()
            .await
            .into_iter()
            .map(PrefixLeaseResponse::from)
            .collect(),
    ))
}
