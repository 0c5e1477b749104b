//! Peer listing, lookup and manual injection
//!
//! The un-prefixed routes act on the default zone. Public keys are base64 and
//! may contain `/`, so clients percent-encode them in paths.

use axum::{
    extract::{Path, State},
    Json,
};
use meshtower_coordinator::{Peer, ZoneHandle};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use super::ApiState;
use crate::error::{ApiError, Result};

/// A peer record, in the same shape agents see on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PeerRecord {
    /// WireGuard public key
    #[serde(rename = "PublicKey", default)]
    pub public_key: String,
    /// Last reported public endpoint
    #[serde(rename = "EndpointIP", default)]
    pub endpoint_ip: String,
    /// Routes accepted from this peer
    #[serde(rename = "AllowedIPs", default)]
    pub allowed_ips: String,
    #[serde(rename = "Zone", default)]
    pub zone: String,
    /// Overlay address; required when injecting
    #[serde(rename = "NodeAddress", default)]
    pub node_address: String,
    /// Delegated prefix, if any
    #[serde(rename = "ChildPrefix", default)]
    pub child_prefix: String,
}

impl From<Peer> for PeerRecord {
    fn from(peer: Peer) -> Self {
        Self {
            public_key: peer.public_key,
            endpoint_ip: peer.endpoint_ip,
            allowed_ips: peer.allowed_ips,
            zone: peer.zone,
            node_address: peer.node_address,
            child_prefix: peer.child_prefix,
        }
    }
}

impl From<PeerRecord> for Peer {
    fn from(record: PeerRecord) -> Self {
        Self {
            public_key: record.public_key,
            endpoint_ip: record.endpoint_ip,
            allowed_ips: record.allowed_ips,
            zone: record.zone,
            node_address: record.node_address,
            child_prefix: record.child_prefix,
        }
    }
}

async fn list(zone: ZoneHandle) -> Json<Vec<PeerRecord>> {
    Json(zone.peers().await.into_iter().map(PeerRecord::from).collect())
}

async fn get(zone: ZoneHandle, public_key: &str) -> Result<Json<PeerRecord>> {
    Ok(Json(zone.peer(public_key).await?.into()))
}

/// Returns the accepted peers; fails only when every peer was rejected
async fn inject(zone: ZoneHandle, records: Vec<PeerRecord>) -> Result<Json<Vec<PeerRecord>>> {
    let requested = records.len();
    let outcome = zone
        .inject(records.into_iter().map(Peer::from).collect())
        .await;

    if outcome.accepted.is_empty() {
        if let Some((_, err)) = outcome.rejected.into_iter().next() {
            return Err(ApiError::from(err));
        }
    }

    info!(
        zone = %zone.name(),
        requested,
        accepted = outcome.accepted.len(),
        "Injected peers"
    );
    Ok(Json(outcome.accepted.into_iter().map(PeerRecord::from).collect()))
}

/// List peers of the default zone
#[utoipa::path(
    get,
    path = "/peers",
    responses(
        (status = 200, description = "Peers of the default zone", body = Vec<PeerRecord>),
        (status = 404, description = "No default zone", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn list_peers(State(state): State<ApiState>) -> Result<Json<Vec<PeerRecord>>> {
    let zone = state.coordinator.default_zone()?;
    Ok(list(zone).await)
}

/// Fetch one peer of the default zone
#[utoipa::path(
    get,
    path = "/peers/{public_key}",
    params(
        ("public_key" = String, Path, description = "Percent-encoded public key"),
    ),
    responses(
        (status = 200, description = "Peer record", body = PeerRecord),
        (status = 404, description = "Peer not found", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn get_peer(
    State(state): State<ApiState>,
    Path(public_key): Path<String>,
) -> Result<Json<PeerRecord>> {
    let zone = state.coordinator.default_zone()?;
    get(zone, &public_key).await
}

/// Inject peers into the default zone
#[utoipa::path(
    post,
    path = "/peers",
    request_body = Vec<PeerRecord>,
    responses(
        (status = 200, description = "Accepted peers", body = Vec<PeerRecord>),
        (status = 400, description = "Peer without a usable address", body = crate::error::ErrorResponse),
        (status = 409, description = "Key or address already taken", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn inject_peers(
    State(state): State<ApiState>,
    Json(records): Json<Vec<PeerRecord>>,
) -> Result<Json<Vec<PeerRecord>>> {
    let zone = state.coordinator.default_zone()?;
    inject(zone, records).await
}

/// List peers of a zone
#[utoipa::path(
    get,
    path = "/zones/{zone}/peers",
    params(
        ("zone" = String, Path, description = "Zone name"),
    ),
    responses(
        (status = 200, description = "Peers of the zone", body = Vec<PeerRecord>),
        (status = 404, description = "Zone not found", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn list_zone_peers(
    State(state): State<ApiState>,
    Path(zone): Path<String>,
) -> Result<Json<Vec<PeerRecord>>> {
    let zone = state.coordinator.zone(&zone)?;
    Ok(list(zone).await)
}

/// Fetch one peer of a zone
#[utoipa::path(
    get,
    path = "/zones/{zone}/peers/{public_key}",
    params(
        ("zone" = String, Path, description = "Zone name"),
        ("public_key" = String, Path, description = "Percent-encoded public key"),
    ),
    responses(
        (status = 200, description = "Peer record", body = PeerRecord),
        (status = 404, description = "Zone or peer not found", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn get_zone_peer(
    State(state): State<ApiState>,
    Path((zone, public_key)): Path<(String, String)>,
) -> Result<Json<PeerRecord>> {
    let zone = state.coordinator.zone(&zone)?;
    get(zone, &public_key).await
}

/// Inject peers into a zone
#[utoipa::path(
    post,
    path = "/zones/{zone}/peers",
    params(
        ("zone" = String, Path, description = "Zone name"),
    ),
    request_body = Vec<PeerRecord>,
    responses(
        (status = 200, description = "Accepted peers", body = Vec<PeerRecord>),
        (status = 400, description = "Peer without a usable address", body = crate::error::ErrorResponse),
        (status = 404, description = "Zone not found", body = crate::error::ErrorResponse),
        (status = 409, description = "Key or address already taken", body = crate::error::ErrorResponse),
    ),
    tag = "Peers"
)]
pub async fn inject_zone_peers(
    State(state): State<ApiState>,
    Path(zone): Path<String>,
    Json(records): Json<Vec<PeerRecord>>,
) -> Result<Json<Vec<PeerRecord>>> {
    let zone = state.coordinator.zone(&zone)?;
    inject(zone, records).await
}
