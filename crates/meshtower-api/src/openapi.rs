//! OpenAPI documentation generation

use utoipa::OpenApi;

use crate::error::ErrorResponse;
use crate::handlers::health::HealthResponse;
use crate::handlers::leases::{LeaseResponse, PrefixLeaseResponse};
use crate::handlers::peers::PeerRecord;
use crate::handlers::zones::{CreateZoneRequest, ZoneResponse};

use crate::handlers::health::{__path_liveness, __path_readiness};
use crate::handlers::leases::__path_list_leases;
use crate::handlers::peers::{
    __path_get_peer, __path_get_zone_peer, __path_inject_peers, __path_inject_zone_peers,
    __path_list_peers, __path_list_zone_peers,
};
use crate::handlers::zones::{__path_create_zone, __path_get_zone, __path_list_zones};

/// Meshtower API OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Meshtower API",
        description = "Zone, peer and address lease inspection for the meshtower coordinator",
        version = "0.1.0",
        license(name = "Apache-2.0")
    ),
    paths(
        // Health
        liveness,
        readiness,
        // Peers
        list_peers,
        get_peer,
        inject_peers,
        list_zone_peers,
        get_zone_peer,
        inject_zone_peers,
        // Zones
        list_zones,
        get_zone,
        create_zone,
        // IPAM
        list_leases,
    ),
    components(schemas(
        HealthResponse,
        PeerRecord,
        ZoneResponse,
        CreateZoneRequest,
        LeaseResponse,
        PrefixLeaseResponse,
        ErrorResponse,
    )),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Peers", description = "Peer registry of a zone"),
        (name = "Zones", description = "Isolated peer namespaces"),
        (name = "IPAM", description = "Address allocator state"),
    )
)]
pub struct ApiDoc;
