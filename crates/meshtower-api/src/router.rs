//! API router construction

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use meshtower_coordinator::Coordinator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::config::ApiConfig;
use crate::handlers::{self, ApiState};
use crate::openapi::ApiDoc;

/// Build the API router over a running coordinator
pub fn build_router(config: &ApiConfig, coordinator: Arc<Coordinator>) -> Router {
    let state = ApiState::new(coordinator);

    let health_routes = Router::new()
        .route("/live", get(handlers::health::liveness))
        .route("/ready", get(handlers::health::readiness));

    let peer_routes = Router::new()
        .route(
            "/",
            get(handlers::peers::list_peers).post(handlers::peers::inject_peers),
        )
        .route("/{public_key}", get(handlers::peers::get_peer));

    let zone_routes = Router::new()
        .route(
            "/",
            get(handlers::zones::list_zones).post(handlers::zones::create_zone),
        )
        .route("/{zone}", get(handlers::zones::get_zone))
        .route(
            "/{zone}/peers",
            get(handlers::peers::list_zone_peers).post(handlers::peers::inject_zone_peers),
        )
        .route(
            "/{zone}/peers/{public_key}",
            get(handlers::peers::get_zone_peer),
        );

    let ipam_routes = Router::new().route("/leases/{zone}", get(handlers::leases::list_leases));

    let mut router = Router::new()
        .nest("/health", health_routes)
        .nest("/peers", peer_routes)
        .nest("/zones", zone_routes)
        .nest("/ipam", ipam_routes)
        .with_state(state);

    if config.openapi_enabled {
        router = router.route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    if config.cors_allow_all {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.layer(TraceLayer::new_for_http())
}
