//! Meshtower API - REST query surface over the coordinator
//!
//! Provides:
//! - Peer listing, lookup and manual injection per zone
//! - Runtime zone creation
//! - Allocator lease inspection
//! - Liveness/readiness probes and an OpenAPI document
//!
//! Every mutation goes through the zone's handle and so takes the same
//! per-zone lock as the registration loop.

pub mod config;
pub mod error;
pub mod handlers;
pub mod openapi;
pub mod router;
pub mod server;

pub use config::ApiConfig;
pub use error::{ApiError, ErrorResponse, Result};
pub use handlers::ApiState;
pub use openapi::ApiDoc;
pub use router::build_router;
pub use server::ApiServer;
