//! API configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Answer CORS preflights for any origin
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`
    #[serde(default = "default_true")]
    pub openapi_enabled: bool,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

fn default_true() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_allow_all: false,
            openapi_enabled: true,
        }
    }
}
