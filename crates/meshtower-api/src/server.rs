//! API server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use meshtower_coordinator::Coordinator;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ApiConfig;
use crate::router::build_router;

/// API server
pub struct ApiServer {
    config: ApiConfig,
    coordinator: Arc<Coordinator>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = build_router(&self.config, self.coordinator);

        info!(
            bind = %listener.local_addr()?,
            openapi = self.config.openapi_enabled,
            "Starting API server"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server shut down");
        Ok(())
    }
}
