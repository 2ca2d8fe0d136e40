//! API Server
//!
//! Serves the REST router until shutdown is signalled.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::Orchestrator;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Allow cross-origin requests
    pub permissive_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            request_timeout_secs: 300,
            permissive_cors: false,
        }
    }
}

impl ApiServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            shutdown_tx,
        }
    }

    /// Serve until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let mut router = RestRouter::new(self.orchestrator.clone())
            .build()
            .layer(tower_http::timeout::TimeoutLayer::new(self.config.request_timeout()))
            .layer(TraceLayer::new_for_http());
        if self.config.permissive_cors {
            router = router.layer(CorsLayer::permissive());
        }

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!(addr = %self.config.rest_addr, "REST API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle that can stop the server from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert!(!config.permissive_cors);
    }
}
