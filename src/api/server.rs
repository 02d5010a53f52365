//! API Server
//!
//! Serves the REST router until the shutdown token is cancelled.

use super::rest::{AppState, RestRouter};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState, shutdown: CancellationToken) -> Self {
        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Run until the shutdown token fires
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = RestRouter::new(self.state).build();
        let shutdown = self.shutdown.clone();

        info!("REST API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
