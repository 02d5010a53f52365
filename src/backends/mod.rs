//! Storage Backend Adapters
//!
//! Client side of the JovianDSS REST API:
//! - transport: HTTP exchange with connect retries
//! - payload: wire bodies and status tables
//! - joviandss: one [`StorageBackend`] call per appliance resource action

pub mod error;
pub mod joviandss;
pub mod payload;
pub mod transport;

pub use error::*;
pub use joviandss::*;
pub use transport::*;

use crate::config::ControllerConfig;
use crate::domain::ports::StorageBackend;
use crate::error::Result;
use std::sync::Arc;

/// Factory for the storage backend of a controller
pub struct BackendFactory;

impl BackendFactory {
    /// Connect to the primary endpoint of `config`
    pub fn create(config: &ControllerConfig) -> Result<Arc<dyn StorageBackend>> {
        let endpoint = config.primary_endpoint()?;
        if config.storage_endpoints.len() > 1 {
            tracing::warn!(
                "{} storage endpoints configured, only {} is used",
                config.storage_endpoints.len(),
                endpoint.name
            );
        }
        Ok(Arc::new(JovianStorage::from_endpoint(endpoint)?))
    }
}
