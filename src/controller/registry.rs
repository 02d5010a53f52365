//! Snapshot registry
//!
//! A small auxiliary volume whose snapshots act as idempotency markers: a
//! snapshot named after a hashed snapshot id records that a CreateSnapshot
//! for that name was accepted. The records carry no payload.

use crate::backends::error::RestErrorKind;
use crate::domain::ports::StorageBackend;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix appended to the node prefix to name the registry volume
pub const REGISTRY_SUFFIX: &str = "SnapshotRegister";

/// Size of the registry volume
pub const REGISTRY_VOLUME_SIZE: i64 = 16 * 1024 * 1024;

/// Registry of accepted snapshot names
pub struct SnapshotRegistry {
    backend: Arc<dyn StorageBackend>,
    volume: String,
}

impl SnapshotRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>, node_prefix: &str) -> Self {
        Self {
            backend,
            volume: format!("{}{}", node_prefix, REGISTRY_SUFFIX),
        }
    }

    /// Name of the backing volume
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Create the registry volume unless it already exists
    pub async fn ensure_volume(&self) -> Result<()> {
        match self
            .backend
            .create_volume(&self.volume, REGISTRY_VOLUME_SIZE)
            .await
        {
            Ok(()) => {
                info!("Created snapshot registry volume {}", self.volume);
                Ok(())
            }
            Err(e) if e.is(RestErrorKind::ObjectExists) => {
                debug!("Snapshot registry volume {} already exists", self.volume);
                Ok(())
            }
            Err(e) if e.is(RestErrorKind::ResourceBusy) => Err(Error::FailedPrecondition(
                format!("create snapshot registry: {}", e),
            )),
            Err(e) => Err(Error::Internal(format!("create snapshot registry: {}", e))),
        }
    }

    /// Record `hash`; recording twice is not an error
    pub async fn put_record(&self, hash: &str) -> Result<()> {
        match self.backend.create_snapshot(&self.volume, hash).await {
            Ok(()) => Ok(()),
            Err(e) if e.is(RestErrorKind::ObjectExists) => Ok(()),
            Err(e) => Err(Error::from_backend("register snapshot", &e)),
        }
    }

    /// Check for a record; any failure counts as absent
    pub async fn record_exists(&self, hash: &str) -> bool {
        match self.backend.get_snapshot(&self.volume, hash).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Registry record {} treated as absent: {}", hash, e);
                false
            }
        }
    }

    /// Remove a record; a missing record is not an error
    pub async fn delete_record(&self, hash: &str) -> Result<()> {
        match self.backend.delete_snapshot(&self.volume, hash).await {
            Ok(()) => Ok(()),
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => Ok(()),
            Err(e) => {
                warn!("Unable to delete registry record {}: {}", hash, e);
                Err(Error::from_backend("unregister snapshot", &e))
            }
        }
    }
}
