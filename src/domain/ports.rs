//! Domain Ports - Capability traits at the edges of the plugin
//!
//! The controller drives the appliance exclusively through [`StorageBackend`],
//! which itself sits on a [`RestTransport`]. The node plugin reaches the host
//! through [`IscsiInitiator`] and [`Mounter`]. Tests substitute fakes for each.

use crate::backends::error::RestResult;
use crate::backends::payload::{Pool, Snapshot, SnapshotShort, Volume};
use crate::error::Result;
use crate::node::TargetDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Transport Port
// =============================================================================

/// Raw reply of the appliance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body as text, for log and error messages
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure to complete an HTTP exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused or timed out after all retries
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other failure while sending or reading
    #[error("request failed: {0}")]
    Request(String),
}

/// `send(method, path, body) -> (status, body)` against the appliance
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<RawResponse, TransportError>;
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Access mode of a LUN attached to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LunMode {
    /// Read-only
    #[serde(rename = "ro")]
    ReadOnly,
    /// Read-write with write-through caching
    #[serde(rename = "wt")]
    WriteThrough,
}

impl LunMode {
    pub fn from_readonly(readonly: bool) -> Self {
        if readonly {
            LunMode::ReadOnly
        } else {
            LunMode::WriteThrough
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LunMode::ReadOnly => "ro",
            LunMode::WriteThrough => "wt",
        }
    }
}

impl std::fmt::Display for LunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Predicate applied to resource names during listings
pub type NameFilter<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// One operation per resource action of the appliance
///
/// Every call performs exactly one request, and ends in success or in one
/// classified [`RestError`](crate::backends::error::RestError).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Management address and port of the appliance
    fn address(&self) -> (String, u16);

    async fn get_pools(&self) -> RestResult<Vec<Pool>>;

    // Volumes
    async fn create_volume(&self, name: &str, size: i64) -> RestResult<()>;
    async fn get_volume(&self, name: &str) -> RestResult<Volume>;
    async fn delete_volume(&self, name: &str) -> RestResult<()>;
    async fn list_volumes(&self) -> RestResult<Vec<String>>;

    // Snapshots
    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()>;
    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<Snapshot>;
    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()>;
    async fn list_all_snapshots(&self, filter: NameFilter<'_>) -> RestResult<Vec<SnapshotShort>>;
    async fn list_volume_snapshots(
        &self,
        volume: &str,
        filter: NameFilter<'_>,
    ) -> RestResult<Vec<SnapshotShort>>;

    // Clones
    async fn create_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()>;
    async fn delete_clone(
        &self,
        volume: &str,
        snapshot: &str,
        clone: &str,
        recursively_children: bool,
        recursively_dependents: bool,
    ) -> RestResult<()>;
    async fn promote_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()>;

    // iSCSI targets
    async fn create_target(&self, target: &str) -> RestResult<()>;
    async fn delete_target(&self, target: &str) -> RestResult<()>;
    async fn attach_to_target(&self, target: &str, volume: &str, mode: LunMode) -> RestResult<()>;
    async fn detach_from_target(&self, target: &str, volume: &str) -> RestResult<()>;
    async fn add_user_to_target(&self, target: &str, user: &str, password: &str)
        -> RestResult<()>;
}

// =============================================================================
// Host Ports
// =============================================================================

/// Attach and detach iSCSI block devices on the host
#[async_trait]
pub trait IscsiInitiator: Send + Sync {
    /// Log into the target and wait for its device to appear
    async fn attach(&self, target: &TargetDescriptor) -> Result<()>;

    /// Log out of the target and forget the node record
    async fn detach(&self, target: &TargetDescriptor) -> Result<()>;
}

/// Format and mount filesystems
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Create `fs_type` on `device` if it carries none, then mount it
    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        flags: &[String],
    ) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;
}
