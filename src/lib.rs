//! JovianDSS CSI Plugin
//!
//! Container Storage Interface plugin for JovianDSS ZFS-based SAN
//! appliances. The controller provisions volumes, snapshots and clones over
//! the appliance REST API and publishes volumes as iSCSI targets; the node
//! plugin logs into those targets and mounts the devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     REST API (csi.v1.* routes)                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────┐  │
//! │  │  Controller        │  │  Node              │  │  Identity      │  │
//! │  │  (provisioning,    │  │  (stage, publish)  │  │                │  │
//! │  │   clone workflow)  │  │                    │  │                │  │
//! │  └─────────┬──────────┘  └─────────┬──────────┘  └────────────────┘  │
//! │            │                       │                                  │
//! │  ┌─────────┴──────────┐  ┌─────────┴──────────┐                       │
//! │  │  StorageBackend    │  │  IscsiInitiator    │                       │
//! │  │  (JovianDSS REST)  │  │  Mounter           │                       │
//! │  └────────────────────┘  └────────────────────┘                       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: provisioning state machine, snapshot registry, clones, publishing
//! - [`backends`]: JovianDSS REST adapter and its error taxonomy
//! - [`node`]: iSCSI attach and filesystem mounting
//! - [`api`]: JSON-over-HTTP surface
//! - [`domain`]: CSI message types and capability traits
//! - [`error`]: Error types and status codes

pub mod api;
pub mod backends;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, AppState, RestRouter};
pub use backends::{BackendFactory, JovianStorage, RestError, RestErrorKind, RestProxy};
pub use config::{ControllerConfig, NodeConfig, PluginConfig, StorageEndpointConfig};
pub use controller::{derive_id, ControllerService, SnapshotId, SnapshotRegistry};
pub use domain::ports::{IscsiInitiator, Mounter, RestTransport, StorageBackend};
pub use error::{Error, Result, StatusCode};
pub use identity::{IdentityService, PLUGIN_NAME};
pub use metrics::CsiMetrics;
pub use node::{IscsiAdm, NodeService, SystemMounter, TargetDescriptor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
