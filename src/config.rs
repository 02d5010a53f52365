//! Plugin configuration
//!
//! Loaded once at startup from a YAML file. A process running the
//! controller needs a `controller` section, a node agent needs `node`.
//!
//! ```yaml
//! controller:
//!   salt: "s3cr3t"
//!   node_prefix: "csi-node-"
//!   storage_endpoints:
//!     - name: jdss-0
//!       addr: 192.168.21.100
//!       port: 82
//!       user: admin
//!       pass: admin
//!       pool: Pool-0
//! node:
//!   id: csi-node-worker-1
//!   addr: 192.168.21.100
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_IQN: &str = "iqn.csi.2019-04";
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

fn default_iqn() -> String {
    DEFAULT_IQN.to_string()
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_tries() -> u32 {
    3
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_iscsi_port() -> u16 {
    DEFAULT_ISCSI_PORT
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
    #[serde(default)]
    pub node: Option<NodeConfig>,
}

impl PluginConfig {
    /// Read and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: PluginConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.is_none() && self.node.is_none() {
            return Err(Error::Configuration(
                "neither controller nor node section is present".into(),
            ));
        }
        if let Some(controller) = &self.controller {
            controller.validate()?;
        }
        if let Some(node) = &self.node {
            node.validate()?;
        }
        Ok(())
    }
}

/// Controller settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Secret mixed into every derived identifier
    pub salt: String,
    #[serde(default = "default_iqn")]
    pub iqn: String,
    /// Prefix of node ids and of the snapshot registry volume
    #[serde(default)]
    pub node_prefix: String,
    pub storage_endpoints: Vec<StorageEndpointConfig>,
    /// iSCSI portal handed to nodes in the publish context
    #[serde(default)]
    pub iscsi_portal: Option<String>,
    #[serde(default)]
    pub iscsi_port: Option<u16>,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.salt.is_empty() {
            return Err(Error::Configuration("controller salt must be set".into()));
        }
        if self.iqn.is_empty() {
            return Err(Error::Configuration("controller iqn must not be empty".into()));
        }
        if self.storage_endpoints.is_empty() {
            return Err(Error::Configuration(
                "at least one storage endpoint is required".into(),
            ));
        }
        for endpoint in &self.storage_endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }

    /// Endpoint used for every operation
    pub fn primary_endpoint(&self) -> Result<&StorageEndpointConfig> {
        self.storage_endpoints
            .first()
            .ok_or_else(|| Error::Configuration("no storage endpoint configured".into()))
    }
}

/// One appliance management endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageEndpointConfig {
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub user: String,
    pub pass: String,
    pub pool: String,
    /// Attempts per request when the appliance is unreachable
    #[serde(default = "default_tries")]
    pub tries: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub insecure_tls: bool,
}

impl Default for StorageEndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            addr: String::new(),
            port: 82,
            protocol: default_protocol(),
            user: String::new(),
            pass: String::new(),
            pool: String::new(),
            tries: default_tries(),
            idle_timeout_secs: default_idle_timeout(),
            insecure_tls: true,
        }
    }
}

impl std::fmt::Debug for StorageEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEndpointConfig")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("pool", &self.pool)
            .field("tries", &self.tries)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

impl StorageEndpointConfig {
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("name", self.name.is_empty()),
            ("addr", self.addr.is_empty()),
            ("user", self.user.is_empty()),
            ("pool", self.pool.is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(Error::Configuration(format!(
                "storage endpoint {:?} is missing {}",
                self.name, field
            )));
        }
        if !matches!(self.protocol.as_str(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "storage endpoint {} has unsupported protocol {}",
                self.name, self.protocol
            )));
        }
        Ok(())
    }
}

/// Node agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    /// Default iSCSI portal address
    #[serde(default)]
    pub addr: String,
    #[serde(default = "default_iscsi_port")]
    pub port: u16,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Configuration("node id must be set".into()));
        }
        Ok(())
    }
}
