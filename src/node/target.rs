//! Target descriptor
//!
//! Everything the node needs to attach and later detach one published
//! volume. The descriptor is written next to the staging path at stage time
//! so unstage can tear the session down without asking the controller.

use crate::config::{NodeConfig, DEFAULT_ISCSI_PORT};
use crate::controller::publish::context_keys;
use crate::domain::csi::VolumeCapability;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the descriptor inside the staging directory
pub const DESCRIPTOR_FILE: &str = "starget";

/// Placeholder written instead of CHAP secrets
pub const CLEARED: &str = "<Cleared>";

pub const DEFAULT_FS_TYPE: &str = "ext3";

/// An iSCSI target as seen from the node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub portal: String,
    pub port: u16,
    pub iqn: String,
    pub target: String,
    pub volume_id: String,
    pub lun: u32,
    pub chap_user: String,
    pub chap_pass: String,
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
    pub device_path: String,
}

impl std::fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("portal", &self.portal)
            .field("port", &self.port)
            .field("target", &self.target)
            .field("lun", &self.lun)
            .field("chap_user", &self.chap_user)
            .field("chap_pass", &"<redacted>")
            .field("fs_type", &self.fs_type)
            .field("device_path", &self.device_path)
            .finish()
    }
}

fn required<'a>(ctx: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    match ctx.get(key) {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        _ => Err(Error::InvalidArgument(format!(
            "publish context is missing {}",
            key
        ))),
    }
}

impl TargetDescriptor {
    /// Build a descriptor from the publish context of a volume
    ///
    /// The portal and port in the context take precedence over the node
    /// configuration.
    pub fn from_context(
        volume_id: &str,
        ctx: &BTreeMap<String, String>,
        capability: Option<&VolumeCapability>,
        node: &NodeConfig,
    ) -> Result<Self> {
        let iqn = required(ctx, context_keys::IQN)?.to_string();
        let chap_user = required(ctx, context_keys::USER)?.to_string();
        let chap_pass = required(ctx, context_keys::PASS)?.to_string();

        let portal = match ctx.get(context_keys::ADDR) {
            Some(addr) if !addr.is_empty() => addr.clone(),
            _ => node.addr.clone(),
        };
        if portal.is_empty() {
            return Err(Error::InvalidArgument(
                "no iSCSI portal in publish context or node configuration".into(),
            ));
        }

        let port = match ctx.get(context_keys::PORT) {
            Some(raw) => raw.parse::<u16>().map_err(|e| {
                Error::InvalidArgument(format!("invalid portal port {}: {}", raw, e))
            })?,
            None if node.port != 0 => node.port,
            None => DEFAULT_ISCSI_PORT,
        };

        let lun = match ctx.get(context_keys::LUN) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| Error::InvalidArgument(format!("invalid lun {}: {}", raw, e)))?,
            None => 0,
        };

        let target = match ctx.get(context_keys::TARGET) {
            Some(target) if !target.is_empty() => target.clone(),
            _ => format!("{}:{}", iqn, volume_id).to_lowercase(),
        };

        let mount = capability.and_then(|c| c.mount.as_ref());
        let fs_type = mount
            .map(|m| m.fs_type.clone())
            .filter(|fs| !fs.is_empty())
            .or_else(|| ctx.get(context_keys::FS_TYPE).cloned())
            .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string());
        let mount_flags = mount.map(|m| m.mount_flags.clone()).unwrap_or_default();

        let device_path = format!(
            "/dev/disk/by-path/ip-{}:{}-iscsi-{}-lun-{}",
            portal, port, target, lun
        );

        Ok(Self {
            portal,
            port,
            iqn,
            target,
            volume_id: volume_id.to_string(),
            lun,
            chap_user,
            chap_pass,
            fs_type,
            mount_flags,
            device_path,
        })
    }

    /// `{portal}:{port}` as iscsiadm expects it
    pub fn portal_address(&self) -> String {
        format!("{}:{}", self.portal, self.port)
    }

    pub fn file_path(staging: &Path) -> PathBuf {
        staging.join(DESCRIPTOR_FILE)
    }

    /// Copy with CHAP secrets replaced by a placeholder
    pub fn redacted(&self) -> Self {
        Self {
            chap_user: CLEARED.to_string(),
            chap_pass: CLEARED.to_string(),
            ..self.clone()
        }
    }

    /// Write the redacted descriptor under `staging`
    pub async fn persist(&self, staging: &Path) -> Result<()> {
        tokio::fs::create_dir_all(staging).await?;
        let raw = serde_yaml::to_string(&self.redacted())?;
        let path = Self::file_path(staging);
        tokio::fs::write(&path, raw).await?;
        debug!("Stored target descriptor at {}", path.display());
        Ok(())
    }

    /// Read the descriptor under `staging`, if any
    pub async fn load(staging: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(Self::file_path(staging)).await {
            Ok(raw) => Ok(Some(serde_yaml::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the descriptor under `staging`; a missing file is fine
    pub async fn remove(staging: &Path) -> Result<()> {
        match tokio::fs::remove_file(Self::file_path(staging)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
