//! Node service
//!
//! Stage attaches the iSCSI target and remembers it in the staging
//! directory, publish mounts the device for a workload. Both halves are
//! idempotent: unstaging a volume that was never staged succeeds.

use super::target::TargetDescriptor;
use crate::config::NodeConfig;
use crate::domain::csi::*;
use crate::domain::ports::{IscsiInitiator, Mounter};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Capabilities advertised by the node
pub const NODE_CAPABILITIES: &[NodeCapability] = &[NodeCapability::StageUnstageVolume];

/// Node half of the plugin
pub struct NodeService {
    config: NodeConfig,
    initiator: Arc<dyn IscsiInitiator>,
    mounter: Arc<dyn Mounter>,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::InvalidArgument(format!("{} is missing", what)))
    } else {
        Ok(())
    }
}

impl NodeService {
    pub fn new(
        config: NodeConfig,
        initiator: Arc<dyn IscsiInitiator>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            config,
            initiator,
            mounter,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<NodeEmptyResponse> {
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability is missing".into()))?;

        let target = TargetDescriptor::from_context(
            &req.volume_id,
            &req.publish_context,
            Some(capability),
            &self.config,
        )?;
        let staging = Path::new(&req.staging_target_path);

        target.persist(staging).await?;
        if let Err(e) = self.initiator.attach(&target).await {
            if let Err(cleanup) = TargetDescriptor::remove(staging).await {
                warn!("Unable to remove target descriptor: {}", cleanup);
            }
            return Err(e);
        }

        info!("Staged volume {} at {}", req.volume_id, req.staging_target_path);
        Ok(NodeEmptyResponse {})
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<NodeEmptyResponse> {
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        let staging = Path::new(&req.staging_target_path);

        let Some(target) = TargetDescriptor::load(staging).await? else {
            info!("Volume {} is not staged", req.volume_id);
            return Ok(NodeEmptyResponse {});
        };

        self.initiator.detach(&target).await?;
        TargetDescriptor::remove(staging).await?;

        info!("Unstaged volume {}", req.volume_id);
        Ok(NodeEmptyResponse {})
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<NodeEmptyResponse> {
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        require(&req.target_path, "target path")?;
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability is missing".into()))?;

        let target = TargetDescriptor::load(Path::new(&req.staging_target_path))
            .await?
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("volume {} is not staged", req.volume_id))
            })?;

        let mount = capability.mount.clone().unwrap_or_default();
        let fs_type = if mount.fs_type.is_empty() {
            target.fs_type.clone()
        } else {
            mount.fs_type
        };
        let mut flags = mount.mount_flags;
        if req.readonly && !flags.iter().any(|f| f == "ro") {
            flags.push("ro".into());
        }

        self.mounter
            .format_and_mount(&target.device_path, &req.target_path, &fs_type, &flags)
            .await?;

        info!("Published volume {} at {}", req.volume_id, req.target_path);
        Ok(NodeEmptyResponse {})
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeEmptyResponse> {
        require(&req.volume_id, "volume id")?;
        require(&req.target_path, "target path")?;

        self.mounter.unmount(&req.target_path).await?;
        info!("Unpublished volume {} from {}", req.volume_id, req.target_path);
        Ok(NodeEmptyResponse {})
    }

    pub fn get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.config.id.clone(),
            max_volumes_per_node: 0,
        }
    }

    pub fn get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: NODE_CAPABILITIES.to_vec(),
        }
    }

    pub async fn get_volume_stats(&self) -> Result<()> {
        Err(Error::Unimplemented("NodeGetVolumeStats is not supported".into()))
    }

    pub async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse> {
        Err(Error::Unimplemented(format!(
            "NodeExpandVolume is not supported for {}",
            req.volume_id
        )))
    }
}
