//! Publish and unpublish
//!
//! A published volume is exposed through its own iSCSI target
//! `{iqn}:{volume_id}`, guarded by a freshly generated CHAP user and carrying
//! the volume as LUN 0. The appliance holds the only record of publication:
//! unpublishing tolerates a target or LUN that is already gone.

use super::ids::normalize_volume_id;
use super::service::ControllerService;
use crate::backends::error::RestErrorKind;
use crate::domain::csi::{
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse,
};
use crate::domain::ports::LunMode;
use crate::error::{Error, Result};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info};

const CHAP_USER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";
const CHAP_USER_LEN: usize = 12;

const CHAP_PASS_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@";
const CHAP_PASS_LEN: usize = 16;

/// Publish context keys read by the node plugin
pub mod context_keys {
    pub const USER: &str = "name";
    pub const PASS: &str = "pass";
    pub const IQN: &str = "iqn";
    pub const TARGET: &str = "target";
    pub const ADDR: &str = "addr";
    pub const PORT: &str = "port";
    pub const LUN: &str = "lun";
    pub const FS_TYPE: &str = "fsType";
}

/// Ephemeral CHAP user of one target
#[derive(Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub user: String,
    pub password: String,
}

impl ChapCredentials {
    /// Credentials drawn from the thread-local CSPRNG
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            user: random_string(rng, CHAP_USER_ALPHABET, CHAP_USER_LEN),
            password: random_string(rng, CHAP_PASS_ALPHABET, CHAP_PASS_LEN),
        }
    }
}

impl std::fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn random_string<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Name of the target exposing `volume_id`
pub fn target_name(iqn: &str, volume_id: &str) -> String {
    format!("{}:{}", iqn, volume_id).to_lowercase()
}

impl ControllerService {
    fn check_node_id(&self, node_id: &str) -> Result<()> {
        let prefix = self.config.node_prefix.as_str();
        if node_id.is_empty() {
            return Err(Error::InvalidArgument("node id is missing".into()));
        }
        if node_id.len() < prefix.len() {
            return Err(Error::InvalidArgument(format!(
                "node id {} is shorter than prefix {}",
                node_id, prefix
            )));
        }
        if !node_id.starts_with(prefix) {
            return Err(Error::NotFound(format!(
                "node {} is not managed by this plugin",
                node_id
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    pub async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is missing".into()));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability is missing".into()))?;
        if !capability.access_mode.is_supported() {
            return Err(Error::InvalidArgument(format!(
                "access mode {:?} is not supported",
                capability.access_mode
            )));
        }
        self.check_node_id(&req.node_id)?;

        let volume_id = normalize_volume_id(&self.config.salt, &req.volume_id);
        self.get_volume(&volume_id).await?;

        let target = target_name(&self.config.iqn, &volume_id);
        match self.backend.create_target(&target).await {
            Ok(()) => debug!("Created target {}", target),
            Err(e) if e.is(RestErrorKind::ObjectExists) => {
                return Err(Error::AlreadyExists(format!(
                    "target {} already exists: {}",
                    target, e
                )))
            }
            Err(e) => {
                return Err(Error::from_backend(&format!("create target {}", target), &e))
            }
        }

        let chap = ChapCredentials::generate();
        self.backend
            .add_user_to_target(&target, &chap.user, &chap.password)
            .await
            .map_err(|e| Error::from_backend(&format!("add user to target {}", target), &e))?;

        let mode = LunMode::from_readonly(req.readonly);
        self.backend
            .attach_to_target(&target, &volume_id, mode)
            .await
            .map_err(|e| Error::from_backend(&format!("attach {} to {}", volume_id, target), &e))?;

        info!("Published volume {} on {} ({})", volume_id, target, mode);

        let mut publish_context = BTreeMap::new();
        publish_context.insert(context_keys::USER.to_string(), chap.user);
        publish_context.insert(context_keys::PASS.to_string(), chap.password);
        publish_context.insert(context_keys::IQN.to_string(), self.config.iqn.clone());
        publish_context.insert(context_keys::TARGET.to_string(), target);
        if let Some(portal) = &self.config.iscsi_portal {
            publish_context.insert(context_keys::ADDR.to_string(), portal.clone());
        }
        if let Some(port) = self.config.iscsi_port {
            publish_context.insert(context_keys::PORT.to_string(), port.to_string());
        }

        Ok(ControllerPublishVolumeResponse { publish_context })
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    pub async fn unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is missing".into()));
        }

        let volume_id = normalize_volume_id(&self.config.salt, &req.volume_id);
        let target = target_name(&self.config.iqn, &volume_id);

        match self.backend.detach_from_target(&target, &volume_id).await {
            Ok(()) => debug!("Detached {} from {}", volume_id, target),
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                debug!("Volume {} is not attached to {}", volume_id, target)
            }
            Err(e) => {
                return Err(Error::from_backend(
                    &format!("detach {} from {}", volume_id, target),
                    &e,
                ))
            }
        }

        match self.backend.delete_target(&target).await {
            Ok(()) => info!("Unpublished volume {}", volume_id),
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                debug!("Target {} already gone", target)
            }
            Err(e) => {
                return Err(Error::from_backend(&format!("delete target {}", target), &e))
            }
        }

        Ok(ControllerUnpublishVolumeResponse {})
    }
}
