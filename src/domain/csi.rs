//! Container Storage Interface request and response types
//!
//! Field names follow the protocol's JSON mapping (camelCase). Optional
//! messages are `Option`, repeated fields default to empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Capabilities
// =============================================================================

/// Volume access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Modes the plugin can serve over a single iSCSI session
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeWriter | AccessMode::SingleNodeReaderOnly
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountVolume {
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVolume {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVolume>,
}

impl VolumeCapability {
    pub fn mount(access_mode: AccessMode, fs_type: &str) -> Self {
        Self {
            access_mode,
            mount: Some(MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: Vec::new(),
            }),
            block: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    pub volume_id: String,
}

/// Content a new volume is populated from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeContentSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSource>,
}

impl VolumeContentSource {
    pub fn from_snapshot(snapshot_id: impl Into<String>) -> Self {
        Self {
            snapshot: Some(SnapshotSource {
                snapshot_id: snapshot_id.into(),
            }),
            volume: None,
        }
    }
}

// =============================================================================
// Controller: Volumes
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteVolumeResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVolumesResponse {
    pub entries: Vec<ListVolumesEntry>,
    pub next_token: String,
}

// =============================================================================
// Controller: Snapshots
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    /// Unix seconds
    pub creation_time: i64,
    pub ready_to_use: bool,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSnapshotResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshotsEntry {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshotsResponse {
    pub entries: Vec<ListSnapshotsEntry>,
    pub next_token: String,
}

// =============================================================================
// Controller: Publishing
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPublishVolumeResponse {
    pub publish_context: BTreeMap<String, String>,
}

impl std::fmt::Debug for ControllerPublishVolumeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&String> = self.publish_context.keys().collect();
        f.debug_struct("ControllerPublishVolumeResponse")
            .field("publish_context_keys", &keys)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeResponse {}

// =============================================================================
// Controller: Capabilities
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedCapabilities {
    pub volume_context: BTreeMap<String, String>,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<ConfirmedCapabilities>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
    ExpandVolume,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
    #[serde(default)]
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
    #[serde(default)]
    pub staging_target_path: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub target_path: String,
}

/// Empty reply of the node staging and publishing calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEmptyResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}
