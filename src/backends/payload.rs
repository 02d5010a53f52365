//! Appliance REST Payloads
//!
//! Request bodies, response bodies and the documented success status of each
//! call in the JovianDSS management API.

use super::error::{RestError, RestErrorKind, RestResult};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Success Status Codes
// =============================================================================

pub const GET_POOLS_STATUS: u16 = 200;
pub const GET_VOLUME_STATUS: u16 = 200;
pub const GET_VOLUMES_STATUS: u16 = 200;
pub const CREATE_VOLUME_STATUS: u16 = 201;
pub const DELETE_VOLUME_STATUS: u16 = 204;
pub const GET_SNAPSHOT_STATUS: u16 = 200;
/// The appliance answers a lookup of a missing snapshot with 500
pub const GET_SNAPSHOT_MISSING_STATUS: u16 = 500;
pub const CREATE_SNAPSHOT_STATUS: u16 = 200;
pub const DELETE_SNAPSHOT_STATUS: u16 = 204;
pub const GET_ALL_SNAPSHOTS_STATUS: u16 = 200;
pub const GET_VOL_SNAPSHOTS_STATUS: u16 = 200;
pub const CREATE_CLONE_STATUS: u16 = 200;
pub const DELETE_CLONE_STATUS: u16 = 200;
pub const PROMOTE_CLONE_STATUS: u16 = 200;
pub const CREATE_TARGET_STATUS: u16 = 201;
pub const DELETE_TARGET_STATUS: u16 = 204;
pub const ATTACH_TO_TARGET_STATUS: u16 = 201;
pub const DETACH_FROM_TARGET_STATUS: u16 = 204;
pub const ADD_USER_TO_TARGET_STATUS: u16 = 201;

/// Status returned for unknown targets and LUNs
pub const NOT_FOUND_STATUS: u16 = 404;

// =============================================================================
// Error Numbers
// =============================================================================

pub const ERRNO_DOES_NOT_EXIST: i64 = 1;
pub const ERRNO_EXISTS: i64 = 5;
pub const ERRNO_BUSY: i64 = 1000;

/// Layout of creation timestamps, components are not zero padded
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// =============================================================================
// Error Envelope
// =============================================================================

/// Error details carried in a failed response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub url: String,
}

/// `{ data, error }` envelope wrapping every appliance response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

/// Success envelope with typed data
#[derive(Debug, Clone, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

// =============================================================================
// Resources
// =============================================================================

/// Storage pool summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub operation: String,
}

/// Volume as reported by the appliance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    /// Size in bytes, rendered as a decimal string
    #[serde(default)]
    pub volsize: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub is_clone: bool,
    #[serde(default)]
    pub creation: String,
    #[serde(default)]
    pub compression: String,
    #[serde(default)]
    pub dedup: String,
    /// Remaining properties, passed through untouched
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Volume {
    /// Parse the declared size
    pub fn size_bytes(&self) -> RestResult<i64> {
        self.volsize.trim().parse::<i64>().map_err(|e| {
            RestError::new(
                RestErrorKind::ResponseProcessingMalfunction,
                format!("Volume {} has invalid size {:?}: {}", self.name, self.volsize, e),
            )
        })
    }
}

/// Snapshot as reported by the appliance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub creation: String,
    #[serde(default)]
    pub referenced: String,
    #[serde(default)]
    pub used: String,
    #[serde(default)]
    pub clones: String,
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProperties {
    #[serde(default)]
    pub creation: String,
}

/// Snapshot entry of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotShort {
    #[serde(default)]
    pub volume: String,
    pub name: String,
    #[serde(default)]
    pub properties: SnapshotProperties,
}

/// Pool-wide snapshot listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AllSnapshots {
    #[serde(default)]
    pub results: i64,
    #[serde(default)]
    pub entries: Vec<SnapshotShort>,
}

/// Per-volume snapshot listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolSnapshots {
    #[serde(default)]
    pub results: i64,
    #[serde(default)]
    pub entries: Vec<Snapshot>,
}

// =============================================================================
// Request Bodies
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeBody {
    pub name: String,
    pub size: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteVolumeBody {
    pub recursively_children: bool,
    pub recursively_dependents: bool,
    pub force_umount: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSnapshotBody {
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteSnapshotBody {
    pub recursively_dependents: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCloneBody {
    pub name: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteCloneBody {
    pub recursively_children: bool,
    pub recursively_dependents: bool,
    pub force_umount: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoteCloneBody {
    pub poolname: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTargetBody {
    pub name: String,
    pub active: bool,
    pub incoming_users_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachToTargetBody {
    pub name: String,
    pub lun: u32,
    pub mode: String,
}

#[derive(Serialize)]
pub struct AddUserToTargetBody {
    pub name: String,
    pub password: String,
}

impl std::fmt::Debug for AddUserToTargetBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddUserToTargetBody")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Convert an appliance creation timestamp into Unix seconds
pub fn parse_timestamp(raw: &str) -> RestResult<i64> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .map(|t| t.and_utc().timestamp())
        .map_err(|e| {
            RestError::new(
                RestErrorKind::RequestMalfunction,
                format!("Unable to parse timestamp {:?}: {}", raw, e),
            )
        })
}
