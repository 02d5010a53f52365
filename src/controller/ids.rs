//! Identifier derivation
//!
//! Orchestration names never reach the appliance. Volumes and snapshot
//! hashes are named `hex(sha256(salt || name))`, so retrying a request with
//! the same name always lands on the same backend object. A snapshot id
//! carries its owning volume: `{volume_id}_{hash}`.

use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a derived identifier
pub const DERIVED_ID_LEN: usize = 64;

/// Separator between the volume and hash parts of a snapshot id
pub const SNAPSHOT_ID_SEPARATOR: char = '_';

/// Number of id characters used to name temporary clone artifacts
const TEMPORARY_PREFIX_LEN: usize = 10;

/// Lowercase hex SHA-256 of `salt || name`
pub fn derive_id(salt: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check whether `id` already has the shape of a derived identifier
pub fn is_derived_id(id: &str) -> bool {
    id.len() == DERIVED_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Map a possibly human-readable volume id onto its derived form
pub fn normalize_volume_id(salt: &str, id: &str) -> String {
    if is_derived_id(id) {
        id.to_string()
    } else {
        derive_id(salt, id)
    }
}

/// Name of a temporary artifact derived from `id`
pub fn temporary_name(id: &str, suffix: &str) -> String {
    let prefix: String = id.chars().take(TEMPORARY_PREFIX_LEN).collect();
    format!("{}{}", prefix, suffix)
}

/// Check whether a snapshot name splits into exactly two parts
pub fn is_well_formed_snapshot_name(name: &str) -> bool {
    name.split(SNAPSHOT_ID_SEPARATOR).count() == 2
}

/// Composite snapshot identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    volume_id: String,
    hash: String,
}

impl SnapshotId {
    pub fn compose(volume_id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            hash: hash.into(),
        }
    }

    /// Split `raw` into its volume and hash parts
    ///
    /// Returns `None` unless splitting on `_` yields exactly two parts.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(SNAPSHOT_ID_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(volume_id), Some(hash), None) => Some(Self::compose(volume_id, hash)),
            _ => None,
        }
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.volume_id, SNAPSHOT_ID_SEPARATOR, self.hash)
    }
}
