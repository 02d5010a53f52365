//! JovianDSS Storage Adapter
//!
//! Maps each [`StorageBackend`] operation onto one call of the appliance REST
//! API. A reply is a success only when its status equals the documented
//! success status of that call; any other reply is classified through the
//! `{data, error}` envelope and a per-call errno table.

use super::error::{RestError, RestErrorKind, RestResult};
use super::payload::*;
use super::transport::RestProxy;
use crate::config::StorageEndpointConfig;
use crate::domain::ports::{
    LunMode, NameFilter, RawResponse, RestTransport, StorageBackend, TransportError,
};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use urlencoding::encode;

type ErrnoTable = &'static [(i64, RestErrorKind)];

const DNE: ErrnoTable = &[(ERRNO_DOES_NOT_EXIST, RestErrorKind::ResourceDoesNotExist)];
const EXISTS: ErrnoTable = &[(ERRNO_EXISTS, RestErrorKind::ObjectExists)];
const DNE_OR_EXISTS: ErrnoTable = &[
    (ERRNO_DOES_NOT_EXIST, RestErrorKind::ResourceDoesNotExist),
    (ERRNO_EXISTS, RestErrorKind::ObjectExists),
];
const DNE_OR_BUSY: ErrnoTable = &[
    (ERRNO_DOES_NOT_EXIST, RestErrorKind::ResourceDoesNotExist),
    (ERRNO_BUSY, RestErrorKind::ResourceBusy),
];

/// CHAP user calls carry the target password in both directions
fn carries_secrets(path: &str) -> bool {
    path.ends_with("/incoming-users")
}

/// Adapter for one JovianDSS pool
pub struct JovianStorage {
    transport: Arc<dyn RestTransport>,
    pool: String,
    addr: String,
    port: u16,
}

impl JovianStorage {
    pub fn new(
        transport: Arc<dyn RestTransport>,
        pool: impl Into<String>,
        addr: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            transport,
            pool: pool.into(),
            addr: addr.into(),
            port,
        }
    }

    /// Build an adapter talking to `cfg` over HTTPS
    pub fn from_endpoint(cfg: &StorageEndpointConfig) -> Result<Self> {
        let proxy = RestProxy::new(cfg)?;
        Ok(Self::new(Arc::new(proxy), &cfg.pool, &cfg.addr, cfg.port))
    }

    fn pool_path(&self, version: &str) -> String {
        format!("api/{}/pools/{}", version, encode(&self.pool))
    }

    fn volume_path(&self, version: &str, volume: &str) -> String {
        format!("{}/volumes/{}", self.pool_path(version), encode(volume))
    }

    fn snapshot_path(&self, version: &str, volume: &str, snapshot: &str) -> String {
        format!(
            "{}/snapshots/{}",
            self.volume_path(version, volume),
            encode(snapshot)
        )
    }

    fn clone_path(&self, volume: &str, snapshot: &str, clone: &str) -> String {
        format!(
            "{}/clones/{}",
            self.snapshot_path("v3", volume, snapshot),
            encode(clone)
        )
    }

    fn targets_path(&self) -> String {
        format!("{}/san/iscsi/targets", self.pool_path("v2"))
    }

    fn target_path(&self, target: &str) -> String {
        format!("{}/{}", self.targets_path(), encode(&target.to_lowercase()))
    }

    async fn call<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> RestResult<RawResponse> {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| {
                RestError::new(
                    RestErrorKind::RequestMalfunction,
                    format!("Unable to encode request for {}: {}", path, e),
                )
            })?;

        if carries_secrets(path) {
            trace!("{} {} body=<redacted>", method, path);
        } else {
            trace!("{} {} body={:?}", method, path, body);
        }

        let rsp = self
            .transport
            .send(method, path, body)
            .await
            .map_err(|e| match e {
                TransportError::Connect(msg) => RestError::new(
                    RestErrorKind::UnableToConnect,
                    format!("Unable to reach storage {}: {}", self.addr, msg),
                ),
                TransportError::Request(msg) => RestError::new(
                    RestErrorKind::RequestMalfunction,
                    format!("Internal failure in communication with storage {}: {}", self.addr, msg),
                ),
            })?;

        if carries_secrets(path) {
            trace!("{} -> {}", path, rsp.status);
        } else {
            trace!("{} -> {} {}", path, rsp.status, rsp.body_text());
        }
        Ok(rsp)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> RestResult<(u16, RawResponse, Option<T>)> {
        let rsp = self.call::<()>(Method::GET, path, None).await?;
        if rsp.status == 200 {
            let data = decode::<T>(&rsp, what)?;
            return Ok((rsp.status, rsp, Some(data)));
        }
        Ok((rsp.status, rsp, None))
    }
}

/// Decode the `data` member of a successful reply
fn decode<T: DeserializeOwned>(rsp: &RawResponse, what: &str) -> RestResult<T> {
    serde_json::from_slice::<DataEnvelope<T>>(&rsp.body)
        .map(|env| env.data)
        .map_err(|e| {
            let err = RestError::new(
                RestErrorKind::ResponseProcessingMalfunction,
                format!("{}: unable to decode {}: {}", what, rsp.body_text(), e),
            );
            warn!("{}", err);
            err
        })
}

/// Classify an unexpected reply
fn classify(rsp: &RawResponse, errnos: &[(i64, RestErrorKind)], what: &str) -> RestError {
    if rsp.body.is_empty() {
        let err = RestError::new(
            RestErrorKind::Unknown,
            format!("{}: empty reply with status {}", what, rsp.status),
        );
        warn!("{}", err);
        return err;
    }

    let envelope: ErrorEnvelope = match serde_json::from_slice(&rsp.body) {
        Ok(env) => env,
        Err(e) => {
            let err = RestError::new(
                RestErrorKind::ResponseProcessingMalfunction,
                format!(
                    "{}: unable to extract error from {}: {}",
                    what,
                    rsp.body_text(),
                    e
                ),
            );
            warn!("{}", err);
            return err;
        }
    };

    let body = match envelope.error {
        Some(body) if body.errno != 0 && !body.message.is_empty() => body,
        _ => {
            let err = RestError::new(
                RestErrorKind::ResponseProcessingMalfunction,
                format!("{}: error number or message not set in {}", what, rsp.body_text()),
            );
            warn!("{}", err);
            return err;
        }
    };

    let kind = errnos
        .iter()
        .find(|(errno, _)| *errno == body.errno)
        .map(|(_, kind)| *kind)
        .unwrap_or(RestErrorKind::StorageFailureUnknown);

    let err = RestError::new(
        kind,
        format!("{}: {} (errno {})", what, body.message, body.errno),
    );
    debug!("{}", err);
    err
}

fn missing(what: String) -> RestError {
    RestError::new(RestErrorKind::ResourceDoesNotExist, what)
}

#[async_trait]
impl StorageBackend for JovianStorage {
    fn address(&self) -> (String, u16) {
        (self.addr.clone(), self.port)
    }

    async fn get_pools(&self) -> RestResult<Vec<Pool>> {
        let rsp = self.call::<()>(Method::GET, "api/v3/pools", None).await?;
        if rsp.status == GET_POOLS_STATUS {
            return decode(&rsp, "list pools");
        }
        Err(classify(&rsp, &[], "list pools"))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn create_volume(&self, name: &str, size: i64) -> RestResult<()> {
        let what = format!("create volume {}", name);
        let body = CreateVolumeBody {
            name: name.to_string(),
            size: size.to_string(),
        };
        let path = format!("{}/volumes", self.pool_path("v2"));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == CREATE_VOLUME_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, EXISTS, &what))
    }

    async fn get_volume(&self, name: &str) -> RestResult<Volume> {
        let what = format!("get volume {}", name);
        let (status, rsp, data) = self
            .get::<Volume>(&self.volume_path("v2", name), &what)
            .await?;

        match (status, data) {
            (GET_VOLUME_STATUS, Some(vol)) => Ok(vol),
            (NOT_FOUND_STATUS, _) => Err(missing(format!("Volume {} does not exist", name))),
            _ => Err(classify(&rsp, DNE, &what)),
        }
    }

    async fn delete_volume(&self, name: &str) -> RestResult<()> {
        let what = format!("delete volume {}", name);
        let body = DeleteVolumeBody::default();
        let rsp = self
            .call(Method::DELETE, &self.volume_path("v3", name), Some(&body))
            .await?;

        if rsp.status == DELETE_VOLUME_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_BUSY, &what))
    }

    async fn list_volumes(&self) -> RestResult<Vec<String>> {
        let path = format!("{}/volumes", self.pool_path("v3"));
        let (status, rsp, data) = self.get::<Vec<Volume>>(&path, "list volumes").await?;

        match (status, data) {
            (GET_VOLUMES_STATUS, Some(vols)) => Ok(vols.into_iter().map(|v| v.name).collect()),
            _ => Err(classify(&rsp, &[], "list volumes")),
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()> {
        let what = format!("create snapshot {} of volume {}", snapshot, volume);
        let body = CreateSnapshotBody {
            snapshot_name: snapshot.to_string(),
        };
        let path = format!("{}/snapshots", self.volume_path("v2", volume));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == CREATE_SNAPSHOT_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_EXISTS, &what))
    }

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<Snapshot> {
        let what = format!("get snapshot {} of volume {}", snapshot, volume);
        let (status, rsp, data) = self
            .get::<Snapshot>(&self.snapshot_path("v3", volume, snapshot), &what)
            .await?;

        match (status, data) {
            (GET_SNAPSHOT_STATUS, Some(snap)) => Ok(snap),
            (GET_SNAPSHOT_MISSING_STATUS, _) => Err(missing(format!(
                "Snapshot {} of volume {} does not exist",
                snapshot, volume
            ))),
            _ => Err(classify(&rsp, DNE, &what)),
        }
    }

    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()> {
        let what = format!("delete snapshot {} of volume {}", snapshot, volume);
        let body = DeleteSnapshotBody::default();
        let rsp = self
            .call(
                Method::DELETE,
                &self.snapshot_path("v3", volume, snapshot),
                Some(&body),
            )
            .await?;

        if rsp.status == DELETE_SNAPSHOT_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_BUSY, &what))
    }

    async fn list_all_snapshots(&self, filter: NameFilter<'_>) -> RestResult<Vec<SnapshotShort>> {
        let path = format!("{}/volumes/snapshots", self.pool_path("v3"));
        let (status, rsp, data) = self.get::<AllSnapshots>(&path, "list snapshots").await?;

        let listing = match (status, data) {
            (GET_ALL_SNAPSHOTS_STATUS, Some(listing)) => listing,
            _ => return Err(classify(&rsp, &[], "list snapshots")),
        };
        if listing.results <= 0 {
            return Ok(Vec::new());
        }

        Ok(listing
            .entries
            .into_iter()
            .filter(|s| filter(s.name.as_str()))
            .collect())
    }

    async fn list_volume_snapshots(
        &self,
        volume: &str,
        filter: NameFilter<'_>,
    ) -> RestResult<Vec<SnapshotShort>> {
        let what = format!("list snapshots of volume {}", volume);
        let path = format!("{}/snapshots", self.volume_path("v3", volume));
        let (status, rsp, data) = self.get::<VolSnapshots>(&path, &what).await?;

        let listing = match (status, data) {
            (GET_VOL_SNAPSHOTS_STATUS, Some(listing)) => listing,
            _ => return Err(classify(&rsp, DNE, &what)),
        };
        if listing.results <= 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(listing.entries.len());
        for snap in listing.entries {
            if !filter(snap.name.as_str()) {
                continue;
            }
            let created = match parse_timestamp(&snap.creation) {
                Ok(ts) => ts,
                Err(e) => {
                    debug!("Skipping snapshot {}: {}", snap.name, e);
                    continue;
                }
            };
            out.push(SnapshotShort {
                volume: volume.to_string(),
                name: snap.name,
                properties: SnapshotProperties {
                    creation: created.to_string(),
                },
            });
        }

        Ok(out)
    }

    // =========================================================================
    // Clones
    // =========================================================================

    async fn create_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()> {
        let what = format!("clone snapshot {} of volume {} as {}", snapshot, volume, clone);
        let body = CreateCloneBody {
            name: clone.to_string(),
            snapshot: snapshot.to_string(),
        };
        let path = format!("{}/clone", self.volume_path("v2", volume));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == CREATE_CLONE_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_EXISTS, &what))
    }

    async fn delete_clone(
        &self,
        volume: &str,
        snapshot: &str,
        clone: &str,
        recursively_children: bool,
        recursively_dependents: bool,
    ) -> RestResult<()> {
        let what = format!("delete clone {} of snapshot {}", clone, snapshot);
        let body = DeleteCloneBody {
            recursively_children,
            recursively_dependents,
            force_umount: false,
        };
        let rsp = self
            .call(
                Method::DELETE,
                &self.clone_path(volume, snapshot, clone),
                Some(&body),
            )
            .await?;

        if rsp.status == DELETE_CLONE_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_BUSY, &what))
    }

    async fn promote_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()> {
        let what = format!("promote clone {} of snapshot {}", clone, snapshot);
        let body = PromoteCloneBody {
            poolname: self.pool.clone(),
        };
        let path = format!("{}/promote", self.clone_path(volume, snapshot, clone));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == PROMOTE_CLONE_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE, &what))
    }

    // =========================================================================
    // iSCSI Targets
    // =========================================================================

    async fn create_target(&self, target: &str) -> RestResult<()> {
        let target = target.to_lowercase();
        let what = format!("create target {}", target);
        let body = CreateTargetBody {
            name: target.clone(),
            active: true,
            incoming_users_active: true,
        };
        let rsp = self
            .call(Method::POST, &self.targets_path(), Some(&body))
            .await?;

        if rsp.status == CREATE_TARGET_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, EXISTS, &what))
    }

    async fn delete_target(&self, target: &str) -> RestResult<()> {
        let what = format!("delete target {}", target);
        let rsp = self
            .call::<()>(Method::DELETE, &self.target_path(target), None)
            .await?;

        match rsp.status {
            DELETE_TARGET_STATUS => Ok(()),
            NOT_FOUND_STATUS => Err(missing(format!("Target {} does not exist", target))),
            _ => Err(classify(&rsp, DNE_OR_BUSY, &what)),
        }
    }

    async fn attach_to_target(&self, target: &str, volume: &str, mode: LunMode) -> RestResult<()> {
        let what = format!("attach volume {} to target {}", volume, target);
        let body = AttachToTargetBody {
            name: volume.to_string(),
            lun: 0,
            mode: mode.as_str().to_string(),
        };
        let path = format!("{}/luns", self.target_path(target));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == ATTACH_TO_TARGET_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, DNE_OR_EXISTS, &what))
    }

    async fn detach_from_target(&self, target: &str, volume: &str) -> RestResult<()> {
        let what = format!("detach volume {} from target {}", volume, target);
        let path = format!("{}/luns/{}", self.target_path(target), encode(volume));
        let rsp = self.call::<()>(Method::DELETE, &path, None).await?;

        match rsp.status {
            DETACH_FROM_TARGET_STATUS => Ok(()),
            NOT_FOUND_STATUS => Err(missing(format!(
                "Volume {} is not attached to target {}",
                volume, target
            ))),
            _ => Err(classify(&rsp, DNE, &what)),
        }
    }

    async fn add_user_to_target(
        &self,
        target: &str,
        user: &str,
        password: &str,
    ) -> RestResult<()> {
        let what = format!("add user {} to target {}", user, target);
        let body = AddUserToTargetBody {
            name: user.to_string(),
            password: password.to_string(),
        };
        let path = format!("{}/incoming-users", self.target_path(target));
        let rsp = self.call(Method::POST, &path, Some(&body)).await?;

        if rsp.status == ADD_USER_TO_TARGET_STATUS {
            return Ok(());
        }
        Err(classify(&rsp, EXISTS, &what))
    }
}
