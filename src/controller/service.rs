//! Controller service
//!
//! Maps idempotent, possibly retried orchestration requests onto sequences of
//! backend calls. Identifiers are derived from request names, so a retried
//! request always addresses the same backend object, and "already exists"
//! replies caused by a retry are treated as success.

use super::clone::CloneWorkflow;
use super::ids::{derive_id, is_well_formed_snapshot_name, SnapshotId};
use super::paging::{paginate, parse_offset};
use super::registry::SnapshotRegistry;
use crate::backends::error::RestErrorKind;
use crate::backends::payload::{self, parse_timestamp, SnapshotShort};
use crate::config::ControllerConfig;
use crate::domain::csi::*;
use crate::domain::ports::StorageBackend;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Smallest volume the controller creates
pub const MIN_VOLUME_SIZE: i64 = 16 * 1024 * 1024;

/// Capabilities advertised by the controller
pub const CONTROLLER_CAPABILITIES: &[ControllerCapability] = &[
    ControllerCapability::ListVolumes,
    ControllerCapability::CreateDeleteVolume,
    ControllerCapability::CreateDeleteSnapshot,
    ControllerCapability::ListSnapshots,
    ControllerCapability::PublishUnpublishVolume,
];

/// Pick the size to provision from a requested range
///
/// `required_bytes` wins when it reaches the minimum, then `limit_bytes`,
/// then the minimum itself.
pub fn resolve_size(range: Option<&CapacityRange>) -> i64 {
    let range = range.copied().unwrap_or_default();
    if range.required_bytes >= MIN_VOLUME_SIZE {
        return range.required_bytes;
    }
    if range.limit_bytes >= MIN_VOLUME_SIZE {
        debug!(
            "Required size {} below minimum, using limit {}",
            range.required_bytes, range.limit_bytes
        );
        return range.limit_bytes;
    }
    debug!("Requested sizes below minimum, using {}", MIN_VOLUME_SIZE);
    MIN_VOLUME_SIZE
}

/// Provisioning state machine for one appliance
pub struct ControllerService {
    pub(super) config: ControllerConfig,
    pub(super) backend: Arc<dyn StorageBackend>,
    registry: SnapshotRegistry,
}

impl ControllerService {
    pub fn new(config: ControllerConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let registry = SnapshotRegistry::new(backend.clone(), &config.node_prefix);
        Self {
            config,
            backend,
            registry,
        }
    }

    /// Prepare the appliance for serving requests
    pub async fn initialize(&self) -> Result<()> {
        self.registry.ensure_volume().await?;
        info!(
            "Controller ready, snapshot registry {}",
            self.registry.volume()
        );
        Ok(())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn require_capability(&self, cap: ControllerCapability) -> Result<()> {
        if CONTROLLER_CAPABILITIES.contains(&cap) {
            Ok(())
        } else {
            Err(Error::Internal(format!("capability {:?} is not supported", cap)))
        }
    }

    /// Pools of the appliance
    pub async fn get_pools(&self) -> Result<Vec<payload::Pool>> {
        self.backend
            .get_pools()
            .await
            .map_err(|e| Error::from_backend("list pools", &e))
    }

    /// Look up a backend volume
    ///
    /// Transport malfunctions on this lookup count as a missing volume.
    pub async fn get_volume(&self, id: &str) -> Result<payload::Volume> {
        match self.backend.get_volume(id).await {
            Ok(vol) => Ok(vol),
            Err(e)
                if e.is(RestErrorKind::ResourceDoesNotExist)
                    || e.is(RestErrorKind::RequestMalfunction) =>
            {
                Err(Error::NotFound(format!("volume {}: {}", id, e)))
            }
            Err(e) => Err(Error::Internal(format!("get volume {}: {}", id, e))),
        }
    }

    /// Look up a snapshot by its composite id
    pub async fn get_snapshot(&self, id: &str) -> Result<payload::Snapshot> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("snapshot id is missing".into()));
        }
        let sid = SnapshotId::parse(id)
            .ok_or_else(|| Error::NotFound(format!("snapshot id {} is malformed", id)))?;

        self.backend
            .get_snapshot(sid.volume_id(), id)
            .await
            .map_err(|e| Error::from_backend(&format!("get snapshot {}", id), &e))
    }

    async fn volume_size(&self, id: &str) -> Result<i64> {
        self.get_volume(id)
            .await?
            .size_bytes()
            .map_err(|e| Error::Internal(e.to_string()))
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        self.require_capability(ControllerCapability::CreateDeleteVolume)?;

        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is missing".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities are missing".into(),
            ));
        }

        let source = req.volume_content_source.clone().unwrap_or_default();
        if source.volume.is_some() {
            return Err(Error::Unimplemented(
                "volume cloning is not supported".into(),
            ));
        }

        let size = resolve_size(req.capacity_range.as_ref());
        let volume_id = derive_id(&self.config.salt, &req.name);
        debug!("Volume {} maps to {}", req.name, volume_id);

        let volume = |capacity_bytes: i64| CreateVolumeResponse {
            volume: Volume {
                volume_id: volume_id.clone(),
                capacity_bytes,
                volume_context: req.parameters.clone(),
                content_source: req.volume_content_source.clone(),
            },
        };

        match self.get_volume(&volume_id).await {
            Ok(existing) => {
                let existing_size = existing
                    .size_bytes()
                    .map_err(|e| Error::Internal(e.to_string()))?;
                if source.snapshot.is_some() {
                    info!("Volume {} already restored", volume_id);
                    return Ok(volume(existing_size));
                }
                if existing_size == size {
                    info!("Volume {} already exists", volume_id);
                    return Ok(volume(size));
                }
                return Err(Error::AlreadyExists(format!(
                    "volume {} exists with size {}, requested {}",
                    volume_id, existing_size, size
                )));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Some(snapshot) = source.snapshot {
            let sid = SnapshotId::parse(&snapshot.snapshot_id).ok_or_else(|| {
                Error::NotFound(format!(
                    "source snapshot {} is malformed",
                    snapshot.snapshot_id
                ))
            })?;
            self.get_snapshot(&snapshot.snapshot_id).await?;

            CloneWorkflow::new(self.backend.as_ref())
                .run(&sid, &volume_id)
                .await
                .into_result()?;

            let restored_size = self.volume_size(&volume_id).await?;
            info!(
                "Created volume {} from snapshot {} ({} bytes)",
                volume_id, sid, restored_size
            );
            return Ok(volume(restored_size));
        }

        match self.backend.create_volume(&volume_id, size).await {
            Ok(()) => info!("Created volume {} ({} bytes)", volume_id, size),
            Err(e) if e.is(RestErrorKind::ObjectExists) => {
                debug!("Volume {} created concurrently", volume_id)
            }
            Err(e) if e.is(RestErrorKind::ResourceBusy) => {
                return Err(Error::FailedPrecondition(format!(
                    "create volume {}: {}",
                    volume_id, e
                )))
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "create volume {}: {}",
                    volume_id, e
                )))
            }
        }

        Ok(volume(size))
    }

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<DeleteVolumeResponse> {
        self.require_capability(ControllerCapability::CreateDeleteVolume)?;

        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is missing".into()));
        }

        match self.backend.delete_volume(&req.volume_id).await {
            Ok(()) => info!("Deleted volume {}", req.volume_id),
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                debug!("Volume {} already gone", req.volume_id)
            }
            Err(e) if e.is(RestErrorKind::ResourceBusy) => {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is in use: {}",
                    req.volume_id, e
                )))
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "delete volume {}: {}",
                    req.volume_id, e
                )))
            }
        }

        Ok(DeleteVolumeResponse {})
    }

    /// List volumes a page at a time
    ///
    /// A decimal starting token is an offset, reset to 0 past the end. Any
    /// other token must name an existing volume, whose position is the offset.
    #[tracing::instrument(skip(self, req))]
    pub async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse> {
        self.require_capability(ControllerCapability::ListVolumes)?;

        if req.max_entries < 0 {
            return Err(Error::InvalidArgument(format!(
                "max entries {} is negative",
                req.max_entries
            )));
        }

        let names: Vec<String> = self
            .backend
            .list_volumes()
            .await
            .map_err(|e| Error::from_backend("list volumes", &e))?
            .into_iter()
            .filter(|name| name != self.registry.volume())
            .collect();

        let offset = match parse_offset(&req.starting_token) {
            Some(offset) if offset < names.len() => offset,
            Some(_) => 0,
            None => names
                .iter()
                .position(|name| *name == req.starting_token)
                .ok_or_else(|| {
                    Error::Aborted(format!(
                        "starting token {} does not match any volume",
                        req.starting_token
                    ))
                })?,
        };

        let page = paginate(names, offset, req.max_entries as usize);
        Ok(ListVolumesResponse {
            entries: page
                .entries
                .into_iter()
                .map(|volume_id| ListVolumesEntry {
                    volume: Volume {
                        volume_id,
                        ..Default::default()
                    },
                })
                .collect(),
            next_token: page.next_token,
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    #[tracing::instrument(skip(self, req), fields(name = %req.name, volume_id = %req.source_volume_id))]
    pub async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse> {
        self.require_capability(ControllerCapability::CreateDeleteSnapshot)?;

        if req.name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name is missing".into()));
        }
        if req.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument("source volume id is missing".into()));
        }

        let volume_id = req.source_volume_id.as_str();
        let hash = derive_id(&self.config.salt, &req.name);
        let sid = SnapshotId::compose(volume_id, &hash);
        let snapshot_id = sid.to_string();

        if self.registry.record_exists(&hash).await {
            return match self.backend.get_snapshot(volume_id, &snapshot_id).await {
                Ok(existing) => {
                    info!("Snapshot {} already exists", snapshot_id);
                    let size = self.volume_size(volume_id).await?;
                    self.snapshot_response(&sid, &existing.creation, size)
                }
                Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                    Err(Error::AlreadyExists(format!(
                        "snapshot name {} was already used: {}",
                        req.name, e
                    )))
                }
                Err(e) => Err(Error::from_backend(
                    &format!("get snapshot {}", snapshot_id),
                    &e,
                )),
            };
        }

        let size = self.volume_size(volume_id).await?;

        match self.backend.create_snapshot(volume_id, &snapshot_id).await {
            Ok(()) => info!("Created snapshot {}", snapshot_id),
            Err(e) if e.is(RestErrorKind::ObjectExists) => {
                debug!("Snapshot {} created concurrently", snapshot_id)
            }
            Err(e) => {
                return Err(Error::from_backend(
                    &format!("create snapshot {}", snapshot_id),
                    &e,
                ))
            }
        }

        self.registry.put_record(&hash).await?;

        let created = self
            .backend
            .get_snapshot(volume_id, &snapshot_id)
            .await
            .map_err(|e| Error::Internal(format!("read back snapshot {}: {}", snapshot_id, e)))?;

        self.snapshot_response(&sid, &created.creation, size)
    }

    fn snapshot_response(
        &self,
        sid: &SnapshotId,
        creation: &str,
        size: i64,
    ) -> Result<CreateSnapshotResponse> {
        let creation_time = parse_timestamp(creation).map_err(|e| {
            Error::Internal(format!("snapshot {} creation time: {}", sid, e))
        })?;

        Ok(CreateSnapshotResponse {
            snapshot: Snapshot {
                snapshot_id: sid.to_string(),
                source_volume_id: sid.volume_id().to_string(),
                creation_time,
                ready_to_use: true,
                size_bytes: size,
            },
        })
    }

    #[tracing::instrument(skip(self, req), fields(snapshot_id = %req.snapshot_id))]
    pub async fn delete_snapshot(
        &self,
        req: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse> {
        self.require_capability(ControllerCapability::CreateDeleteSnapshot)?;

        if req.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument("snapshot id is missing".into()));
        }
        let Some(sid) = SnapshotId::parse(&req.snapshot_id) else {
            warn!("Snapshot id {} is malformed, nothing to delete", req.snapshot_id);
            return Ok(DeleteSnapshotResponse {});
        };

        match self.registry.delete_record(sid.hash()).await {
            Ok(()) => {}
            Err(e @ (Error::FailedPrecondition(_) | Error::AlreadyExists(_))) => {
                warn!("Keeping registry record of {}: {}", sid, e)
            }
            Err(e) => return Err(e),
        }

        let snapshot_id = sid.to_string();
        match self
            .backend
            .delete_snapshot(sid.volume_id(), &snapshot_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                debug!("Snapshot {} already gone", snapshot_id);
                return Ok(DeleteSnapshotResponse {});
            }
            Err(e) => {
                return Err(Error::from_backend(
                    &format!("delete snapshot {}", snapshot_id),
                    &e,
                ))
            }
        }

        match self
            .backend
            .get_snapshot(sid.volume_id(), &snapshot_id)
            .await
        {
            Err(e) if e.is(RestErrorKind::ResourceDoesNotExist) => {
                info!("Deleted snapshot {}", snapshot_id);
                Ok(DeleteSnapshotResponse {})
            }
            Ok(_) => Err(Error::Internal(format!(
                "unable to delete snapshot {}",
                snapshot_id
            ))),
            Err(e) => Err(Error::Internal(format!(
                "unable to confirm deletion of snapshot {}: {}",
                snapshot_id, e
            ))),
        }
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<ListSnapshotsResponse> {
        self.require_capability(ControllerCapability::ListSnapshots)?;

        if req.max_entries < 0 {
            return Err(Error::InvalidArgument(format!(
                "max entries {} is negative",
                req.max_entries
            )));
        }
        let offset = parse_offset(&req.starting_token).ok_or_else(|| {
            Error::Aborted(format!("starting token {} is invalid", req.starting_token))
        })?;

        if !req.snapshot_id.is_empty() {
            return self.list_single_snapshot(&req).await;
        }

        let filter = |name: &str| is_well_formed_snapshot_name(name);
        let listing = if req.source_volume_id.is_empty() {
            self.backend.list_all_snapshots(&filter).await
        } else {
            self.backend
                .list_volume_snapshots(&req.source_volume_id, &filter)
                .await
        };

        let entries = match listing {
            Ok(entries) => entries,
            Err(e) if !req.source_volume_id.is_empty() && e.is(RestErrorKind::ResourceDoesNotExist) => {
                debug!("Volume {} does not exist, no snapshots", req.source_volume_id);
                Vec::new()
            }
            Err(e) => return Err(Error::from_backend("list snapshots", &e)),
        };

        let converted = self.convert_listing(entries).await;
        let page = paginate(converted, offset, req.max_entries as usize);

        Ok(ListSnapshotsResponse {
            entries: page
                .entries
                .into_iter()
                .map(|snapshot| ListSnapshotsEntry { snapshot })
                .collect(),
            next_token: page.next_token,
        })
    }

    async fn list_single_snapshot(&self, req: &ListSnapshotsRequest) -> Result<ListSnapshotsResponse> {
        let Some(sid) = SnapshotId::parse(&req.snapshot_id) else {
            return Ok(ListSnapshotsResponse::default());
        };
        if !req.source_volume_id.is_empty() && req.source_volume_id != sid.volume_id() {
            return Ok(ListSnapshotsResponse::default());
        }

        let snap = match self.get_snapshot(&req.snapshot_id).await {
            Ok(snap) => snap,
            Err(Error::NotFound(_)) => return Ok(ListSnapshotsResponse::default()),
            Err(e) => return Err(e),
        };
        let size = self.volume_size(sid.volume_id()).await.unwrap_or_default();
        let rsp = self.snapshot_response(&sid, &snap.creation, size)?;

        Ok(ListSnapshotsResponse {
            entries: vec![ListSnapshotsEntry {
                snapshot: rsp.snapshot,
            }],
            next_token: String::new(),
        })
    }

    /// Turn listing entries into snapshots, skipping unparseable ones
    ///
    /// Both listings carry Unix seconds: the pool-wide one natively, the
    /// per-volume one after conversion in the adapter.
    async fn convert_listing(&self, entries: Vec<SnapshotShort>) -> Vec<Snapshot> {
        let mut sizes: BTreeMap<String, i64> = BTreeMap::new();
        let mut out = Vec::with_capacity(entries.len());

        for entry in entries {
            let Ok(creation_time) = entry.properties.creation.parse::<i64>() else {
                debug!("Skipping snapshot {} with unreadable creation time", entry.name);
                continue;
            };
            let Some(sid) = SnapshotId::parse(&entry.name) else {
                continue;
            };

            let size = match sizes.get(sid.volume_id()) {
                Some(size) => *size,
                None => {
                    let size = self.volume_size(sid.volume_id()).await.unwrap_or_default();
                    sizes.insert(sid.volume_id().to_string(), size);
                    size
                }
            };

            out.push(Snapshot {
                snapshot_id: entry.name.clone(),
                source_volume_id: sid.volume_id().to_string(),
                creation_time,
                ready_to_use: true,
                size_bytes: size,
            });
        }

        out
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    #[tracing::instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is missing".into()));
        }
        self.get_volume(&req.volume_id).await?;

        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities are missing".into(),
            ));
        }

        if let Some(cap) = req
            .volume_capabilities
            .iter()
            .find(|cap| !cap.access_mode.is_supported())
        {
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!("access mode {:?} is not supported", cap.access_mode),
            });
        }

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(ConfirmedCapabilities {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        })
    }

    pub fn get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: CONTROLLER_CAPABILITIES.to_vec(),
        }
    }

    pub async fn get_capacity(&self) -> Result<()> {
        Err(Error::Unimplemented("GetCapacity is not supported".into()))
    }

    pub async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        debug!("Ignoring expansion request for {}", req.volume_id);
        Ok(ControllerExpandVolumeResponse::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::StorageEndpointConfig;
    use crate::error::StatusCode;
    use crate::backends::JovianStorage;
    use crate::testing::{s, Call, FakeBackend, ScriptedTransport};
    use assert_matches::assert_matches;

    pub(crate) const GIB: i64 = 1 << 30;

    pub(crate) fn config() -> ControllerConfig {
        ControllerConfig {
            salt: s("salt"),
            iqn: s("iqn.csi.2019-04"),
            node_prefix: s("csi-"),
            storage_endpoints: vec![StorageEndpointConfig {
                name: s("jdss-0"),
                addr: s("127.0.0.1"),
                user: s("admin"),
                pass: s("admin"),
                pool: s("Pool-0"),
                ..Default::default()
            }],
            iscsi_portal: None,
            iscsi_port: None,
        }
    }

    pub(crate) async fn service() -> (Arc<FakeBackend>, ControllerService) {
        let backend = Arc::new(FakeBackend::new());
        let svc = ControllerService::new(config(), backend.clone());
        svc.initialize().await.unwrap();
        backend.clear_calls();
        (backend, svc)
    }

    pub(crate) fn create_request(name: &str, required: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: s(name),
            capacity_range: Some(CapacityRange {
                required_bytes: required,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4")],
            ..Default::default()
        }
    }

    fn snapshot_request(volume_id: &str, name: &str) -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            source_volume_id: s(volume_id),
            name: s(name),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_size() {
        let range = |required, limit| CapacityRange {
            required_bytes: required,
            limit_bytes: limit,
        };
        assert_eq!(resolve_size(Some(&range(GIB, 0))), GIB);
        assert_eq!(resolve_size(Some(&range(1024, 2 * GIB))), 2 * GIB);
        assert_eq!(resolve_size(Some(&range(1024, 2048))), MIN_VOLUME_SIZE);
        assert_eq!(resolve_size(None), MIN_VOLUME_SIZE);
    }

    #[tokio::test]
    async fn test_initialize_creates_registry() {
        let (backend, _svc) = service().await;
        assert!(backend.has_volume("csi-SnapshotRegister"));
    }

    #[tokio::test]
    async fn test_create_volume_idempotent() {
        let (backend, svc) = service().await;

        let first = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let second = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();

        assert_eq!(first.volume.volume_id, derive_id("salt", "pvc-1"));
        assert_eq!(first, second);
        assert_eq!(first.volume.capacity_bytes, GIB);
        assert!(backend.has_volume(&first.volume.volume_id));
    }

    #[tokio::test]
    async fn test_create_volume_size_conflict() {
        let (_backend, svc) = service().await;

        svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let err = svc
            .create_volume(create_request("pvc-1", 2 * GIB))
            .await
            .unwrap_err();

        assert_eq!(err.code(), StatusCode::AlreadyExists);
        assert!(err.to_string().contains(&GIB.to_string()));
    }

    #[tokio::test]
    async fn test_create_volume_validation() {
        let (_backend, svc) = service().await;

        let mut req = create_request("", GIB);
        assert_matches!(svc.create_volume(req.clone()).await, Err(Error::InvalidArgument(_)));

        req.name = s("pvc-1");
        req.volume_capabilities.clear();
        assert_matches!(svc.create_volume(req).await, Err(Error::InvalidArgument(_)));

        let mut req = create_request("pvc-1", GIB);
        req.volume_content_source = Some(VolumeContentSource {
            snapshot: None,
            volume: Some(VolumeSource {
                volume_id: s("other"),
            }),
        });
        assert_matches!(svc.create_volume(req).await, Err(Error::Unimplemented(_)));
    }

    #[tokio::test]
    async fn test_create_volume_backend_failures() {
        let (backend, svc) = service().await;
        let id = derive_id("salt", "pvc-1");

        backend.fail_on(Call::CreateVolume(id.clone()), RestErrorKind::ResourceBusy);
        assert_matches!(
            svc.create_volume(create_request("pvc-1", GIB)).await,
            Err(Error::FailedPrecondition(_))
        );

        backend.clear_failures();
        backend.fail_on(Call::CreateVolume(id.clone()), RestErrorKind::ObjectExists);
        let rsp = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        assert_eq!(rsp.volume.volume_id, id);

        backend.clear_failures();
        backend.fail_on(Call::GetVolume(id.clone()), RestErrorKind::ResponseProcessingMalfunction);
        assert_matches!(
            svc.create_volume(create_request("pvc-1", GIB)).await,
            Err(Error::Internal(_))
        );
    }

    #[tokio::test]
    async fn test_create_volume_from_snapshot() {
        let (backend, svc) = service().await;
        let src = svc.create_volume(create_request("pvc-src", GIB)).await.unwrap();
        let snap = svc
            .create_snapshot(snapshot_request(&src.volume.volume_id, "snap-1"))
            .await
            .unwrap();

        let mut req = create_request("pvc-dst", MIN_VOLUME_SIZE);
        req.volume_content_source =
            Some(VolumeContentSource::from_snapshot(&snap.snapshot.snapshot_id));
        let rsp = svc.create_volume(req.clone()).await.unwrap();

        // The clone keeps the size of its origin
        assert_eq!(rsp.volume.capacity_bytes, GIB);
        assert_eq!(rsp.volume.volume_id, derive_id("salt", "pvc-dst"));
        assert!(backend.has_volume(&rsp.volume.volume_id));
        assert!(backend
            .volume_names()
            .iter()
            .all(|name| !name.ends_with("tmpVol1")));

        // Retrying finds the restored volume
        let again = svc.create_volume(req).await.unwrap();
        assert_eq!(again.volume.capacity_bytes, GIB);
    }

    #[tokio::test]
    async fn test_create_volume_from_missing_snapshot() {
        let (_backend, svc) = service().await;
        let src = svc.create_volume(create_request("pvc-src", GIB)).await.unwrap();

        let mut req = create_request("pvc-dst", GIB);
        req.volume_content_source = Some(VolumeContentSource::from_snapshot(format!(
            "{}_{}",
            src.volume.volume_id,
            derive_id("salt", "never-taken")
        )));
        assert_matches!(svc.create_volume(req.clone()).await, Err(Error::NotFound(_)));

        req.volume_content_source = Some(VolumeContentSource::from_snapshot("a_b_c"));
        assert_matches!(svc.create_volume(req).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_volume() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let req = DeleteVolumeRequest {
            volume_id: vol.volume.volume_id.clone(),
        };

        svc.delete_volume(req.clone()).await.unwrap();
        assert!(!backend.has_volume(&vol.volume.volume_id));

        // Deleting again is not an error
        svc.delete_volume(req).await.unwrap();

        assert_matches!(
            svc.delete_volume(DeleteVolumeRequest::default()).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_delete_volume_with_snapshot_is_busy() {
        let (_backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        svc.create_snapshot(snapshot_request(&vol.volume.volume_id, "snap-1"))
            .await
            .unwrap();

        let err = svc
            .delete_volume(DeleteVolumeRequest {
                volume_id: vol.volume.volume_id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_list_volumes_pages() {
        let (_backend, svc) = service().await;
        for i in 0..5 {
            svc.create_volume(create_request(&format!("pvc-{}", i), GIB))
                .await
                .unwrap();
        }

        let mut req = ListVolumesRequest {
            max_entries: 2,
            starting_token: String::new(),
        };
        let first = svc.list_volumes(req.clone()).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_token, "2");

        req.starting_token = first.next_token;
        let second = svc.list_volumes(req.clone()).await.unwrap();
        assert_eq!(second.entries.len(), 2);
        assert!(!second.next_token.is_empty());

        req.starting_token = second.next_token;
        let third = svc.list_volumes(req).await.unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.next_token.is_empty());

        let ids: Vec<_> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .chain(third.entries.iter())
            .map(|e| e.volume.volume_id.clone())
            .collect();
        assert!(!ids.contains(&s("csi-SnapshotRegister")));
    }

    #[tokio::test]
    async fn test_list_volumes_tokens() {
        let (_backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        svc.create_volume(create_request("pvc-2", GIB)).await.unwrap();

        let all = svc.list_volumes(ListVolumesRequest::default()).await.unwrap();
        assert_eq!(all.entries.len(), 2);
        assert!(all.next_token.is_empty());

        assert_matches!(
            svc.list_volumes(ListVolumesRequest {
                max_entries: -1,
                starting_token: String::new()
            })
            .await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            svc.list_volumes(ListVolumesRequest {
                max_entries: 1,
                starting_token: s("unknown-volume")
            })
            .await,
            Err(Error::Aborted(_))
        );

        let from_id = svc
            .list_volumes(ListVolumesRequest {
                max_entries: 0,
                starting_token: vol.volume.volume_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(from_id.entries[0].volume.volume_id, vol.volume.volume_id);

        let past_end = svc
            .list_volumes(ListVolumesRequest {
                max_entries: 0,
                starting_token: s("99"),
            })
            .await
            .unwrap();
        assert_eq!(past_end.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_create_snapshot() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let volume_id = vol.volume.volume_id;

        let rsp = svc
            .create_snapshot(snapshot_request(&volume_id, "snap-1"))
            .await
            .unwrap();

        let hash = derive_id("salt", "snap-1");
        assert_eq!(rsp.snapshot.snapshot_id, format!("{}_{}", volume_id, hash));
        assert_eq!(rsp.snapshot.source_volume_id, volume_id);
        assert_eq!(rsp.snapshot.size_bytes, GIB);
        assert_eq!(rsp.snapshot.creation_time, 1_678_179_901);
        assert!(rsp.snapshot.ready_to_use);
        assert!(backend.has_snapshot("csi-SnapshotRegister", &hash));

        // A retry returns the same snapshot
        let again = svc
            .create_snapshot(snapshot_request(&volume_id, "snap-1"))
            .await
            .unwrap();
        assert_eq!(again, rsp);
    }

    #[tokio::test]
    async fn test_create_snapshot_name_reused_elsewhere() {
        let (_backend, svc) = service().await;
        let a = svc.create_volume(create_request("pvc-a", GIB)).await.unwrap();
        let b = svc.create_volume(create_request("pvc-b", GIB)).await.unwrap();

        svc.create_snapshot(snapshot_request(&a.volume.volume_id, "snap-1"))
            .await
            .unwrap();
        assert_matches!(
            svc.create_snapshot(snapshot_request(&b.volume.volume_id, "snap-1"))
                .await,
            Err(Error::AlreadyExists(_))
        );
    }

    #[tokio::test]
    async fn test_create_snapshot_retry_with_unreachable_lookup() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let volume_id = vol.volume.volume_id;
        let rsp = svc
            .create_snapshot(snapshot_request(&volume_id, "snap-1"))
            .await
            .unwrap();

        backend.fail_on(
            Call::GetSnapshot(volume_id.clone(), rsp.snapshot.snapshot_id.clone()),
            RestErrorKind::UnableToConnect,
        );
        assert_matches!(
            svc.create_snapshot(snapshot_request(&volume_id, "snap-1")).await,
            Err(Error::Internal(_))
        );

        backend.clear_failures();
        let again = svc
            .create_snapshot(snapshot_request(&volume_id, "snap-1"))
            .await
            .unwrap();
        assert_eq!(again, rsp);
    }

    #[tokio::test]
    async fn test_list_snapshots_pool_wide_unix_times() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            200,
            &serde_json::json!({"data": {"results": 2, "entries": [
                {"volume": "v1", "name": "v1_abc", "properties": {"creation": "1678179901"}},
                {"volume": "v1", "name": "v1_bad", "properties": {"creation": "2023-3-7 9:5:1"}}
            ]}})
            .to_string(),
        );
        let backend = Arc::new(JovianStorage::new(transport, "Pool-0", "127.0.0.1", 82));
        let svc = ControllerService::new(config(), backend);

        let rsp = svc.list_snapshots(ListSnapshotsRequest::default()).await.unwrap();
        assert_eq!(rsp.entries.len(), 1);
        assert_eq!(rsp.entries[0].snapshot.snapshot_id, "v1_abc");
        assert_eq!(rsp.entries[0].snapshot.source_volume_id, "v1");
        assert_eq!(rsp.entries[0].snapshot.creation_time, 1_678_179_901);
    }

    #[tokio::test]
    async fn test_create_snapshot_validation() {
        let (_backend, svc) = service().await;

        assert_matches!(
            svc.create_snapshot(snapshot_request("vol", "")).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            svc.create_snapshot(snapshot_request("", "snap")).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            svc.create_snapshot(snapshot_request("missing-volume", "snap")).await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let snap = svc
            .create_snapshot(snapshot_request(&vol.volume.volume_id, "snap-1"))
            .await
            .unwrap();
        let req = DeleteSnapshotRequest {
            snapshot_id: snap.snapshot.snapshot_id.clone(),
        };

        svc.delete_snapshot(req.clone()).await.unwrap();
        assert!(!backend.has_snapshot(&vol.volume.volume_id, &snap.snapshot.snapshot_id));
        assert!(!backend.has_snapshot("csi-SnapshotRegister", &derive_id("salt", "snap-1")));

        svc.delete_snapshot(req).await.unwrap();
        svc.delete_snapshot(DeleteSnapshotRequest {
            snapshot_id: s("malformed"),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_snapshot_with_clone_is_busy() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let snap = svc
            .create_snapshot(snapshot_request(&vol.volume.volume_id, "snap-1"))
            .await
            .unwrap();
        backend.fail_on(
            Call::DeleteSnapshot(vol.volume.volume_id.clone(), snap.snapshot.snapshot_id.clone()),
            RestErrorKind::ResourceBusy,
        );

        assert_matches!(
            svc.delete_snapshot(DeleteSnapshotRequest {
                snapshot_id: snap.snapshot.snapshot_id
            })
            .await,
            Err(Error::FailedPrecondition(_))
        );
    }

    #[tokio::test]
    async fn test_delete_snapshot_unconfirmed() {
        let (backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        let snap = svc
            .create_snapshot(snapshot_request(&vol.volume.volume_id, "snap-1"))
            .await
            .unwrap();
        backend.fail_on(
            Call::GetSnapshot(vol.volume.volume_id.clone(), snap.snapshot.snapshot_id.clone()),
            RestErrorKind::UnableToConnect,
        );

        assert_matches!(
            svc.delete_snapshot(DeleteSnapshotRequest {
                snapshot_id: snap.snapshot.snapshot_id
            })
            .await,
            Err(Error::Internal(_))
        );
    }

    #[tokio::test]
    async fn test_list_snapshots_modes() {
        let (backend, svc) = service().await;
        let a = svc.create_volume(create_request("pvc-a", GIB)).await.unwrap();
        let b = svc.create_volume(create_request("pvc-b", 2 * GIB)).await.unwrap();
        let sa = svc
            .create_snapshot(snapshot_request(&a.volume.volume_id, "snap-a"))
            .await
            .unwrap();
        svc.create_snapshot(snapshot_request(&b.volume.volume_id, "snap-b1"))
            .await
            .unwrap();
        svc.create_snapshot(snapshot_request(&b.volume.volume_id, "snap-b2"))
            .await
            .unwrap();
        // Foreign snapshot without the composite shape
        backend.add_snapshot(&a.volume.volume_id, "manual");

        let all = svc.list_snapshots(ListSnapshotsRequest::default()).await.unwrap();
        assert_eq!(all.entries.len(), 3);

        let of_b = svc
            .list_snapshots(ListSnapshotsRequest {
                source_volume_id: b.volume.volume_id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(of_b.entries.len(), 2);
        assert!(of_b.entries.iter().all(|e| e.snapshot.size_bytes == 2 * GIB));

        let single = svc
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: sa.snapshot.snapshot_id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(single.entries.len(), 1);
        assert_eq!(single.entries[0].snapshot, sa.snapshot);

        let missing = svc
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: format!("{}_{}", a.volume.volume_id, derive_id("salt", "nope")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(missing.entries.is_empty());

        let no_volume = svc
            .list_snapshots(ListSnapshotsRequest {
                source_volume_id: s("missing"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(no_volume.entries.is_empty());
    }

    #[tokio::test]
    async fn test_list_snapshots_paging() {
        let (_backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();
        for i in 0..3 {
            svc.create_snapshot(snapshot_request(&vol.volume.volume_id, &format!("snap-{}", i)))
                .await
                .unwrap();
        }

        let first = svc
            .list_snapshots(ListSnapshotsRequest {
                max_entries: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_token, "2");

        let rest = svc
            .list_snapshots(ListSnapshotsRequest {
                max_entries: 2,
                starting_token: first.next_token,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(rest.next_token.is_empty());

        let beyond = svc
            .list_snapshots(ListSnapshotsRequest {
                starting_token: s("10"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(beyond.entries.is_empty());

        assert_matches!(
            svc.list_snapshots(ListSnapshotsRequest {
                starting_token: s("bogus"),
                ..Default::default()
            })
            .await,
            Err(Error::Aborted(_))
        );
    }

    #[tokio::test]
    async fn test_validate_volume_capabilities() {
        let (_backend, svc) = service().await;
        let vol = svc.create_volume(create_request("pvc-1", GIB)).await.unwrap();

        let mut req = ValidateVolumeCapabilitiesRequest {
            volume_id: vol.volume.volume_id.clone(),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4")],
            ..Default::default()
        };
        let ok = svc.validate_volume_capabilities(req.clone()).await.unwrap();
        assert!(ok.confirmed.is_some());

        req.volume_capabilities = vec![VolumeCapability::mount(AccessMode::MultiNodeMultiWriter, "ext4")];
        let rejected = svc.validate_volume_capabilities(req.clone()).await.unwrap();
        assert!(rejected.confirmed.is_none());
        assert!(!rejected.message.is_empty());

        req.volume_capabilities.clear();
        assert_matches!(
            svc.validate_volume_capabilities(req.clone()).await,
            Err(Error::InvalidArgument(_))
        );

        req.volume_id = s("missing");
        assert_matches!(
            svc.validate_volume_capabilities(req).await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_capabilities_and_stubs() {
        let (_backend, svc) = service().await;

        let caps = svc.get_capabilities().capabilities;
        assert!(caps.contains(&ControllerCapability::PublishUnpublishVolume));
        assert!(caps.contains(&ControllerCapability::ListSnapshots));
        assert!(!caps.contains(&ControllerCapability::GetCapacity));

        assert_matches!(svc.get_capacity().await, Err(Error::Unimplemented(_)));
        assert!(svc
            .expand_volume(ControllerExpandVolumeRequest::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_get_volume_classification() {
        let (backend, svc) = service().await;
        backend.fail_on(Call::GetVolume(s("v1")), RestErrorKind::RequestMalfunction);
        backend.fail_on(Call::GetVolume(s("v2")), RestErrorKind::ResponseProcessingMalfunction);

        assert_matches!(svc.get_volume("v1").await, Err(Error::NotFound(_)));
        assert_matches!(svc.get_volume("v2").await, Err(Error::Internal(_)));
        assert_matches!(svc.get_volume("v3").await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_snapshot_validation() {
        let (_backend, svc) = service().await;
        assert_matches!(svc.get_snapshot("").await, Err(Error::InvalidArgument(_)));
        assert_matches!(svc.get_snapshot("no-separator").await, Err(Error::NotFound(_)));
    }
}
