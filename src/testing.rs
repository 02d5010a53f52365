//! Test doubles for the storage and transport ports

use crate::backends::error::{RestError, RestErrorKind, RestResult};
use crate::backends::payload::{
    parse_timestamp, Pool, Snapshot, SnapshotProperties, SnapshotShort, Volume,
};
use crate::domain::ports::{
    LunMode, NameFilter, RawResponse, RestTransport, StorageBackend, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use std::collections::{BTreeMap, VecDeque};

/// Creation time reported for every fake snapshot
pub const FAKE_CREATION: &str = "2023-3-7 9:5:1";

// =============================================================================
// Scripted Transport
// =============================================================================

/// Replays queued replies and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    requests: Mutex<Vec<(Method, String, Option<serde_json::Value>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, status: u16, body: &str) {
        self.replies
            .lock()
            .push_back(Ok(RawResponse::new(status, body.as_bytes().to_vec())));
    }

    pub fn push_error(&self, err: TransportError) {
        self.replies.lock().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<(Method, String, Option<serde_json::Value>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RestTransport for ScriptedTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RawResponse, TransportError> {
        self.requests.lock().push((method, path.to_string(), body));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Request("no scripted reply".into())))
    }
}

// =============================================================================
// Fake Backend
// =============================================================================

/// A backend call, as recorded by [`FakeBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetPools,
    CreateVolume(String),
    GetVolume(String),
    DeleteVolume(String),
    ListVolumes,
    CreateSnapshot(String, String),
    GetSnapshot(String, String),
    DeleteSnapshot(String, String),
    ListAllSnapshots,
    ListVolumeSnapshots(String),
    CreateClone(String, String, String),
    DeleteClone(String, String, String),
    PromoteClone(String, String, String),
    CreateTarget(String),
    DeleteTarget(String),
    AttachToTarget(String, String),
    DetachFromTarget(String, String),
    AddUserToTarget(String, String),
}

pub fn s(v: &str) -> String {
    v.to_string()
}

#[derive(Debug, Clone)]
struct FakeVolume {
    size: i64,
    /// `(volume, snapshot)` this volume was cloned from
    origin: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<String, FakeVolume>,
    snapshots: BTreeMap<(String, String), String>,
    targets: BTreeMap<String, Vec<String>>,
    luns: BTreeMap<String, (String, LunMode)>,
    calls: Vec<Call>,
    failures: Vec<(Call, RestErrorKind)>,
}

impl State {
    fn has_dependents(&self, volume: &str, snapshot: &str) -> bool {
        self.volumes
            .values()
            .any(|v| v.origin.as_ref() == Some(&(volume.to_string(), snapshot.to_string())))
    }
}

/// In-memory appliance with a call log and failure injection
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `call` fail with `kind`
    pub fn fail_on(&self, call: Call, kind: RestErrorKind) {
        self.state.lock().failures.push((call, kind));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn add_volume(&self, name: &str, size: i64) {
        self.state.lock().volumes.insert(
            name.to_string(),
            FakeVolume { size, origin: None },
        );
    }

    pub fn add_snapshot(&self, volume: &str, snapshot: &str) {
        self.state
            .lock()
            .snapshots
            .insert((volume.to_string(), snapshot.to_string()), FAKE_CREATION.to_string());
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn has_snapshot(&self, volume: &str, snapshot: &str) -> bool {
        self.state
            .lock()
            .snapshots
            .contains_key(&(volume.to_string(), snapshot.to_string()))
    }

    pub fn volume_origin(&self, name: &str) -> Option<(String, String)> {
        self.state.lock().volumes.get(name).and_then(|v| v.origin.clone())
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.state.lock().targets.contains_key(target)
    }

    pub fn target_users(&self, target: &str) -> Vec<String> {
        self.state
            .lock()
            .targets
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn lun(&self, target: &str) -> Option<(String, LunMode)> {
        self.state.lock().luns.get(target).cloned()
    }

    /// Log `call` and return the injected failure, if any
    fn record(&self, state: &mut State, call: Call) -> RestResult<()> {
        state.calls.push(call.clone());
        match state.failures.iter().find(|(c, _)| *c == call) {
            Some((_, kind)) => Err(RestError::new(*kind, format!("injected failure of {:?}", call))),
            None => Ok(()),
        }
    }
}

fn dne(what: String) -> RestError {
    RestError::new(RestErrorKind::ResourceDoesNotExist, what)
}

fn exists(what: String) -> RestError {
    RestError::new(RestErrorKind::ObjectExists, what)
}

fn busy(what: String) -> RestError {
    RestError::new(RestErrorKind::ResourceBusy, what)
}

#[async_trait]
impl StorageBackend for FakeBackend {
    fn address(&self) -> (String, u16) {
        (s("127.0.0.1"), 82)
    }

    async fn get_pools(&self) -> RestResult<Vec<Pool>> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::GetPools)?;
        Ok(vec![Pool {
            name: s("Pool-0"),
            health: s("ONLINE"),
            ..Default::default()
        }])
    }

    async fn create_volume(&self, name: &str, size: i64) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::CreateVolume(s(name)))?;
        if st.volumes.contains_key(name) {
            return Err(exists(format!("volume {}", name)));
        }
        st.volumes.insert(s(name), FakeVolume { size, origin: None });
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> RestResult<Volume> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::GetVolume(s(name)))?;
        let vol = st
            .volumes
            .get(name)
            .ok_or_else(|| dne(format!("volume {}", name)))?;
        Ok(Volume {
            name: s(name),
            full_name: format!("Pool-0/{}", name),
            volsize: vol.size.to_string(),
            origin: vol
                .origin
                .as_ref()
                .map(|(v, sn)| format!("Pool-0/{}@{}", v, sn))
                .unwrap_or_default(),
            is_clone: vol.origin.is_some(),
            ..Default::default()
        })
    }

    async fn delete_volume(&self, name: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::DeleteVolume(s(name)))?;
        if !st.volumes.contains_key(name) {
            return Err(dne(format!("volume {}", name)));
        }
        if st.snapshots.keys().any(|(v, _)| v == name) {
            return Err(busy(format!("volume {} has snapshots", name)));
        }
        st.volumes.remove(name);
        Ok(())
    }

    async fn list_volumes(&self) -> RestResult<Vec<String>> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::ListVolumes)?;
        Ok(st.volumes.keys().cloned().collect())
    }

    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::CreateSnapshot(s(volume), s(snapshot)))?;
        if !st.volumes.contains_key(volume) {
            return Err(dne(format!("volume {}", volume)));
        }
        let key = (s(volume), s(snapshot));
        if st.snapshots.contains_key(&key) {
            return Err(exists(format!("snapshot {}@{}", volume, snapshot)));
        }
        st.snapshots.insert(key, s(FAKE_CREATION));
        Ok(())
    }

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<Snapshot> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::GetSnapshot(s(volume), s(snapshot)))?;
        let creation = st
            .snapshots
            .get(&(s(volume), s(snapshot)))
            .ok_or_else(|| dne(format!("snapshot {}@{}", volume, snapshot)))?;
        Ok(Snapshot {
            name: s(snapshot),
            creation: creation.clone(),
            ..Default::default()
        })
    }

    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::DeleteSnapshot(s(volume), s(snapshot)))?;
        let key = (s(volume), s(snapshot));
        if !st.snapshots.contains_key(&key) {
            return Err(dne(format!("snapshot {}@{}", volume, snapshot)));
        }
        if st.has_dependents(volume, snapshot) {
            return Err(busy(format!("snapshot {}@{} has clones", volume, snapshot)));
        }
        st.snapshots.remove(&key);
        Ok(())
    }

    async fn list_all_snapshots(&self, filter: NameFilter<'_>) -> RestResult<Vec<SnapshotShort>> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::ListAllSnapshots)?;
        Ok(st
            .snapshots
            .iter()
            .filter(|((_, name), _)| filter(name.as_str()))
            .filter_map(|((volume, name), creation)| {
                let ts = parse_timestamp(creation).ok()?;
                Some(SnapshotShort {
                    volume: volume.clone(),
                    name: name.clone(),
                    properties: SnapshotProperties {
                        creation: ts.to_string(),
                    },
                })
            })
            .collect())
    }

    async fn list_volume_snapshots(
        &self,
        volume: &str,
        filter: NameFilter<'_>,
    ) -> RestResult<Vec<SnapshotShort>> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::ListVolumeSnapshots(s(volume)))?;
        if !st.volumes.contains_key(volume) {
            return Err(dne(format!("volume {}", volume)));
        }
        let mut out = Vec::new();
        for ((v, name), creation) in st.snapshots.iter() {
            if v != volume || !filter(name.as_str()) {
                continue;
            }
            let Ok(ts) = parse_timestamp(creation) else {
                continue;
            };
            out.push(SnapshotShort {
                volume: v.clone(),
                name: name.clone(),
                properties: SnapshotProperties {
                    creation: ts.to_string(),
                },
            });
        }
        Ok(out)
    }

    async fn create_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::CreateClone(s(volume), s(snapshot), s(clone)))?;
        if !st.snapshots.contains_key(&(s(volume), s(snapshot))) {
            return Err(dne(format!("snapshot {}@{}", volume, snapshot)));
        }
        if st.volumes.contains_key(clone) {
            return Err(exists(format!("volume {}", clone)));
        }
        let size = st.volumes.get(volume).map(|v| v.size).unwrap_or_default();
        st.volumes.insert(
            s(clone),
            FakeVolume {
                size,
                origin: Some((s(volume), s(snapshot))),
            },
        );
        Ok(())
    }

    async fn delete_clone(
        &self,
        volume: &str,
        snapshot: &str,
        clone: &str,
        recursively_children: bool,
        _recursively_dependents: bool,
    ) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::DeleteClone(s(volume), s(snapshot), s(clone)))?;
        let is_clone = st
            .volumes
            .get(clone)
            .map(|v| v.origin == Some((s(volume), s(snapshot))))
            .unwrap_or(false);
        if !is_clone {
            return Err(dne(format!("clone {} of {}@{}", clone, volume, snapshot)));
        }
        if recursively_children {
            st.snapshots.retain(|(v, _), _| v != clone);
        } else if st.snapshots.keys().any(|(v, _)| v == clone) {
            return Err(busy(format!("clone {} has snapshots", clone)));
        }
        st.volumes.remove(clone);
        Ok(())
    }

    async fn promote_clone(&self, volume: &str, snapshot: &str, clone: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::PromoteClone(s(volume), s(snapshot), s(clone)))?;
        let origin = Some((s(volume), s(snapshot)));
        if st.volumes.get(clone).map(|v| &v.origin) != Some(&origin) {
            return Err(dne(format!("clone {} of {}@{}", clone, volume, snapshot)));
        }

        // The origin snapshot moves to the promoted clone, which becomes the
        // parent of its former origin volume.
        if let Some(creation) = st.snapshots.remove(&(s(volume), s(snapshot))) {
            st.snapshots.insert((s(clone), s(snapshot)), creation);
        }
        if let Some(vol) = st.volumes.get_mut(clone) {
            vol.origin = None;
        }
        if let Some(vol) = st.volumes.get_mut(volume) {
            vol.origin = Some((s(clone), s(snapshot)));
        }
        Ok(())
    }

    async fn create_target(&self, target: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::CreateTarget(s(target)))?;
        if st.targets.contains_key(target) {
            return Err(exists(format!("target {}", target)));
        }
        st.targets.insert(s(target), Vec::new());
        Ok(())
    }

    async fn delete_target(&self, target: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::DeleteTarget(s(target)))?;
        if st.targets.remove(target).is_none() {
            return Err(dne(format!("target {}", target)));
        }
        st.luns.remove(target);
        Ok(())
    }

    async fn attach_to_target(&self, target: &str, volume: &str, mode: LunMode) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::AttachToTarget(s(target), s(volume)))?;
        if !st.targets.contains_key(target) || !st.volumes.contains_key(volume) {
            return Err(dne(format!("target {} or volume {}", target, volume)));
        }
        if st.luns.contains_key(target) {
            return Err(exists(format!("lun 0 of {}", target)));
        }
        st.luns.insert(s(target), (s(volume), mode));
        Ok(())
    }

    async fn detach_from_target(&self, target: &str, volume: &str) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::DetachFromTarget(s(target), s(volume)))?;
        match st.luns.get(target) {
            Some((v, _)) if v == volume => {
                st.luns.remove(target);
                Ok(())
            }
            _ => Err(dne(format!("volume {} on target {}", volume, target))),
        }
    }

    async fn add_user_to_target(
        &self,
        target: &str,
        user: &str,
        _password: &str,
    ) -> RestResult<()> {
        let mut st = self.state.lock();
        self.record(&mut st, Call::AddUserToTarget(s(target), s(user)))?;
        let users = st
            .targets
            .get_mut(target)
            .ok_or_else(|| dne(format!("target {}", target)))?;
        if users.iter().any(|u| u == user) {
            return Err(exists(format!("user {}", user)));
        }
        users.push(s(user));
        Ok(())
    }
}
