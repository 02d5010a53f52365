//! Volume-from-snapshot workflow
//!
//! The appliance cannot materialize an independent volume from a snapshot in
//! one call, so the controller chains five calls through temporary artifacts:
//!
//! ```text
//! source@snap --clone--> tmpVol1 --snapshot--> tmpVol1@tmpSnap1, tmpVol1@tmpSnap2
//! tmpVol1@tmpSnap1 --clone--> dest --promote--> dest independent of tmpVol1
//! ```
//!
//! Every failure unwinds what was created so far, dependents first. The
//! temporary artifacts are removed after promotion whether it succeeded or
//! not. Cleanup results are reported in [`CloneOutcome::cleanups`] and logged,
//! never returned as the operation's error.

use super::ids::{temporary_name, SnapshotId};
use crate::backends::error::RestResult;
use crate::domain::ports::StorageBackend;
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

const TMP_VOLUME_SUFFIX: &str = "tmpVol1";
const TMP_SNAPSHOT1_SUFFIX: &str = "tmpSnap1";
const TMP_SNAPSHOT2_SUFFIX: &str = "tmpSnap2";

/// Temporary backend object created by the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Temporary volume, removed with a plain volume delete
    Volume(String),
    /// Clone relationship between a snapshot and the temporary volume
    CloneLink {
        volume: String,
        snapshot: String,
        clone: String,
    },
    Snapshot { volume: String, snapshot: String },
}

/// Result of removing one artifact
#[derive(Debug, Clone)]
pub struct Cleanup {
    pub artifact: Artifact,
    pub outcome: RestResult<()>,
}

impl Cleanup {
    fn log(&self) {
        match &self.outcome {
            Ok(()) => debug!("Removed {:?}", self.artifact),
            Err(e) => warn!("Unable to remove {:?}: {}", self.artifact, e),
        }
    }
}

/// Result of the workflow plus every cleanup it attempted
#[must_use]
#[derive(Debug)]
pub struct CloneOutcome {
    /// Error of the first failing step
    pub result: Result<()>,
    pub cleanups: Vec<Cleanup>,
}

impl CloneOutcome {
    pub fn into_result(self) -> Result<()> {
        self.result
    }
}

/// Sequencer for the volume-from-snapshot calls
pub struct CloneWorkflow<'a> {
    backend: &'a dyn StorageBackend,
}

impl<'a> CloneWorkflow<'a> {
    pub fn new(backend: &'a dyn StorageBackend) -> Self {
        Self { backend }
    }

    /// Materialize `dest` as an independent copy of `source`
    pub async fn run(&self, source: &SnapshotId, dest: &str) -> CloneOutcome {
        let source_volume = source.volume_id().to_string();
        let source_snapshot = source.to_string();
        let tmp_volume = temporary_name(dest, TMP_VOLUME_SUFFIX);
        let tmp_snap1 = temporary_name(&source_snapshot, TMP_SNAPSHOT1_SUFFIX);
        let tmp_snap2 = temporary_name(&source_snapshot, TMP_SNAPSHOT2_SUFFIX);

        let clone_link = Artifact::CloneLink {
            volume: source_volume.clone(),
            snapshot: source_snapshot.clone(),
            clone: tmp_volume.clone(),
        };
        let tmp = Artifact::Volume(tmp_volume.clone());
        let first = Artifact::Snapshot {
            volume: tmp_volume.clone(),
            snapshot: tmp_snap1.clone(),
        };
        let second = Artifact::Snapshot {
            volume: tmp_volume.clone(),
            snapshot: tmp_snap2.clone(),
        };
        let dest_first = Artifact::Snapshot {
            volume: dest.to_string(),
            snapshot: tmp_snap1.clone(),
        };

        info!(
            "Creating volume {} from snapshot {} through {}",
            dest, source_snapshot, tmp_volume
        );

        if let Err(e) = self
            .backend
            .create_clone(&source_volume, &source_snapshot, &tmp_volume)
            .await
        {
            return CloneOutcome {
                result: Err(Error::from_backend("clone source snapshot", &e)),
                cleanups: Vec::new(),
            };
        }

        if let Err(e) = self.backend.create_snapshot(&tmp_volume, &tmp_snap1).await {
            return self
                .abort("snapshot temporary volume", &e, vec![tmp, clone_link])
                .await;
        }

        if let Err(e) = self.backend.create_snapshot(&tmp_volume, &tmp_snap2).await {
            return self
                .abort(
                    "second snapshot of temporary volume",
                    &e,
                    vec![first, tmp, clone_link],
                )
                .await;
        }

        if let Err(e) = self
            .backend
            .create_clone(&tmp_volume, &tmp_snap1, dest)
            .await
        {
            return self
                .abort(
                    "clone temporary snapshot",
                    &e,
                    vec![first, second, tmp, clone_link, dest_first],
                )
                .await;
        }

        let result = self
            .backend
            .promote_clone(&tmp_volume, &tmp_snap1, dest)
            .await
            .map_err(|e| Error::from_backend("promote clone", &e));
        if let Err(e) = &result {
            warn!("Promotion of {} failed: {}", dest, e);
        }

        let cleanups = self.undo(vec![second, tmp, dest_first]).await;
        CloneOutcome { result, cleanups }
    }

    async fn abort(
        &self,
        step: &str,
        err: &crate::backends::error::RestError,
        artifacts: Vec<Artifact>,
    ) -> CloneOutcome {
        warn!("Volume from snapshot failed at {}: {}", step, err);
        let result = Err(Error::from_backend(step, err));
        let cleanups = self.undo(artifacts).await;
        CloneOutcome { result, cleanups }
    }

    async fn undo(&self, artifacts: Vec<Artifact>) -> Vec<Cleanup> {
        let mut cleanups = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let outcome = match &artifact {
                Artifact::Volume(name) => self.backend.delete_volume(name).await,
                Artifact::CloneLink {
                    volume,
                    snapshot,
                    clone,
                } => {
                    self.backend
                        .delete_clone(volume, snapshot, clone, true, true)
                        .await
                }
                Artifact::Snapshot { volume, snapshot } => {
                    self.backend.delete_snapshot(volume, snapshot).await
                }
            };
            let cleanup = Cleanup { artifact, outcome };
            cleanup.log();
            cleanups.push(cleanup);
        }
        cleanups
    }
}
