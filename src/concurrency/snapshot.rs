//! Task snapshots
//!
//! A snapshot captures the task JSON, the version counter, and a SHA-256
//! checksum. Restore verifies the checksum, rewinds the JSON file, and
//! resets the counter.

use super::models::Snapshot;
use super::version::StateVersionStore;
use crate::error::{Result, WaveError};
use crate::fsio;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub struct SnapshotStore {
    state_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn snapshot_path(&self, task_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.snapshot.json", task_id))
    }

    /// Record the current task JSON and version.
    pub async fn create_snapshot(
        &self,
        task_id: &str,
        data_path: &Path,
        versions: &StateVersionStore,
    ) -> Result<Snapshot> {
        let payload = tokio::fs::read_to_string(data_path)
            .await
            .map_err(|e| WaveError::fs(data_path.display().to_string(), e))?;
        let snapshot = Snapshot {
            task_id: task_id.to_string(),
            version: versions.current_version(task_id).await,
            timestamp: chrono::Utc::now(),
            checksum: checksum(&payload),
            payload,
        };
        fsio::write_json_atomic(&self.snapshot_path(task_id), &snapshot).await?;
        tracing::debug!(task_id, version = snapshot.version, "snapshot created");
        Ok(snapshot)
    }

    /// Rewind the task JSON and version counter to the stored snapshot.
    /// Fails when no snapshot exists or its checksum does not verify.
    pub async fn restore_snapshot(
        &self,
        task_id: &str,
        data_path: &Path,
        versions: &StateVersionStore,
    ) -> Result<Snapshot> {
        let snapshot = fsio::read_json_opt::<Snapshot>(&self.snapshot_path(task_id))
            .await?
            .ok_or_else(|| WaveError::NotFound {
                entity: "snapshot",
                id: task_id.to_string(),
            })?;

        if checksum(&snapshot.payload) != snapshot.checksum {
            return Err(WaveError::System(format!(
                "snapshot checksum mismatch for task {}",
                task_id
            )));
        }

        fsio::write_atomic(data_path, snapshot.payload.as_bytes()).await?;
        versions.set_version(task_id, snapshot.version).await?;
        tracing::info!(task_id, version = snapshot.version, "snapshot restored");
        Ok(snapshot)
    }
}

fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}
