//! Optimistic state versioning
//!
//! Each task carries a monotonic counter at `<docs>/.state/<taskId>.state`.
//! Writers pass the version they read; the write commits only when the
//! on-disk counter still matches, then increments it. The counter file is
//! only mutated under the task's file lock, so it is single-writer.

use super::models::{StateVersion, VersionedRead, WriteOutcome};
use crate::error::Result;
use crate::fsio;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct StateVersionStore {
    state_dir: PathBuf,
}

impl StateVersionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn version_path(&self, task_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.state", task_id))
    }

    /// Current counter value; absent or unreadable counters read as 0.
    pub async fn current_version(&self, task_id: &str) -> u64 {
        match fsio::read_json_opt::<StateVersion>(&self.version_path(task_id)).await {
            Ok(Some(v)) => v.version,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "version counter unreadable, treating as 0");
                0
            }
        }
    }

    /// Read `path` together with the task's current version.
    pub async fn versioned_read<T: DeserializeOwned>(
        &self,
        path: &Path,
        task_id: &str,
    ) -> Result<Option<VersionedRead<T>>> {
        let version = self.current_version(task_id).await;
        let data = fsio::read_json_opt::<T>(path).await?;
        Ok(data.map(|data| VersionedRead { data, version }))
    }

    /// Compare-and-swap write: commits `value` to `path` and bumps the
    /// counter only when the on-disk version equals `expected_version`.
    pub async fn atomic_write<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        task_id: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome> {
        let current = self.current_version(task_id).await;
        if current != expected_version {
            tracing::debug!(
                task_id,
                expected = expected_version,
                found = current,
                "versioned write lost the race"
            );
            return Ok(WriteOutcome::conflicted(current));
        }

        fsio::write_json_atomic(path, value).await?;
        let next = StateVersion {
            version: expected_version + 1,
            updated_at: chrono::Utc::now(),
        };
        fsio::write_json_atomic(&self.version_path(task_id), &next).await?;
        Ok(WriteOutcome::committed(next.version))
    }

    /// Whether a previously observed version is still current.
    pub async fn is_consistent(&self, task_id: &str, observed: u64) -> bool {
        self.current_version(task_id).await == observed
    }

    /// Force the counter to a specific value (snapshot restore).
    pub async fn set_version(&self, task_id: &str, version: u64) -> Result<()> {
        let v = StateVersion {
            version,
            updated_at: chrono::Utc::now(),
        };
        fsio::write_json_atomic(&self.version_path(task_id), &v).await
    }
}
