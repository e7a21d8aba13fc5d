//! Shared filesystem primitives
//!
//! Every persisted artifact goes through these helpers: reads tolerate
//! absent files, writes are temp-file + rename so readers never observe a
//! torn file, and transient errors are retried with a short backoff.

use crate::error::{Result, WaveError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transient-error retry budget for writes
const WRITE_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Read and deserialize a JSON file. Returns `Ok(None)` when the file is
/// absent; malformed JSON is an error the caller decides how to treat.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(WaveError::fs(path.display().to_string(), e)),
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| WaveError::Parse(format!("{}: {}", path.display(), e)))?;
    Ok(Some(value))
}

/// Serialize a value and write it atomically (temp file in the same
/// directory, then rename over the target).
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| WaveError::System(format!("serialize {}: {}", path.display(), e)))?;
    write_atomic(path, &bytes).await
}

/// Write bytes atomically via temp + rename, retrying transient failures.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WaveError::fs(parent.display().to_string(), e))?;
    }
    let tmp = temp_sibling(path);

    let mut attempt = 0u32;
    loop {
        match try_write(&tmp, path, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_RETRIES && is_transient(&e) => {
                attempt += 1;
                tracing::warn!(path = %path.display(), attempt, error = %e, "transient write failure, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(WaveError::fs(path.display().to_string(), e));
            }
        }
    }
}

async fn try_write(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp, bytes).await?;
    tokio::fs::rename(tmp, path).await
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    )
}

/// Temp path next to the target so the rename stays on one filesystem.
fn temp_sibling(path: &Path) -> PathBuf {
    let nonce = ulid::Ulid::new().to_string().to_lowercase();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".into());
    path.with_file_name(format!(".{}.{}.tmp", name, nonce))
}

/// Normalize a path to an absolute, forward-slash form.
pub fn normalize_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        name: String,
        count: u64,
    }

    #[tokio::test]
    async fn test_read_absent_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Probe> = read_json_opt(&dir.path().join("missing.json")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/probe.json");
        let value = Probe {
            name: "wave".into(),
            count: 3,
        };
        write_json_atomic(&path, &value).await.unwrap();
        let got: Probe = read_json_opt(&path).await.unwrap().unwrap();
        assert_eq!(got, value);
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.json");
        write_atomic(&path, b"{}").await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["probe.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let got: crate::error::Result<Option<Probe>> = read_json_opt(&path).await;
        assert!(got.is_err());
    }
}
