//! Per-task file locks
//!
//! A lock is a JSON file created with `O_EXCL` at `<docs>/.locks/<taskId>.lock`.
//! Contenders retry on an interval until their deadline, reclaiming locks
//! whose TTL has passed. Release verifies ownership before deleting.

use super::models::{AcquireOptions, Lock, LockType};
use crate::error::{Result, WaveError};
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// File-lock manager for one process.
///
/// The held-lock table feeds deadlock prevention; it only tracks locks
/// acquired through this manager instance.
#[derive(Debug)]
pub struct LockManager {
    locks_dir: PathBuf,
    process_id: String,
    held: DashMap<String, Lock>,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            process_id: format!("pid-{}", std::process::id()),
            held: DashMap::new(),
        }
    }

    /// Override the process identity (tests simulate multiple processes).
    pub fn with_process_id(locks_dir: impl Into<PathBuf>, process_id: impl Into<String>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            process_id: process_id.into(),
            held: DashMap::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Task ids of locks currently held by this manager.
    pub fn held_locks(&self) -> Vec<String> {
        self.held.iter().map(|e| e.key().clone()).collect()
    }

    fn lock_path(&self, task_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", task_id))
    }

    /// Acquire a lock on `task_id`, waiting per `opts`.
    pub async fn acquire(
        &self,
        task_id: &str,
        lock_type: LockType,
        opts: &AcquireOptions,
    ) -> Result<Lock> {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            if let Some(cancel) = &opts.cancel {
                if cancel.is_cancelled() {
                    return Err(WaveError::Cancelled);
                }
            }

            self.sweep_stale().await;

            match self.try_create(task_id, lock_type, opts.ttl_ms).await? {
                Some(lock) => {
                    self.held.insert(task_id.to_string(), lock.clone());
                    tracing::debug!(task_id, process_id = %self.process_id, "lock acquired");
                    return Ok(lock);
                }
                None => {
                    // Contended: decide whether to keep waiting
                    let existing = self.read_lock(task_id).await?;
                    if let Some(existing) = existing {
                        if existing.is_stale(Utc::now()) {
                            self.remove_lock_file(task_id).await?;
                            continue;
                        }
                    }

                    attempts += 1;
                    if let Some(max) = opts.max_retries {
                        if attempts > max {
                            return Err(WaveError::LockTimeout {
                                task_id: task_id.to_string(),
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                    }
                    match opts.timeout_ms {
                        0 => {
                            return Err(WaveError::LockTimeout {
                                task_id: task_id.to_string(),
                                waited_ms: 0,
                            })
                        }
                        t if t > 0 && started.elapsed().as_millis() as i64 >= t => {
                            return Err(WaveError::LockTimeout {
                                task_id: task_id.to_string(),
                                waited_ms: started.elapsed().as_millis() as u64,
                            })
                        }
                        _ => {}
                    }
                    tokio::time::sleep(opts.retry_interval).await;
                }
            }
        }
    }

    /// Reclaim a stale lock without waiting. Rejected when the existing
    /// lock is still valid.
    pub async fn force_acquire(&self, task_id: &str, lock_type: LockType, ttl_ms: u64) -> Result<Lock> {
        if let Some(existing) = self.read_lock(task_id).await? {
            if !existing.is_stale(Utc::now()) {
                return Err(WaveError::ForeignLock {
                    task_id: task_id.to_string(),
                    holder: existing.process_id,
                });
            }
            self.remove_lock_file(task_id).await?;
        }
        match self.try_create(task_id, lock_type, ttl_ms).await? {
            Some(lock) => {
                self.held.insert(task_id.to_string(), lock.clone());
                Ok(lock)
            }
            None => Err(WaveError::LockTimeout {
                task_id: task_id.to_string(),
                waited_ms: 0,
            }),
        }
    }

    /// Release a held lock. Ownership is re-verified against the file, so
    /// a lock reclaimed by another process fails with `ForeignLock`.
    pub async fn release(&self, lock: &Lock) -> Result<()> {
        let on_disk = self.read_lock(&lock.task_id).await?;
        match on_disk {
            None => {
                // Already reclaimed and released; nothing to delete
                self.held.remove(&lock.task_id);
                Ok(())
            }
            Some(current) if current.process_id == self.process_id => {
                self.remove_lock_file(&lock.task_id).await?;
                self.held.remove(&lock.task_id);
                tracing::debug!(task_id = %lock.task_id, "lock released");
                Ok(())
            }
            Some(current) => Err(WaveError::ForeignLock {
                task_id: lock.task_id.clone(),
                holder: current.process_id,
            }),
        }
    }

    /// Remove every lock file in the directory whose deadline has passed.
    pub async fn sweep_stale(&self) {
        let mut entries = match tokio::fs::read_dir(&self.locks_dir).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let now = Utc::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(lock) = serde_json::from_slice::<Lock>(&bytes) {
                    if lock.is_stale(now) {
                        tracing::warn!(task_id = %lock.task_id, holder = %lock.process_id, "removing stale lock");
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
            }
        }
    }

    /// Attempt an exclusive create. `Ok(None)` means contended.
    async fn try_create(
        &self,
        task_id: &str,
        lock_type: LockType,
        ttl_ms: u64,
    ) -> Result<Option<Lock>> {
        tokio::fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| WaveError::fs(self.locks_dir.display().to_string(), e))?;

        let lock = Lock {
            task_id: task_id.to_string(),
            process_id: self.process_id.clone(),
            timestamp: Utc::now(),
            timeout: ttl_ms,
            lock_type,
        };
        let body = serde_json::to_vec_pretty(&lock)
            .map_err(|e| WaveError::System(format!("serialize lock: {}", e)))?;

        let path = self.lock_path(task_id);
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(&body)
                    .await
                    .map_err(|e| WaveError::fs(path.display().to_string(), e))?;
                file.flush()
                    .await
                    .map_err(|e| WaveError::fs(path.display().to_string(), e))?;
                Ok(Some(lock))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(WaveError::fs(path.display().to_string(), e)),
        }
    }

    /// Read and parse the lock file for `task_id`. Absent file is `None`;
    /// unparseable contents are `CorruptedLock`.
    pub async fn read_lock(&self, task_id: &str) -> Result<Option<Lock>> {
        let path = self.lock_path(task_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WaveError::fs(path.display().to_string(), e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| WaveError::CorruptedLock(task_id.to_string()))
    }

    async fn remove_lock_file(&self, task_id: &str) -> Result<()> {
        let path = self.lock_path(task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WaveError::fs(path.display().to_string(), e)),
        }
    }
}

/// Write a lock file directly (tests build contention scenarios with it).
pub async fn plant_lock(locks_dir: &Path, lock: &Lock) -> Result<()> {
    let path = locks_dir.join(format!("{}.lock", lock.task_id));
    crate::fsio::write_json_atomic(&path, lock).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn manager(dir: &Path, pid: &str) -> LockManager {
        LockManager::with_process_id(dir, pid)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path(), "p1");
        let lock = assert_ok!(
            m.acquire("task-a", LockType::Write, &AcquireOptions::default())
                .await
        );
        assert_eq!(lock.process_id, "p1");
        assert!(dir.path().join("task-a.lock").exists());
        assert_eq!(m.held_locks(), vec!["task-a".to_string()]);

        assert_ok!(m.release(&lock).await);
        assert!(!dir.path().join("task-a.lock").exists());
        assert!(m.held_locks().is_empty());
    }

    #[tokio::test]
    async fn test_contended_zero_timeout_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let holder = manager(dir.path(), "p1");
        let contender = manager(dir.path(), "p2");

        let _lock = holder
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let err = assert_err!(
            contender
                .acquire("task-a", LockType::Write, &AcquireOptions::immediate())
                .await
        );
        assert!(matches!(err, WaveError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_indefinite_wait_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let holder = manager(dir.path(), "p1");
        let lock = holder
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let dir_path = dir.path().to_path_buf();
        let waiter = tokio::spawn(async move {
            let contender = manager(&dir_path, "p2");
            let opts = AcquireOptions {
                timeout_ms: -1,
                retry_interval: std::time::Duration::from_millis(10),
                ..AcquireOptions::default()
            };
            contender.acquire("task-a", LockType::Write, &opts).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        holder.release(&lock).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.process_id, "p2");
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let dead = Lock {
            task_id: "task-a".into(),
            process_id: "dead-process".into(),
            timestamp: Utc::now() - chrono::Duration::seconds(60),
            timeout: 30_000,
            lock_type: LockType::Write,
        };
        plant_lock(dir.path(), &dead).await.unwrap();

        let m = manager(dir.path(), "p2");
        let lock = m
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(lock.process_id, "p2");
    }

    #[tokio::test]
    async fn test_corrupted_lock_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("task-a.lock"), "not json").unwrap();

        let m = manager(dir.path(), "p1");
        let err = m.read_lock("task-a").await.unwrap_err();
        assert!(matches!(err, WaveError::CorruptedLock(_)));
    }

    #[tokio::test]
    async fn test_release_foreign_lock_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = manager(dir.path(), "p1");
        let p2 = manager(dir.path(), "p2");

        let lock = p1
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        // p2 pretends it owns the same lock handle
        let err = assert_err!(p2.release(&lock).await);
        assert!(matches!(err, WaveError::ForeignLock { .. }));
        assert!(dir.path().join("task-a.lock").exists());
    }

    #[tokio::test]
    async fn test_force_acquire_over_valid_lock_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = manager(dir.path(), "p1");
        let p2 = manager(dir.path(), "p2");

        p1.acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();
        let err = p2.force_acquire("task-a", LockType::Write, 30_000).await.unwrap_err();
        assert!(matches!(err, WaveError::ForeignLock { .. }));
    }

    #[tokio::test]
    async fn test_force_acquire_over_stale_lock_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let dead = Lock {
            task_id: "task-a".into(),
            process_id: "dead".into(),
            timestamp: Utc::now() - chrono::Duration::seconds(120),
            timeout: 1_000,
            lock_type: LockType::Write,
        };
        plant_lock(dir.path(), &dead).await.unwrap();

        let m = manager(dir.path(), "p2");
        let lock = m.force_acquire("task-a", LockType::Write, 30_000).await.unwrap();
        assert_eq!(lock.process_id, "p2");
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let holder = manager(dir.path(), "p1");
        holder
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = AcquireOptions {
            timeout_ms: -1,
            cancel: Some(cancel),
            ..AcquireOptions::default()
        };
        let contender = manager(dir.path(), "p2");
        let err = contender.acquire("task-a", LockType::Write, &opts).await.unwrap_err();
        assert!(matches!(err, WaveError::Cancelled));
    }

    #[tokio::test]
    async fn test_max_retries_caps_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let holder = manager(dir.path(), "p1");
        holder
            .acquire("task-a", LockType::Write, &AcquireOptions::default())
            .await
            .unwrap();

        let opts = AcquireOptions {
            timeout_ms: -1,
            max_retries: Some(2),
            retry_interval: std::time::Duration::from_millis(5),
            ..AcquireOptions::default()
        };
        let contender = manager(dir.path(), "p2");
        let err = contender.acquire("task-a", LockType::Write, &opts).await.unwrap_err();
        assert!(matches!(err, WaveError::LockTimeout { .. }));
    }
}
