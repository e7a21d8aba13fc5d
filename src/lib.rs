//! WaveForge core
//!
//! A task-state coherence engine for AI-assisted development:
//! - a structured JSON task state and a human-editable Markdown panel,
//!   reconciled by a lazy synchronizer before every mutation
//! - Expected Visible Results gating plan and task completion
//! - per-task file locks, optimistic version counters, and snapshots for
//!   cooperating processes sharing a project root
//! - a global project registry giving every project a stable identity

#[cfg(test)]
#[macro_use]
extern crate tokio_test;

pub mod concurrency;
pub mod error;
pub mod evr;
pub mod fsio;
pub mod logging;
pub mod panel;
pub mod registry;
pub mod sync;
pub mod task;

pub use error::{ErrorCode, Result, WaveError};

use registry::{ProjectInfo, ProjectRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use task::TaskManager;

/// Engine tuning knobs. Every value has a default and an environment
/// override (`WAVE_*`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total lock wait budget in ms; -1 waits forever, 0 fails fast
    pub lock_timeout_ms: i64,
    /// TTL stamped into lock files
    pub lock_ttl_ms: u64,
    /// Sleep between lock attempts
    pub retry_interval_ms: u64,
    /// Versioned-write retries before giving up
    pub write_retries: u32,
    /// Byte budget for structured log detail bags
    pub log_detail_budget: usize,
    /// Prefix the panel with an ETag front matter block
    pub front_matter: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_ttl_ms: 30_000,
            retry_interval_ms: 50,
            write_retries: 3,
            log_detail_budget: 8 * 1024,
            front_matter: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout_ms: env_parse("WAVE_LOCK_TIMEOUT_MS", defaults.lock_timeout_ms),
            lock_ttl_ms: env_parse("WAVE_LOCK_TTL_MS", defaults.lock_ttl_ms),
            retry_interval_ms: env_parse("WAVE_RETRY_INTERVAL_MS", defaults.retry_interval_ms),
            write_retries: env_parse("WAVE_WRITE_RETRIES", defaults.write_retries),
            log_detail_budget: env_parse("WAVE_LOG_DETAIL_BUDGET", defaults.log_detail_budget),
            front_matter: env_parse("WAVE_FRONT_MATTER", defaults.front_matter),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// One engine per bound project: registry identity plus the task manager
/// rooted at `<project_root>/.wave/`.
#[derive(Debug)]
pub struct WaveEngine {
    project: ProjectInfo,
    project_root: PathBuf,
    tasks: Arc<TaskManager>,
    registry: Arc<ProjectRegistry>,
}

impl WaveEngine {
    /// Bind a project root: ensure its identity, register it globally,
    /// and open the task manager over its docs directory.
    pub async fn open(project_root: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let project_root = project_root.into();
        if !project_root.is_dir() {
            return Err(WaveError::InvalidRoot(project_root.display().to_string()));
        }
        let registry = Arc::new(ProjectRegistry::new());
        Self::open_with_registry(project_root, config, registry).await
    }

    /// Like [`WaveEngine::open`] with an explicit registry (tests and
    /// embedded hosts point it at a scratch global directory).
    pub async fn open_with_registry(
        project_root: impl Into<PathBuf>,
        config: EngineConfig,
        registry: Arc<ProjectRegistry>,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let project = registry.ensure_at_path(&project_root).await?;
        let docs_dir = project_root.join(registry::manager::DOCS_DIR);
        let tasks = Arc::new(TaskManager::open(docs_dir, config).await?);
        Ok(Self {
            project,
            project_root,
            tasks,
            registry,
        })
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The task operation surface for this project.
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// The shared project registry.
    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }
}
