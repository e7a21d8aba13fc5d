//! Project registry operations
//!
//! Registry operations must never crash the host: reads tolerate absent or
//! corrupt files, writes are atomic, and the global upsert is a best-effort
//! bounded by a timeout.

use super::models::*;
use crate::error::{Result, WaveError};
use crate::fsio;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use ulid::Ulid;

/// Directory name of the per-project data root
pub const DOCS_DIR: &str = ".wave";
/// Per-project identity file inside the docs dir
pub const PROJECT_FILE: &str = "project.json";
/// Global registry file name inside `~/.wave/`
pub const GLOBAL_REGISTRY_FILE: &str = "projects.json";

/// Budget for the best-effort global registry write
const GLOBAL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}-]").unwrap()
});
static HYPHEN_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());
static CJK_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]+$").unwrap()
});

/// Maps filesystem paths to stable project identities.
#[derive(Debug)]
pub struct ProjectRegistry {
    /// Directory holding the global registry (normally `~/.wave`)
    global_dir: PathBuf,
}

impl ProjectRegistry {
    /// Registry rooted at the user's home directory.
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            global_dir: home.join(DOCS_DIR),
        }
    }

    /// Registry with an explicit global directory (tests, embedded hosts).
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: global_dir.into(),
        }
    }

    fn global_registry_path(&self) -> PathBuf {
        self.global_dir.join(GLOBAL_REGISTRY_FILE)
    }

    /// Read the identity file under `dir`, if any.
    ///
    /// Absent file returns `Ok(None)`; malformed JSON is `CorruptedRegistry`.
    pub async fn load_by_path(&self, dir: &Path) -> Result<Option<ProjectInfo>> {
        let path = dir.join(DOCS_DIR).join(PROJECT_FILE);
        match fsio::read_json_opt::<ProjectInfo>(&path).await {
            Ok(info) => Ok(info),
            Err(WaveError::Parse(_)) => {
                Err(WaveError::CorruptedRegistry(path.display().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Load the project at `dir`, creating its identity when absent.
    ///
    /// Also upserts the project into the global registry (best-effort).
    pub async fn ensure_at_path(&self, dir: &Path) -> Result<ProjectInfo> {
        if !dir.is_dir() {
            return Err(WaveError::InvalidRoot(dir.display().to_string()));
        }

        let info = match self.load_by_path(dir).await? {
            Some(info) => info,
            None => {
                let basename = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let info = ProjectInfo {
                    id: Ulid::new().to_string(),
                    slug: sanitize_slug(&basename),
                    origin: detect_git_origin(dir).await,
                };
                let path = dir.join(DOCS_DIR).join(PROJECT_FILE);
                fsio::write_json_atomic(&path, &info).await?;
                tracing::info!(id = %info.id, slug = %info.slug, "registered new project");
                info
            }
        };

        let record = ProjectRecord::from_info(&info, fsio::normalize_path(dir));
        self.upsert_global(record).await;
        Ok(info)
    }

    /// Merge a record into the global registry, bumping `last_seen`.
    ///
    /// Best-effort: bounded by a 5-second timeout; on timeout or error a
    /// warning is logged and the call is a no-op.
    pub async fn upsert_global(&self, record: ProjectRecord) {
        let fut = self.upsert_global_inner(record);
        match tokio::time::timeout(GLOBAL_WRITE_TIMEOUT, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "global registry upsert failed");
            }
            Err(_) => {
                tracing::warn!("global registry upsert timed out");
            }
        }
    }

    async fn upsert_global_inner(&self, mut record: ProjectRecord) -> Result<()> {
        let mut registry = self.read_global().await;
        record.last_seen = chrono::Utc::now();
        registry.projects.insert(record.id.clone(), record);
        registry.updated_at = chrono::Utc::now();
        registry.version = REGISTRY_VERSION.to_string();
        fsio::write_json_atomic(&self.global_registry_path(), &registry).await
    }

    /// Read the global registry, treating absent or corrupt files as empty.
    pub async fn read_global(&self) -> GlobalRegistry {
        match fsio::read_json_opt::<GlobalRegistry>(&self.global_registry_path()).await {
            Ok(Some(reg)) => reg,
            Ok(None) => GlobalRegistry::default(),
            Err(e) => {
                tracing::warn!(error = %e, "global registry unreadable, treating as empty");
                GlobalRegistry::default()
            }
        }
    }

    /// Look up a project by id and verify it is still where the registry
    /// says it is. Stale entries return `None`.
    pub async fn resolve_project(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let registry = self.read_global().await;
        let Some(record) = registry.projects.get(id).cloned() else {
            return Ok(None);
        };
        let root = PathBuf::from(&record.root);
        if !root.is_dir() {
            return Ok(None);
        }
        match self.load_by_path(&root).await {
            Ok(Some(info)) if info.id == record.id => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(WaveError::CorruptedRegistry(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sweep the global registry, dropping entries whose root is missing or
    /// whose local identity file disagrees.
    pub async fn cleanup_invalid_projects(&self) -> CleanupReport {
        let registry = self.read_global().await;
        let mut report = CleanupReport::default();
        let mut kept = registry.projects.clone();

        for (id, record) in &registry.projects {
            let root = PathBuf::from(&record.root);
            let valid = if !root.is_dir() {
                false
            } else {
                match self.load_by_path(&root).await {
                    Ok(Some(info)) => info.id == *id,
                    Ok(None) => false,
                    Err(e) => {
                        report.errors.push(format!("{}: {}", id, e));
                        false
                    }
                }
            };
            if !valid {
                kept.remove(id);
                report.removed.push(id.clone());
            }
        }

        if !report.removed.is_empty() {
            let updated = GlobalRegistry {
                projects: kept,
                version: REGISTRY_VERSION.to_string(),
                updated_at: chrono::Utc::now(),
            };
            if let Err(e) =
                fsio::write_json_atomic(&self.global_registry_path(), &updated).await
            {
                report.errors.push(e.to_string());
            }
        }
        report
    }

    /// Find projects by slug substring and/or canonicalized root path,
    /// most recently seen first.
    pub async fn find_projects(&self, query: &ProjectQuery) -> Vec<ProjectRecord> {
        let registry = self.read_global().await;
        let wanted_path = query
            .path
            .as_ref()
            .map(|p| fsio::normalize_path(Path::new(p)));

        let mut matches: Vec<ProjectRecord> = registry
            .projects
            .into_values()
            .filter(|record| {
                if let Some(slug) = &query.slug {
                    if !record.slug.contains(slug.as_str()) {
                        return false;
                    }
                }
                if let Some(path) = &wanted_path {
                    if &fsio::normalize_path(Path::new(&record.root)) != path {
                        return false;
                    }
                }
                true
            })
            .collect();
        matches.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        matches
    }
}

impl Default for ProjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a slug from a directory basename.
///
/// Retains word characters, CJK, and hyphens; whitespace runs become a
/// single hyphen; lowercased unless the result is pure CJK; capped at 50
/// chars; empty input falls back to `untitled-project`.
pub fn sanitize_slug(name: &str) -> String {
    let slug = sanitize_slug_capped(name, 50);
    if slug.is_empty() {
        "untitled-project".to_string()
    } else {
        slug
    }
}

/// Slug pipeline with a caller-chosen length cap and no fallback.
pub fn sanitize_slug_capped(name: &str, cap: usize) -> String {
    let collapsed = WHITESPACE.replace_all(name.trim(), "-");
    let filtered = DISALLOWED.replace_all(&collapsed, "");
    let squeezed = HYPHEN_RUNS.replace_all(&filtered, "-");
    let trimmed = squeezed.trim_matches('-');

    let capped: String = trimmed.chars().take(cap).collect();
    if CJK_ONLY.is_match(&capped) {
        capped
    } else {
        capped.to_lowercase()
    }
}

/// Best-effort read of the `origin` remote URL from `<dir>/.git/config`.
async fn detect_git_origin(dir: &Path) -> Option<String> {
    let config = tokio::fs::read_to_string(dir.join(".git/config")).await.ok()?;
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if in_origin {
            if let Some(url) = line.strip_prefix("url") {
                let url = url.trim_start_matches(|c: char| c == '=' || c.is_whitespace());
                if !url.is_empty() {
                    return Some(url.to_string());
                }
            }
        }
    }
    None
}
