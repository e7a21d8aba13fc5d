//! Project identity models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current schema version of the global registry file
pub const REGISTRY_VERSION: &str = "1.0.0";

/// Per-project identity, stored at `<root>/.wave/project.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// ULID, globally unique
    pub id: String,
    /// Sanitized basename of the project root
    pub slug: String,
    /// Origin repository URL, when detectable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Entry in the global registry, keyed by project id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    /// Absolute, forward-slash-normalized root path
    pub root: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Bumped on every upsert
    pub last_seen: DateTime<Utc>,
}

/// The global registry file at `~/.wave/projects.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRegistry {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectRecord>,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalRegistry {
    fn default() -> Self {
        Self {
            projects: BTreeMap::new(),
            version: REGISTRY_VERSION.to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Filter for [`crate::registry::ProjectRegistry::find_projects`]
#[derive(Debug, Clone, Default)]
pub struct ProjectQuery {
    /// Substring match on slug
    pub slug: Option<String>,
    /// Canonicalized-root comparison
    pub path: Option<String>,
}

/// Outcome of a registry sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Ids dropped because their root vanished or disagreed
    pub removed: Vec<String>,
    /// Non-fatal problems encountered while sweeping
    pub errors: Vec<String>,
}

impl ProjectRecord {
    pub fn from_info(info: &ProjectInfo, root: String) -> Self {
        Self {
            id: info.id.clone(),
            root,
            slug: info.slug.clone(),
            origin: info.origin.clone(),
            last_seen: Utc::now(),
        }
    }
}
