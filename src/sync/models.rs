//! Diff, conflict, and audit record shapes

use crate::task::SyncPreview;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which surface a change originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Panel,
    State,
}

/// A scalar field difference keyed by its section anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChange {
    /// Anchor of the owning section (`plan:…`, `step:…`, `evr:…`, `task`)
    pub section: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub source: ChangeSource,
}

/// Entity kind carrying a checkbox or status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTarget {
    Plan,
    Step,
    Evr,
}

/// A checkbox/status difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub target: StatusTarget,
    pub id: String,
    pub old_status: String,
    pub new_status: String,
}

/// Why a region could not be merged automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    EtagMismatch,
    TsConflict,
    ConcurrentWrite,
}

/// A region the merge policy refused to mutate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Anchor of the conflicted region
    pub region: String,
    pub field: String,
    pub reason: ConflictReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ours_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theirs_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    Content,
    Status,
    Conflict,
}

/// One audited sync effect, appended to the task log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: AuditType,
    pub affected_ids: Vec<String>,
    pub details: serde_json::Value,
}

/// Everything one sync pass produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    /// True when at least one change was applied to the task
    pub applied: bool,
    pub changes: Vec<ContentChange>,
    pub status_changes: Vec<StatusChange>,
    pub conflicts: Vec<Conflict>,
    pub audit_entries: Vec<AuditEntry>,
    /// Set when the pass failed; sync failures never block the mutation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.status_changes.is_empty() && self.conflicts.is_empty()
    }

    /// Compact view included in tool responses.
    pub fn preview(&self) -> SyncPreview {
        SyncPreview {
            applied: self.applied,
            content_changes: self.changes.len(),
            status_changes: self.status_changes.len(),
            conflicts: self.conflicts.len(),
        }
    }
}
