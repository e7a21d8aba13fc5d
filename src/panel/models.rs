//! Panel document model and the checkbox/heading vocabulary

use crate::evr::{EvrClass, EvrStatus, VerificationRun};
use crate::task::ItemStatus;
use serde::{Deserialize, Serialize};

/// Canonical section headings. A project may override them via
/// `templates/panel.json`; the parser accepts either vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelTemplate {
    pub requirements: String,
    pub issues: String,
    pub task_hints: String,
    pub expected_results: String,
    pub plans: String,
    pub logs: String,
}

impl Default for PanelTemplate {
    fn default() -> Self {
        Self {
            requirements: "Requirements".into(),
            issues: "Issues".into(),
            task_hints: "Task Hints".into(),
            expected_results: "Expected Visible Results".into(),
            plans: "Plans & Steps".into(),
            logs: "Logs".into(),
        }
    }
}

/// Bijective checkbox mapping
pub fn status_marker(status: ItemStatus) -> char {
    match status {
        ItemStatus::ToDo => ' ',
        ItemStatus::InProgress => '-',
        ItemStatus::Completed => 'x',
        ItemStatus::Blocked => '!',
    }
}

/// Inverse of [`status_marker`]; unknown markers read as `to_do` and the
/// caller records a warning.
pub fn marker_status(marker: char) -> Option<ItemStatus> {
    match marker {
        ' ' => Some(ItemStatus::ToDo),
        '-' => Some(ItemStatus::InProgress),
        'x' | 'X' => Some(ItemStatus::Completed),
        '!' => Some(ItemStatus::Blocked),
        _ => None,
    }
}

/// A parse problem tied to a source line; never fatal on read paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub line: usize,
    pub message: String,
}

/// A step as it appears in the panel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelStep {
    /// From the `<!-- step:… -->` anchor; absent for hand-added lines
    pub anchor: Option<String>,
    pub description: String,
    pub status: ItemStatus,
    pub hints: Vec<String>,
    pub tags: Vec<(String, String)>,
}

/// A plan as it appears in the panel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelPlan {
    pub anchor: Option<String>,
    pub description: String,
    pub status: ItemStatus,
    pub hints: Vec<String>,
    pub tags: Vec<(String, String)>,
    pub steps: Vec<PanelStep>,
}

/// An EVR as it appears in the panel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelEvr {
    pub anchor: Option<String>,
    pub title: String,
    pub verify: Vec<String>,
    pub expect: Vec<String>,
    pub status: Option<EvrStatus>,
    pub class: Option<EvrClass>,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub notes: Option<String>,
    pub proof: Option<String>,
    pub runs: Vec<VerificationRun>,
}

/// Parsed panel document: best-effort structure plus collected issues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelDoc {
    /// `md_version` declared in front matter, if any
    pub declared_etag: Option<String>,
    /// md5 of the body as read (front matter excluded)
    pub body_etag: String,
    pub title: Option<String>,
    pub task_id: Option<String>,
    pub references: Vec<String>,
    pub requirements: Vec<String>,
    pub issues: Vec<String>,
    pub task_hints: Vec<String>,
    pub evrs: Vec<PanelEvr>,
    pub plans: Vec<PanelPlan>,
    /// Raw log lines; logs never sync panel -> state
    pub log_lines: Vec<String>,
    pub problems: Vec<ParseIssue>,
}
