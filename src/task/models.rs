//! Task models and tool-surface DTOs

use crate::error::{Result, WaveError};
use crate::evr::{Evr, EvrClass, EvrStatus, EvrSummary, RequiredFinal, RunBy};
use crate::registry::manager::sanitize_slug_capped;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Validation bounds for task input
pub const TITLE_MAX: usize = 200;
pub const GOAL_MIN: usize = 10;
pub const GOAL_MAX: usize = 2000;
pub const PLANS_MAX: usize = 20;
pub const PLAN_DESCRIPTION_MAX: usize = 500;
pub const SLUG_MAX: usize = 100;

// ============================================================================
// Status enums
// ============================================================================

/// Shared status for plans and steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    ToDo,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToDo => write!(f, "to_do"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "to_do" | "todo" => Ok(Self::ToDo),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

// ============================================================================
// Core entities
// ============================================================================

/// A `[tag] value` annotation on a plan or step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTag {
    pub tag: String,
    pub value: String,
}

/// A step inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub hints: Vec<String>,
    /// EVR ids this step exercises
    #[serde(default)]
    pub uses_evr: Vec<String>,
    #[serde(default)]
    pub context_tags: Vec<ContextTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            description: description.into(),
            status: ItemStatus::ToDo,
            hints: Vec::new(),
            uses_evr: Vec::new(),
            context_tags: Vec::new(),
            evidence: None,
            notes: None,
            completed_at: None,
        }
    }
}

/// A plan in the task's overall sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// `plan-<n>` for plans created at init, ULID otherwise
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub hints: Vec<String>,
    /// EVR ids gating this plan's completion
    #[serde(default)]
    pub evr_bindings: Vec<String>,
    #[serde(default)]
    pub context_tags: Vec<ContextTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: ItemStatus::ToDo,
            steps: Vec::new(),
            hints: Vec::new(),
            evr_bindings: Vec::new(),
            context_tags: Vec::new(),
            evidence: None,
            notes: None,
            completed_at: None,
        }
    }

    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn find_step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogCategory {
    Task,
    Plan,
    Step,
    Evr,
    Sync,
    System,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "TASK"),
            Self::Plan => write!(f, "PLAN"),
            Self::Step => write!(f, "STEP"),
            Self::Evr => write!(f, "EVR"),
            Self::Sync => write!(f, "SYNC"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    Create,
    Update,
    Modify,
    Verified,
    Failed,
    Test,
    AutoAdvance,
    GateBlocked,
    Complete,
    Archive,
    Conflict,
    Handover,
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Modify => "MODIFY",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::Test => "TEST",
            Self::AutoAdvance => "AUTO_ADVANCE",
            Self::GateBlocked => "GATE_BLOCKED",
            Self::Complete => "COMPLETE",
            Self::Archive => "ARCHIVE",
            Self::Conflict => "CONFLICT",
            Self::Handover => "HANDOVER",
        };
        write!(f, "{}", s)
    }
}

impl LogAction {
    /// Actions surfaced in `logs_highlights` on read.
    pub fn is_highlight(&self) -> bool {
        matches!(
            self,
            Self::Verified
                | Self::Failed
                | Self::Test
                | Self::AutoAdvance
                | Self::GateBlocked
                | Self::Complete
                | Self::Conflict
        )
    }
}

/// Append-only log record. Details are redacted and truncated at ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub action: LogAction,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        category: LogCategory,
        action: LogAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category,
            action,
            message: message.into(),
            ai_notes: None,
            details: None,
        }
    }

    /// Attach a details bag, applying sensitive-key redaction and the
    /// configured size budget.
    pub fn with_details(mut self, details: serde_json::Value, byte_budget: usize) -> Self {
        self.details = Some(crate::logging::sanitize_details(details, byte_budget));
        self
    }
}

// ============================================================================
// Task
// ============================================================================

/// The top-level task entity persisted at `<docs>/current-task.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Derived from the title, <= 100 chars
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    pub goal: String,
    /// Open issues mirrored in the panel's Issues section
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub knowledge_refs: Vec<String>,
    #[serde(default)]
    pub task_hints: Vec<String>,
    #[serde(default)]
    pub overall_plan: Vec<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan_id: Option<String>,
    #[serde(default)]
    pub expected_results: Vec<Evr>,
    /// Append-only; never truncated by the engine
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// ETag of the panel body from the last render
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn find_plan(&self, plan_id: &str) -> Option<&Plan> {
        self.overall_plan.iter().find(|p| p.id == plan_id)
    }

    pub fn find_plan_mut(&mut self, plan_id: &str) -> Option<&mut Plan> {
        self.overall_plan.iter_mut().find(|p| p.id == plan_id)
    }

    /// The single plan whose steps contain `step_id`.
    pub fn plan_of_step(&self, step_id: &str) -> Option<&Plan> {
        self.overall_plan
            .iter()
            .find(|p| p.steps.iter().any(|s| s.id == step_id))
    }

    pub fn find_evr(&self, evr_id: &str) -> Option<&Evr> {
        self.expected_results.iter().find(|e| e.id == evr_id)
    }

    pub fn find_evr_mut(&mut self, evr_id: &str) -> Option<&mut Evr> {
        self.expected_results.iter_mut().find(|e| e.id == evr_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }
}

/// Slug for a task title: same pipeline as project slugs, capped at 100.
pub fn task_slug(title: &str) -> String {
    let slug = sanitize_slug_capped(title, SLUG_MAX);
    if slug.is_empty() {
        "untitled-task".to_string()
    } else {
        slug
    }
}

/// Anchor id for an EVR title: `evr-<slug>`.
pub fn evr_anchor(title: &str) -> String {
    let slug = sanitize_slug_capped(title, 60);
    if slug.is_empty() {
        format!("evr-{}", Ulid::new().to_string().to_lowercase())
    } else {
        format!("evr-{}", slug)
    }
}

// ============================================================================
// Tool-surface DTOs
// ============================================================================

/// Parameters for `task.init`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitTaskParams {
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub overall_plan: Option<Vec<String>>,
    #[serde(default)]
    pub knowledge_refs: Option<Vec<String>>,
    #[serde(default)]
    pub story: Option<String>,
}

impl InitTaskParams {
    /// Shape validation per the engine's input bounds.
    pub fn validate(&self) -> Result<()> {
        let title_len = self.title.trim().chars().count();
        if title_len == 0 {
            return Err(WaveError::Validation("title must not be empty".into()));
        }
        if title_len > TITLE_MAX {
            return Err(WaveError::Validation(format!(
                "title exceeds {} characters",
                TITLE_MAX
            )));
        }
        let goal_len = self.goal.chars().count();
        if !(GOAL_MIN..=GOAL_MAX).contains(&goal_len) {
            return Err(WaveError::Validation(format!(
                "goal must be {}-{} characters, got {}",
                GOAL_MIN, GOAL_MAX, goal_len
            )));
        }
        if let Some(plans) = &self.overall_plan {
            if plans.len() > PLANS_MAX {
                return Err(WaveError::Validation(format!(
                    "at most {} plans allowed, got {}",
                    PLANS_MAX,
                    plans.len()
                )));
            }
            for (i, p) in plans.iter().enumerate() {
                if p.trim().is_empty() {
                    return Err(WaveError::Validation(format!("plan {} is empty", i + 1)));
                }
                if p.chars().count() > PLAN_DESCRIPTION_MAX {
                    return Err(WaveError::Validation(format!(
                        "plan {} exceeds {} characters",
                        i + 1,
                        PLAN_DESCRIPTION_MAX
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of `task.init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitTaskResult {
    pub task_id: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan_id: Option<String>,
    /// True when the task was created without any plans
    pub plan_required: bool,
    pub plan_ids: Vec<String>,
}

/// Which entity `task.update` targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Plan,
    Step,
    Evr,
}

/// One verification outcome reported through `task.update`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvrRunReport {
    pub evr_id: String,
    pub status: EvrStatus,
    #[serde(default)]
    pub by: Option<RunBy>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub proof: Option<String>,
}

/// Parameters for `task.update`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateParams {
    pub update_type: UpdateType,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub evr: Option<Vec<EvrRunReport>>,
}

/// Compact view of sync activity included in responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPreview {
    pub applied: bool,
    pub content_changes: usize,
    pub status_changes: usize,
    pub conflicts: usize,
}

/// Result of `task.update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_preview: Option<SyncPreview>,
    /// Set when a plan completion was blocked by its gate
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub evr_pending: bool,
    /// Bound EVRs still failing the plan gate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evr_for_plan: Vec<String>,
    /// EVRs bound to the node being started (a reminder to verify)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evr_for_node: Vec<String>,
    /// Set when a plan moved to in_progress but has no steps
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub steps_required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_advanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_new_plan: Option<String>,
    /// The step now in progress after auto-advancement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Which field `task.modify` replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyField {
    Goal,
    Plan,
    Steps,
    Hints,
    Evr,
}

/// EVR create/update item for `task.modify`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvrSpec {
    /// Present for updates, absent for creates
    #[serde(default)]
    pub evr_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub verify: Option<Vec<String>>,
    #[serde(default)]
    pub expect: Option<Vec<String>>,
    #[serde(default)]
    pub class: Option<EvrClass>,
    /// Plans to bind the EVR to
    #[serde(default)]
    pub bind_to: Option<Vec<String>>,
}

/// EVR payload for `task.modify`: create/update items and/or removals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvrModify {
    #[serde(default)]
    pub items: Vec<EvrSpec>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Parameters for `task.modify`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyParams {
    pub field: ModifyField,
    /// Content for goal/plan/steps/hints; shape depends on `field`
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub evr: Option<EvrModify>,
    pub reason: String,
    pub change_type: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
}

/// Result of `task.modify`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyResult {
    pub success: bool,
    pub affected_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan_id: Option<String>,
}

/// Result of `task.complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResult {
    pub archived_task_id: String,
    pub evr_summary: EvrSummary,
    pub evr_ready: bool,
}

/// Result of `task.read`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReadView {
    pub task: Task,
    pub evr_summary: EvrSummary,
    /// EVRs that still need a run during the completion window
    pub evr_required_final: Vec<RequiredFinal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_preview: Option<SyncPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md_version: Option<String>,
    pub logs_highlights: Vec<LogEntry>,
    pub logs_full_count: usize,
    /// Panel file modified since the last recorded sync
    pub panel_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> InitTaskParams {
        InitTaskParams {
            title: "Ship the widget".into(),
            goal: "Implement the widget end to end".into(),
            overall_plan: Some(vec!["design".into(), "build".into()]),
            knowledge_refs: None,
            story: None,
        }
    }

    // ========================================================================
    // Validation bounds
    // ========================================================================

    #[test]
    fn test_title_boundary() {
        let mut p = valid_params();
        p.title = "x".repeat(TITLE_MAX);
        assert!(p.validate().is_ok());
        p.title = "x".repeat(TITLE_MAX + 1);
        assert!(matches!(p.validate(), Err(WaveError::Validation(_))));
        p.title = "  ".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_goal_boundary() {
        let mut p = valid_params();
        p.goal = "x".repeat(GOAL_MIN);
        assert!(p.validate().is_ok());
        p.goal = "x".repeat(GOAL_MAX);
        assert!(p.validate().is_ok());
        p.goal = "x".repeat(GOAL_MIN - 1);
        assert!(p.validate().is_err());
        p.goal = "x".repeat(GOAL_MAX + 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_plan_count_boundary() {
        let mut p = valid_params();
        p.overall_plan = Some(vec!["step".to_string(); PLANS_MAX]);
        assert!(p.validate().is_ok());
        p.overall_plan = Some(vec!["step".to_string(); PLANS_MAX + 1]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_plan_description_boundary() {
        let mut p = valid_params();
        p.overall_plan = Some(vec!["x".repeat(PLAN_DESCRIPTION_MAX)]);
        assert!(p.validate().is_ok());
        p.overall_plan = Some(vec!["x".repeat(PLAN_DESCRIPTION_MAX + 1)]);
        assert!(p.validate().is_err());
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    #[test]
    fn test_task_slug_derivation() {
        assert_eq!(task_slug("Ship The Widget!"), "ship-the-widget");
        assert_eq!(task_slug(""), "untitled-task");
        let long = "word ".repeat(50);
        assert!(task_slug(&long).chars().count() <= SLUG_MAX);
    }

    #[test]
    fn test_evr_anchor_derivation() {
        assert_eq!(evr_anchor("Build passes"), "evr-build-passes");
        assert!(evr_anchor("!!!").starts_with("evr-"));
    }

    #[test]
    fn test_plan_of_step_is_unique_parent() {
        let mut plan_a = Plan::new("plan-1", "a");
        let step = Step::new("do it");
        let step_id = step.id.clone();
        plan_a.steps.push(step);
        let plan_b = Plan::new("plan-2", "b");

        let task = Task {
            id: Ulid::new().to_string(),
            title: "T".into(),
            slug: "t".into(),
            story: None,
            goal: "ten chars!".into(),
            issues: vec![],
            knowledge_refs: vec![],
            task_hints: vec![],
            overall_plan: vec![plan_a, plan_b],
            current_plan_id: Some("plan-1".into()),
            expected_results: vec![],
            logs: vec![],
            md_version: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        };
        assert_eq!(task.plan_of_step(&step_id).unwrap().id, "plan-1");
        assert!(task.plan_of_step("missing").is_none());
    }

    #[test]
    fn test_item_status_round_trip() {
        for s in [
            ItemStatus::ToDo,
            ItemStatus::InProgress,
            ItemStatus::Completed,
            ItemStatus::Blocked,
        ] {
            let parsed: ItemStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn test_update_result_omits_empty_fields() {
        let result = UpdateResult {
            success: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("evr_pending"));
        assert!(!json.contains("evr_for_plan"));
        assert!(!json.contains("next_step"));
    }
}
