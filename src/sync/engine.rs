//! Detect / merge / apply
//!
//! Merge policy `etag_first_then_ts`: a panel whose body ETag differs from
//! the task's recorded `md_version` carries user edits, which win for
//! content fields unless the state side was written after the panel file
//! (then the region conflicts and state is retained). Checkbox statuses
//! always flow panel to state. When ETags agree yet content differs, the
//! panel wins content, the state keeps statuses, and a region disagreeing
//! in both kinds at once becomes a conflict with no mutation.

use super::models::*;
use crate::evr::EvrStatus;
use crate::panel::PanelDoc;
use crate::task::{ItemStatus, LogAction, LogCategory, LogEntry, LogLevel, Task};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// One mergeable difference with everything needed to apply it
#[derive(Debug, Clone)]
enum Pending {
    Title(String),
    Goal(String),
    Issues(Vec<String>),
    Hints(Vec<String>),
    References(Vec<String>),
    PlanDescription { plan_id: String, value: String },
    StepDescription { step_id: String, value: String },
    EvrTitle { evr_id: String, value: String },
    EvrVerify { evr_id: String, value: Vec<String> },
    EvrExpect { evr_id: String, value: Vec<String> },
    PlanStatus { plan_id: String, value: ItemStatus },
    StepStatus { step_id: String, value: ItemStatus },
    EvrStatus { evr_id: String, value: EvrStatus },
}

#[derive(Debug, Default)]
struct DetectOutcome {
    content: Vec<(ContentChange, Option<Pending>)>,
    status: Vec<(StatusChange, Pending)>,
}

/// Reconciles panel edits into the task immediately before a mutation.
#[derive(Debug, Default)]
pub struct LazySynchronizer;

impl LazySynchronizer {
    pub fn new() -> Self {
        Self
    }

    /// Run one sync pass. Failures are captured in the result; the caller
    /// proceeds with its mutation either way.
    pub fn sync(
        &self,
        task: &mut Task,
        panel: Option<&PanelDoc>,
        panel_mtime: Option<DateTime<Utc>>,
    ) -> SyncResult {
        let Some(panel) = panel else {
            return SyncResult::default();
        };

        // No-diff short-circuit: panel unchanged since the last render and
        // not newer than the state.
        let etag_match = task.md_version.as_deref() == Some(panel.body_etag.as_str());
        if etag_match && panel_mtime.map_or(true, |m| m <= task.updated_at) {
            return SyncResult::default();
        }

        let detected = detect(task, panel);
        self.merge_and_apply(task, detected, etag_match, panel_mtime)
    }

    fn merge_and_apply(
        &self,
        task: &mut Task,
        detected: DetectOutcome,
        etag_match: bool,
        panel_mtime: Option<DateTime<Utc>>,
    ) -> SyncResult {
        let mut result = SyncResult::default();
        let state_ts = task.updated_at;

        // Cross-kind disagreement only matters on the ETag-equal path
        let cross_kind: HashSet<String> = if etag_match {
            let content_regions: HashSet<&str> = detected
                .content
                .iter()
                .filter(|(_, p)| p.is_some())
                .map(|(c, _)| c.section.as_str())
                .collect();
            detected
                .status
                .iter()
                .map(|(s, _)| status_region(s))
                .filter(|r| content_regions.contains(r.as_str()))
                .collect()
        } else {
            HashSet::new()
        };

        let mut applied = Vec::new();

        for (change, pending) in detected.content {
            let Some(pending) = pending else {
                // Structural add/remove: reported, audited, not applied
                result.changes.push(change);
                continue;
            };
            if cross_kind.contains(&change.section) {
                result.conflicts.push(Conflict {
                    region: change.section.clone(),
                    field: change.field.clone(),
                    reason: ConflictReason::EtagMismatch,
                    ours_ts: Some(state_ts),
                    theirs_ts: panel_mtime,
                });
                continue;
            }
            if !etag_match {
                // State written after the panel file: retain state
                if let Some(mtime) = panel_mtime {
                    if state_ts > mtime {
                        result.conflicts.push(Conflict {
                            region: change.section.clone(),
                            field: change.field.clone(),
                            reason: ConflictReason::TsConflict,
                            ours_ts: Some(state_ts),
                            theirs_ts: Some(mtime),
                        });
                        continue;
                    }
                }
            }
            applied.push(pending);
            result.changes.push(change);
        }

        for (change, pending) in detected.status {
            let region = status_region(&change);
            if cross_kind.contains(&region) {
                // Already recorded as a conflict on the content side
                continue;
            }
            if etag_match {
                // State wins statuses when the panel body is unchanged
                continue;
            }
            applied.push(pending);
            result.status_changes.push(change);
        }

        for pending in applied {
            apply(task, pending);
            result.applied = true;
        }

        self.audit(task, &mut result);
        result
    }

    /// Emit audit entries and append them to the task log.
    fn audit(&self, task: &mut Task, result: &mut SyncResult) {
        let now = Utc::now();
        if result.applied {
            let mut affected: Vec<String> = result
                .changes
                .iter()
                .map(|c| c.section.clone())
                .chain(result.status_changes.iter().map(status_region))
                .collect();
            affected.dedup();
            let entry = AuditEntry {
                timestamp: now,
                entry_type: if result.status_changes.is_empty() {
                    AuditType::Content
                } else {
                    AuditType::Status
                },
                affected_ids: affected.clone(),
                details: serde_json::json!({
                    "content_changes": result.changes.len(),
                    "status_changes": result.status_changes.len(),
                }),
            };
            task.push_log(
                LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Sync,
                    LogAction::Update,
                    format!(
                        "Panel edits merged: {} content, {} status",
                        result.changes.len(),
                        result.status_changes.len()
                    ),
                )
                .with_details(serde_json::to_value(&entry).unwrap_or_default(), 8 * 1024),
            );
            result.audit_entries.push(entry);
        }

        for conflict in &result.conflicts {
            let entry = AuditEntry {
                timestamp: now,
                entry_type: AuditType::Conflict,
                affected_ids: vec![conflict.region.clone()],
                details: serde_json::to_value(conflict).unwrap_or_default(),
            };
            task.push_log(
                LogEntry::new(
                    LogLevel::Warn,
                    LogCategory::Sync,
                    LogAction::Conflict,
                    format!("Sync conflict in {} ({})", conflict.region, conflict.field),
                )
                .with_details(entry.details.clone(), 8 * 1024),
            );
            result.audit_entries.push(entry);
        }
    }
}

fn status_region(change: &StatusChange) -> String {
    let kind = match change.target {
        StatusTarget::Plan => "plan",
        StatusTarget::Step => "step",
        StatusTarget::Evr => "evr",
    };
    format!("{}:{}", kind, change.id)
}

// ============================================================================
// Detect
// ============================================================================

fn detect(task: &Task, panel: &PanelDoc) -> DetectOutcome {
    let mut out = DetectOutcome::default();

    if let Some(title) = &panel.title {
        scalar_diff(&mut out, "task", "title", &task.title, title, |v| {
            Pending::Title(v)
        });
    }
    // Empty sections are indistinguishable from absent ones (the renderer
    // omits them), so an empty panel side never clears a task field.
    if !panel.requirements.is_empty() {
        let panel_goal = panel.requirements.join("\n");
        scalar_diff(&mut out, "task", "requirements", &task.goal, &panel_goal, |v| {
            Pending::Goal(v)
        });
    }
    list_diff(&mut out, "task", "issues", &task.issues, &panel.issues, Pending::Issues);
    list_diff(
        &mut out,
        "task",
        "hints",
        &task.task_hints,
        &panel.task_hints,
        Pending::Hints,
    );
    list_diff(
        &mut out,
        "task",
        "references",
        &task.knowledge_refs,
        &panel.references,
        Pending::References,
    );

    detect_plans(task, panel, &mut out);
    detect_evrs(task, panel, &mut out);
    out
}

fn detect_plans(task: &Task, panel: &PanelDoc, out: &mut DetectOutcome) {
    let mut seen: HashSet<&str> = HashSet::new();

    for panel_plan in &panel.plans {
        let Some(anchor) = &panel_plan.anchor else {
            out.content.push((
                ContentChange {
                    section: "plans".into(),
                    field: "plan".into(),
                    old_value: None,
                    new_value: Some(panel_plan.description.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        let Some(task_plan) = task.find_plan(anchor) else {
            out.content.push((
                ContentChange {
                    section: format!("plan:{}", anchor),
                    field: "plan".into(),
                    old_value: None,
                    new_value: Some(panel_plan.description.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        seen.insert(task_plan.id.as_str());

        let region = format!("plan:{}", anchor);
        if task_plan.description != panel_plan.description {
            out.content.push((
                ContentChange {
                    section: region.clone(),
                    field: "description".into(),
                    old_value: Some(task_plan.description.clone()),
                    new_value: Some(panel_plan.description.clone()),
                    source: ChangeSource::Panel,
                },
                Some(Pending::PlanDescription {
                    plan_id: task_plan.id.clone(),
                    value: panel_plan.description.clone(),
                }),
            ));
        }
        if task_plan.status != panel_plan.status {
            out.status.push((
                StatusChange {
                    target: StatusTarget::Plan,
                    id: task_plan.id.clone(),
                    old_status: task_plan.status.to_string(),
                    new_status: panel_plan.status.to_string(),
                },
                Pending::PlanStatus {
                    plan_id: task_plan.id.clone(),
                    value: panel_plan.status,
                },
            ));
        }

        detect_steps(task_plan, panel_plan, out);
    }

    for task_plan in &task.overall_plan {
        if !seen.contains(task_plan.id.as_str()) {
            out.content.push((
                ContentChange {
                    section: format!("plan:{}", task_plan.id),
                    field: "plan".into(),
                    old_value: Some(task_plan.description.clone()),
                    new_value: None,
                    source: ChangeSource::State,
                },
                None,
            ));
        }
    }
}

fn detect_steps(
    task_plan: &crate::task::Plan,
    panel_plan: &crate::panel::PanelPlan,
    out: &mut DetectOutcome,
) {
    let mut seen: HashSet<&str> = HashSet::new();

    for panel_step in &panel_plan.steps {
        let Some(anchor) = &panel_step.anchor else {
            out.content.push((
                ContentChange {
                    section: format!("plan:{}", task_plan.id),
                    field: "step".into(),
                    old_value: None,
                    new_value: Some(panel_step.description.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        let Some(task_step) = task_plan.find_step(anchor) else {
            out.content.push((
                ContentChange {
                    section: format!("step:{}", anchor),
                    field: "step".into(),
                    old_value: None,
                    new_value: Some(panel_step.description.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        seen.insert(task_step.id.as_str());

        let region = format!("step:{}", anchor);
        if task_step.description != panel_step.description {
            out.content.push((
                ContentChange {
                    section: region.clone(),
                    field: "description".into(),
                    old_value: Some(task_step.description.clone()),
                    new_value: Some(panel_step.description.clone()),
                    source: ChangeSource::Panel,
                },
                Some(Pending::StepDescription {
                    step_id: task_step.id.clone(),
                    value: panel_step.description.clone(),
                }),
            ));
        }
        if task_step.status != panel_step.status {
            out.status.push((
                StatusChange {
                    target: StatusTarget::Step,
                    id: task_step.id.clone(),
                    old_status: task_step.status.to_string(),
                    new_status: panel_step.status.to_string(),
                },
                Pending::StepStatus {
                    step_id: task_step.id.clone(),
                    value: panel_step.status,
                },
            ));
        }
    }

    for task_step in &task_plan.steps {
        if !seen.contains(task_step.id.as_str()) {
            out.content.push((
                ContentChange {
                    section: format!("step:{}", task_step.id),
                    field: "step".into(),
                    old_value: Some(task_step.description.clone()),
                    new_value: None,
                    source: ChangeSource::State,
                },
                None,
            ));
        }
    }
}

fn detect_evrs(task: &Task, panel: &PanelDoc, out: &mut DetectOutcome) {
    let mut seen: HashSet<&str> = HashSet::new();

    for panel_evr in &panel.evrs {
        let Some(anchor) = &panel_evr.anchor else {
            out.content.push((
                ContentChange {
                    section: "evrs".into(),
                    field: "evr".into(),
                    old_value: None,
                    new_value: Some(panel_evr.title.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        let Some(task_evr) = task.find_evr(anchor) else {
            out.content.push((
                ContentChange {
                    section: format!("evr:{}", anchor),
                    field: "evr".into(),
                    old_value: None,
                    new_value: Some(panel_evr.title.clone()),
                    source: ChangeSource::Panel,
                },
                None,
            ));
            continue;
        };
        seen.insert(task_evr.id.as_str());

        let region = format!("evr:{}", anchor);
        if task_evr.title != panel_evr.title {
            out.content.push((
                ContentChange {
                    section: region.clone(),
                    field: "title".into(),
                    old_value: Some(task_evr.title.clone()),
                    new_value: Some(panel_evr.title.clone()),
                    source: ChangeSource::Panel,
                },
                Some(Pending::EvrTitle {
                    evr_id: task_evr.id.clone(),
                    value: panel_evr.title.clone(),
                }),
            ));
        }
        if task_evr.verify != panel_evr.verify {
            out.content.push((
                ContentChange {
                    section: region.clone(),
                    field: "verify".into(),
                    old_value: Some(task_evr.verify.join("\n")),
                    new_value: Some(panel_evr.verify.join("\n")),
                    source: ChangeSource::Panel,
                },
                Some(Pending::EvrVerify {
                    evr_id: task_evr.id.clone(),
                    value: panel_evr.verify.clone(),
                }),
            ));
        }
        if task_evr.expect != panel_evr.expect {
            out.content.push((
                ContentChange {
                    section: region.clone(),
                    field: "expect".into(),
                    old_value: Some(task_evr.expect.join("\n")),
                    new_value: Some(panel_evr.expect.join("\n")),
                    source: ChangeSource::Panel,
                },
                Some(Pending::EvrExpect {
                    evr_id: task_evr.id.clone(),
                    value: panel_evr.expect.clone(),
                }),
            ));
        }
        if let Some(panel_status) = panel_evr.status {
            if task_evr.status != panel_status {
                out.status.push((
                    StatusChange {
                        target: StatusTarget::Evr,
                        id: task_evr.id.clone(),
                        old_status: task_evr.status.to_string(),
                        new_status: panel_status.to_string(),
                    },
                    Pending::EvrStatus {
                        evr_id: task_evr.id.clone(),
                        value: panel_status,
                    },
                ));
            }
        }
    }

    for task_evr in &task.expected_results {
        if !seen.contains(task_evr.id.as_str()) {
            out.content.push((
                ContentChange {
                    section: format!("evr:{}", task_evr.id),
                    field: "evr".into(),
                    old_value: Some(task_evr.title.clone()),
                    new_value: None,
                    source: ChangeSource::State,
                },
                None,
            ));
        }
    }
}

fn scalar_diff(
    out: &mut DetectOutcome,
    section: &str,
    field: &str,
    ours: &str,
    theirs: &str,
    make: impl FnOnce(String) -> Pending,
) {
    if ours != theirs {
        out.content.push((
            ContentChange {
                section: section.into(),
                field: field.into(),
                old_value: Some(ours.to_string()),
                new_value: Some(theirs.to_string()),
                source: ChangeSource::Panel,
            },
            Some(make(theirs.to_string())),
        ));
    }
}

fn list_diff(
    out: &mut DetectOutcome,
    section: &str,
    field: &str,
    ours: &[String],
    theirs: &[String],
    make: impl FnOnce(Vec<String>) -> Pending,
) {
    if !theirs.is_empty() && ours != theirs {
        out.content.push((
            ContentChange {
                section: section.into(),
                field: field.into(),
                old_value: Some(ours.join("\n")),
                new_value: Some(theirs.join("\n")),
                source: ChangeSource::Panel,
            },
            Some(make(theirs.to_vec())),
        ));
    }
}

// ============================================================================
// Apply
// ============================================================================

fn apply(task: &mut Task, pending: Pending) {
    match pending {
        Pending::Title(v) => task.title = v,
        Pending::Goal(v) => task.goal = v,
        Pending::Issues(v) => task.issues = v,
        Pending::Hints(v) => task.task_hints = v,
        Pending::References(v) => task.knowledge_refs = v,
        Pending::PlanDescription { plan_id, value } => {
            if let Some(plan) = task.find_plan_mut(&plan_id) {
                plan.description = value;
            }
        }
        Pending::StepDescription { step_id, value } => {
            for plan in &mut task.overall_plan {
                if let Some(step) = plan.find_step_mut(&step_id) {
                    step.description = value;
                    break;
                }
            }
        }
        Pending::EvrTitle { evr_id, value } => {
            if let Some(evr) = task.find_evr_mut(&evr_id) {
                evr.title = value;
            }
        }
        Pending::EvrVerify { evr_id, value } => {
            if let Some(evr) = task.find_evr_mut(&evr_id) {
                evr.verify = value;
            }
        }
        Pending::EvrExpect { evr_id, value } => {
            if let Some(evr) = task.find_evr_mut(&evr_id) {
                evr.expect = value;
            }
        }
        Pending::PlanStatus { plan_id, value } => {
            if let Some(plan) = task.find_plan_mut(&plan_id) {
                plan.status = value;
            }
        }
        Pending::StepStatus { step_id, value } => {
            for plan in &mut task.overall_plan {
                if let Some(step) = plan.find_step_mut(&step_id) {
                    step.status = value;
                    break;
                }
            }
        }
        Pending::EvrStatus { evr_id, value } => {
            if let Some(evr) = task.find_evr_mut(&evr_id) {
                evr.status = value;
            }
        }
    }
}
