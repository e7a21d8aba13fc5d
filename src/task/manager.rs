//! Task orchestration
//!
//! Every operation follows the same sequence under the task's write lock:
//! lazy sync with the panel, the requested mutation, completion gates,
//! versioned JSON persist, panel render, release. Sync failures never
//! block the mutation; version conflicts are retried with a fresh read.

use super::models::*;
use crate::concurrency::{AcquireOptions, LockManager, LockType, StateVersionStore};
use crate::error::{Result, WaveError};
use crate::evr::{Evr, EvrStatus, EvrValidator, RunBy, VerificationRun};
use crate::fsio;
use crate::panel::{body_etag, split_front_matter, PanelParser, PanelRenderer, PanelTemplate};
use crate::sync::{LazySynchronizer, SyncResult};
use crate::EngineConfig;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

const TASK_FILE: &str = "current-task.json";
const PANEL_FILE: &str = "current-task.md";
const LOGS_HIGHLIGHT_LIMIT: usize = 10;

/// Orchestrates task operations for one project's `.wave/` directory.
#[derive(Debug)]
pub struct TaskManager {
    docs_dir: PathBuf,
    config: EngineConfig,
    locks: Arc<LockManager>,
    versions: Arc<StateVersionStore>,
    renderer: PanelRenderer,
    parser: PanelParser,
    validator: EvrValidator,
    sync: LazySynchronizer,
}

impl TaskManager {
    /// Open a manager over `docs_dir`, loading the panel template override
    /// when one exists.
    pub async fn open(docs_dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let docs_dir = docs_dir.into();
        tokio::fs::create_dir_all(&docs_dir)
            .await
            .map_err(|e| WaveError::fs(docs_dir.display().to_string(), e))?;

        let template = match fsio::read_json_opt::<PanelTemplate>(
            &docs_dir.join("templates/panel.json"),
        )
        .await
        {
            Ok(Some(t)) => t,
            Ok(None) => PanelTemplate::default(),
            Err(e) => {
                tracing::warn!(error = %e, "panel template unreadable, using defaults");
                PanelTemplate::default()
            }
        };

        let locks = Arc::new(LockManager::new(docs_dir.join(".locks")));
        let versions = Arc::new(StateVersionStore::new(docs_dir.join(".state")));
        Ok(Self {
            renderer: PanelRenderer::new(template.clone(), config.front_matter),
            parser: PanelParser::new(template),
            validator: EvrValidator::new(),
            sync: LazySynchronizer::new(),
            locks,
            versions,
            docs_dir,
            config,
        })
    }

    /// Swap in a lock manager with a custom process identity (tests).
    pub fn with_lock_manager(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn docs_dir(&self) -> &PathBuf {
        &self.docs_dir
    }

    fn task_path(&self) -> PathBuf {
        self.docs_dir.join(TASK_FILE)
    }

    fn panel_path(&self) -> PathBuf {
        self.docs_dir.join(PANEL_FILE)
    }

    fn history_path(&self, task_id: &str) -> PathBuf {
        self.docs_dir.join("history").join(format!("{}.json", task_id))
    }

    fn slug_index_path(&self, slug: &str) -> PathBuf {
        self.docs_dir
            .join("tasks/views/by-slug")
            .join(format!("{}.json", slug))
    }

    fn acquire_opts(&self, cancel: Option<CancellationToken>) -> AcquireOptions {
        AcquireOptions {
            timeout_ms: self.config.lock_timeout_ms,
            retry_interval: std::time::Duration::from_millis(self.config.retry_interval_ms),
            max_retries: None,
            ttl_ms: self.config.lock_ttl_ms,
            cancel,
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create the current task for this project.
    ///
    /// An already-active task is handed over: archived as-is, then
    /// replaced. Plans are numbered `plan-1..plan-N` in input order; the
    /// first plan starts `in_progress`.
    pub async fn init_task(
        &self,
        params: InitTaskParams,
        cancel: Option<CancellationToken>,
    ) -> Result<InitTaskResult> {
        params.validate()?;
        ensure_live(&cancel)?;

        // Hand over any active task before replacing it
        if let Some((mut previous, version)) = self.try_load().await? {
            let lock = self
                .locks
                .acquire(&previous.id.clone(), LockType::Write, &self.acquire_opts(cancel.clone()))
                .await?;
            let outcome = async {
                previous.push_log(LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Task,
                    LogAction::Handover,
                    "Task handed over before a new init",
                ));
                self.persist(&mut previous, version).await?;
                self.archive(&previous).await?;
                self.remove_current_files().await
            }
            .await;
            self.locks.release(&lock).await.ok();
            outcome?;
        }

        let now = Utc::now();
        let plan_descriptions = params.overall_plan.clone().unwrap_or_default();
        let mut plans: Vec<Plan> = plan_descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| Plan::new(format!("plan-{}", i + 1), d.trim()))
            .collect();
        if let Some(first) = plans.first_mut() {
            first.status = ItemStatus::InProgress;
        }
        let plan_ids: Vec<String> = plans.iter().map(|p| p.id.clone()).collect();
        let current_plan_id = plan_ids.first().cloned();

        let mut task = Task {
            id: Ulid::new().to_string(),
            slug: task_slug(&params.title),
            title: params.title.trim().to_string(),
            story: params.story,
            goal: params.goal,
            issues: Vec::new(),
            knowledge_refs: params.knowledge_refs.unwrap_or_default(),
            task_hints: Vec::new(),
            overall_plan: plans,
            current_plan_id: current_plan_id.clone(),
            expected_results: Vec::new(),
            logs: Vec::new(),
            md_version: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        task.push_log(
            LogEntry::new(
                LogLevel::Info,
                LogCategory::Task,
                LogAction::Create,
                format!("Task created: {}", task.title),
            )
            .with_details(
                serde_json::json!({ "plan_count": plan_ids.len() }),
                self.config.log_detail_budget,
            ),
        );

        let lock = self
            .locks
            .acquire(&task.id.clone(), LockType::Write, &self.acquire_opts(cancel))
            .await?;
        let persisted = self.persist(&mut task, 0).await;
        self.locks.release(&lock).await.ok();
        persisted?;

        tracing::info!(task_id = %task.id, slug = %task.slug, "task initialized");
        Ok(InitTaskResult {
            task_id: task.id,
            slug: task.slug,
            current_plan_id,
            plan_required: plan_ids.is_empty(),
            plan_ids,
        })
    }

    /// Update a plan, step, or EVR status.
    pub async fn update_task_status(
        &self,
        params: UpdateParams,
        cancel: Option<CancellationToken>,
    ) -> Result<UpdateResult> {
        let task_id = self.peek_task_id().await?;
        let lock = self
            .locks
            .acquire(&task_id, LockType::Write, &self.acquire_opts(cancel.clone()))
            .await?;
        let outcome = self.update_inner(params, &cancel).await;
        self.locks.release(&lock).await.ok();
        outcome
    }

    async fn update_inner(
        &self,
        params: UpdateParams,
        cancel: &Option<CancellationToken>,
    ) -> Result<UpdateResult> {
        let (mut task, version) = self.load().await?;
        let sync_result = self.run_sync(&mut task).await;
        ensure_live(cancel)?;

        let mut result = match params.update_type {
            UpdateType::Plan => self.update_plan(&mut task, &params)?,
            UpdateType::Step => self.update_step(&mut task, &params)?,
            UpdateType::Evr => self.update_evr(&mut task, &params)?,
        };
        if !sync_result.is_empty() {
            result.sync_preview = Some(sync_result.preview());
        }

        ensure_live(cancel)?;
        self.persist(&mut task, version).await?;
        Ok(result)
    }

    fn update_plan(&self, task: &mut Task, params: &UpdateParams) -> Result<UpdateResult> {
        let plan_id = params
            .plan_id
            .clone()
            .or_else(|| task.current_plan_id.clone())
            .ok_or_else(|| WaveError::Validation("plan_id is required".into()))?;
        let status = params
            .status
            .ok_or_else(|| WaveError::Validation("status is required for plan updates".into()))?;

        let plan = task
            .find_plan(&plan_id)
            .ok_or_else(|| WaveError::NotFound {
                entity: "plan",
                id: plan_id.clone(),
            })?;
        let previous = plan.status;

        if previous == ItemStatus::Blocked && status == ItemStatus::Completed {
            return Err(WaveError::IllegalTransition {
                entity: "plan",
                id: plan_id,
                from: previous.to_string(),
                to: status.to_string(),
            });
        }

        let mut result = UpdateResult {
            success: true,
            ..Default::default()
        };

        if status == ItemStatus::Completed {
            if params.notes.as_deref().map_or(true, |n| n.trim().is_empty()) {
                return Err(WaveError::Validation(
                    "completing a plan requires non-empty notes".into(),
                ));
            }
            let gate = self
                .validator
                .check_plan_gate(&plan.evr_bindings.clone(), &task.expected_results);
            if !gate.can_complete {
                result.hints = plan.hints.clone();
                task.push_log(LogEntry::new(
                    LogLevel::Warn,
                    LogCategory::Plan,
                    LogAction::GateBlocked,
                    format!("Plan {} blocked by pending verifications", plan_id),
                ));
                result.success = false;
                result.evr_pending = true;
                result.evr_for_plan = gate.pending_evrs;
                return Ok(result);
            }
        }

        let plan = task.find_plan_mut(&plan_id).expect("checked above");
        plan.status = status;
        if let Some(evidence) = &params.evidence {
            plan.evidence = Some(evidence.clone());
        }
        if let Some(notes) = &params.notes {
            plan.notes = Some(notes.clone());
        }

        match status {
            ItemStatus::Completed => {
                plan.completed_at = Some(Utc::now());
                task.push_log(LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Plan,
                    LogAction::Update,
                    format!("Plan {} completed", plan_id),
                ));
                if let Some(next_id) = advance_plan(task) {
                    task.push_log(LogEntry::new(
                        LogLevel::Info,
                        LogCategory::Plan,
                        LogAction::AutoAdvance,
                        format!("Plan {} started", next_id),
                    ));
                    result.auto_advanced = true;
                    result.started_new_plan = Some(next_id.clone());
                    result.evr_for_node = task
                        .find_plan(&next_id)
                        .map(|p| p.evr_bindings.clone())
                        .unwrap_or_default();
                } else {
                    task.current_plan_id = None;
                }
            }
            ItemStatus::InProgress => {
                task.current_plan_id = Some(plan_id.clone());
                let plan = task.find_plan(&plan_id).expect("checked above");
                result.steps_required = plan.steps.is_empty();
                result.evr_for_node = plan.evr_bindings.clone();
                task.push_log(LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Plan,
                    LogAction::Update,
                    format!("Plan {} started", plan_id),
                ));
            }
            _ => {
                task.push_log(LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Plan,
                    LogAction::Update,
                    format!("Plan {} -> {}", plan_id, status),
                ));
            }
        }

        // Surface guidance for the plan now in focus: the auto-advanced
        // plan when one started, the updated plan otherwise.
        let focus = result.started_new_plan.as_deref().unwrap_or(&plan_id);
        result.hints = task
            .find_plan(focus)
            .map(|p| p.hints.clone())
            .unwrap_or_default();
        Ok(result)
    }

    fn update_step(&self, task: &mut Task, params: &UpdateParams) -> Result<UpdateResult> {
        let step_id = params
            .step_id
            .clone()
            .ok_or_else(|| WaveError::Validation("step_id is required".into()))?;
        let status = params
            .status
            .ok_or_else(|| WaveError::Validation("status is required for step updates".into()))?;

        let plan_id = task
            .plan_of_step(&step_id)
            .map(|p| p.id.clone())
            .ok_or_else(|| WaveError::NotFound {
                entity: "step",
                id: step_id.clone(),
            })?;

        let mut result = UpdateResult {
            success: true,
            ..Default::default()
        };

        let plan = task.find_plan_mut(&plan_id).expect("parent resolved");
        let step = plan.find_step_mut(&step_id).expect("parent resolved");
        step.status = status;
        if let Some(evidence) = &params.evidence {
            step.evidence = Some(evidence.clone());
        }
        if let Some(notes) = &params.notes {
            step.notes = Some(notes.clone());
        }

        if status == ItemStatus::Completed {
            step.completed_at = Some(Utc::now());

            if let Some(next) = plan.steps.iter_mut().find(|s| s.status == ItemStatus::ToDo) {
                next.status = ItemStatus::InProgress;
                result.next_step = Some(next.id.clone());
                let next_id = next.id.clone();
                task.push_log(LogEntry::new(
                    LogLevel::Info,
                    LogCategory::Step,
                    LogAction::AutoAdvance,
                    format!("Step {} started", next_id),
                ));
            } else if plan.steps.iter().all(|s| s.status == ItemStatus::Completed) {
                // All steps done: complete the plan when its gate allows
                let bindings = plan.evr_bindings.clone();
                let gate = self
                    .validator
                    .check_plan_gate(&bindings, &task.expected_results);
                let plan = task.find_plan_mut(&plan_id).expect("parent resolved");
                if gate.can_complete {
                    plan.status = ItemStatus::Completed;
                    plan.completed_at = Some(Utc::now());
                    task.push_log(LogEntry::new(
                        LogLevel::Info,
                        LogCategory::Plan,
                        LogAction::Update,
                        format!("Plan {} completed (all steps done)", plan_id),
                    ));
                    if let Some(next_id) = advance_plan(task) {
                        task.push_log(LogEntry::new(
                            LogLevel::Info,
                            LogCategory::Plan,
                            LogAction::AutoAdvance,
                            format!("Plan {} started", next_id),
                        ));
                        result.auto_advanced = true;
                        result.started_new_plan = Some(next_id);
                    } else {
                        task.current_plan_id = None;
                    }
                } else {
                    result.evr_pending = true;
                    result.evr_for_plan = gate.pending_evrs;
                    task.push_log(LogEntry::new(
                        LogLevel::Warn,
                        LogCategory::Plan,
                        LogAction::GateBlocked,
                        format!("Plan {} awaiting verifications after final step", plan_id),
                    ));
                }
            }
        } else {
            task.push_log(LogEntry::new(
                LogLevel::Info,
                LogCategory::Step,
                LogAction::Update,
                format!("Step {} -> {}", step_id, status),
            ));
        }

        if result.next_step.is_none() {
            result.next_step = Some(step_id);
        }
        // Hints travel with the step now in focus
        if let Some(next_id) = result.next_step.clone() {
            if let Some(step) = task
                .plan_of_step(&next_id)
                .and_then(|p| p.find_step(&next_id))
            {
                result.hints = step.hints.clone();
            }
        }
        Ok(result)
    }

    fn update_evr(&self, task: &mut Task, params: &UpdateParams) -> Result<UpdateResult> {
        let reports = params
            .evr
            .as_ref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| WaveError::Validation("evr items are required".into()))?;

        for report in reports {
            // Unknown ids are created in place so runs can be recorded
            // before the panel defines them.
            if task.find_evr(&report.evr_id).is_none() {
                task.expected_results
                    .push(Evr::new(report.evr_id.clone(), report.evr_id.clone()));
            }
            let run = VerificationRun {
                at: Utc::now(),
                by: report.by.unwrap_or(RunBy::Ai),
                status: report.status,
                notes: report.notes.clone(),
                proof: report.proof.clone(),
            };
            let evr = task.find_evr_mut(&report.evr_id).expect("created above");
            self.validator.track_run(evr, run);

            let (level, action, verb) = match report.status {
                EvrStatus::Pass => (LogLevel::Info, LogAction::Verified, "VERIFIED"),
                EvrStatus::Fail => (LogLevel::Warn, LogAction::Failed, "FAILED"),
                _ => (LogLevel::Info, LogAction::Test, "TEST"),
            };
            task.push_log(LogEntry::new(
                level,
                LogCategory::Evr,
                action,
                format!("{} {}", verb, report.evr_id),
            ));
        }

        task.push_log(
            LogEntry::new(
                LogLevel::Info,
                LogCategory::Evr,
                LogAction::Update,
                format!("Recorded {} verification runs", reports.len()),
            )
            .with_details(
                serde_json::json!({
                    "evr_ids": reports.iter().map(|r| r.evr_id.clone()).collect::<Vec<_>>()
                }),
                self.config.log_detail_budget,
            ),
        );

        Ok(UpdateResult {
            success: true,
            hints: task.task_hints.clone(),
            ..Default::default()
        })
    }

    /// Replace a task field wholesale.
    pub async fn modify_task(
        &self,
        params: ModifyParams,
        cancel: Option<CancellationToken>,
    ) -> Result<ModifyResult> {
        if params.reason.trim().is_empty() {
            return Err(WaveError::Validation("reason is required".into()));
        }
        let task_id = self.peek_task_id().await?;
        let lock = self
            .locks
            .acquire(&task_id, LockType::Write, &self.acquire_opts(cancel.clone()))
            .await?;
        let outcome = self.modify_inner(params, &cancel).await;
        self.locks.release(&lock).await.ok();
        outcome
    }

    async fn modify_inner(
        &self,
        params: ModifyParams,
        cancel: &Option<CancellationToken>,
    ) -> Result<ModifyResult> {
        let (mut task, version) = self.load().await?;
        let _ = self.run_sync(&mut task).await;
        ensure_live(cancel)?;

        let mut result = ModifyResult {
            success: true,
            ..Default::default()
        };

        match params.field {
            ModifyField::Goal => {
                let goal: String = content_as(&params, "goal")?;
                let len = goal.chars().count();
                if !(GOAL_MIN..=GOAL_MAX).contains(&len) {
                    return Err(WaveError::Validation(format!(
                        "goal must be {}-{} characters",
                        GOAL_MIN, GOAL_MAX
                    )));
                }
                task.goal = goal;
                result.affected_ids.push("goal".into());
            }
            ModifyField::Plan => {
                let descriptions: Vec<String> = content_as(&params, "plan")?;
                if descriptions.len() > PLANS_MAX {
                    return Err(WaveError::Validation(format!(
                        "at most {} plans allowed",
                        PLANS_MAX
                    )));
                }
                if descriptions
                    .iter()
                    .any(|d| d.trim().is_empty() || d.chars().count() > PLAN_DESCRIPTION_MAX)
                {
                    return Err(WaveError::Validation(format!(
                        "plan descriptions must be 1-{} characters",
                        PLAN_DESCRIPTION_MAX
                    )));
                }
                let mut plans: Vec<Plan> = descriptions
                    .iter()
                    .enumerate()
                    .map(|(i, d)| Plan::new(format!("plan-{}", i + 1), d.trim()))
                    .collect();
                if let Some(first) = plans.first_mut() {
                    first.status = ItemStatus::InProgress;
                }
                result.affected_ids = plans.iter().map(|p| p.id.clone()).collect();
                task.current_plan_id = plans.first().map(|p| p.id.clone());
                task.overall_plan = plans;
            }
            ModifyField::Steps => {
                let plan_id = params
                    .plan_id
                    .clone()
                    .ok_or_else(|| WaveError::Validation("plan_id is required for steps".into()))?;
                let descriptions: Vec<String> = content_as(&params, "steps")?;
                let plan = task
                    .find_plan_mut(&plan_id)
                    .ok_or_else(|| WaveError::NotFound {
                        entity: "plan",
                        id: plan_id.clone(),
                    })?;
                let had_steps = !plan.steps.is_empty();
                let mut steps: Vec<Step> =
                    descriptions.iter().map(|d| Step::new(d.as_str())).collect();
                if !had_steps {
                    if let Some(first) = steps.first_mut() {
                        first.status = ItemStatus::InProgress;
                    }
                }
                result.affected_ids = steps.iter().map(|s| s.id.clone()).collect();
                plan.steps = steps;
            }
            ModifyField::Hints => {
                let hints: Vec<String> = content_as(&params, "hints")?;
                if let Some(step_id) = &params.step_id {
                    let plan_id = task
                        .plan_of_step(step_id)
                        .map(|p| p.id.clone())
                        .ok_or_else(|| WaveError::NotFound {
                            entity: "step",
                            id: step_id.clone(),
                        })?;
                    let plan = task.find_plan_mut(&plan_id).expect("parent resolved");
                    let step = plan.find_step_mut(step_id).expect("parent resolved");
                    step.hints = hints;
                    result.affected_ids.push(step_id.clone());
                } else if let Some(plan_id) = &params.plan_id {
                    let plan = task
                        .find_plan_mut(plan_id)
                        .ok_or_else(|| WaveError::NotFound {
                            entity: "plan",
                            id: plan_id.clone(),
                        })?;
                    plan.hints = hints;
                    result.affected_ids.push(plan_id.clone());
                } else {
                    task.task_hints = hints;
                    result.affected_ids.push("task_hints".into());
                }
            }
            ModifyField::Evr => {
                let spec = params
                    .evr
                    .clone()
                    .ok_or_else(|| WaveError::Validation("evr payload is required".into()))?;
                self.modify_evrs(&mut task, spec, &mut result)?;
            }
        }

        task.push_log(
            LogEntry::new(
                LogLevel::Info,
                LogCategory::Task,
                LogAction::Modify,
                format!("Modified {:?}: {}", params.field, params.reason),
            )
            .with_details(
                serde_json::json!({
                    "change_type": params.change_type,
                    "affected": result.affected_ids,
                }),
                self.config.log_detail_budget,
            ),
        );

        result.current_plan_id = task.current_plan_id.clone();
        ensure_live(cancel)?;
        self.persist(&mut task, version).await?;
        Ok(result)
    }

    fn modify_evrs(
        &self,
        task: &mut Task,
        spec: EvrModify,
        result: &mut ModifyResult,
    ) -> Result<()> {
        for item in spec.items {
            match &item.evr_id {
                Some(id) => {
                    let evr = task.find_evr_mut(id).ok_or_else(|| WaveError::NotFound {
                        entity: "evr",
                        id: id.clone(),
                    })?;
                    if let Some(title) = item.title {
                        evr.title = title;
                    }
                    if let Some(verify) = item.verify {
                        evr.verify = verify;
                    }
                    if let Some(expect) = item.expect {
                        evr.expect = expect;
                    }
                    if let Some(class) = item.class {
                        evr.class = Some(class);
                    }
                    let id = id.clone();
                    self.bind_evr(task, &id, item.bind_to.unwrap_or_default());
                    result.affected_ids.push(id);
                }
                None => {
                    let title = item
                        .title
                        .clone()
                        .ok_or_else(|| WaveError::Validation("new evr needs a title".into()))?;
                    let mut id = evr_anchor(&title);
                    let mut n = 2;
                    while task.find_evr(&id).is_some() {
                        id = format!("{}-{}", evr_anchor(&title), n);
                        n += 1;
                    }
                    let mut evr = Evr::new(id.clone(), title);
                    evr.verify = item.verify.unwrap_or_default();
                    evr.expect = item.expect.unwrap_or_default();
                    evr.class = item.class;
                    task.expected_results.push(evr);
                    self.bind_evr(task, &id, item.bind_to.unwrap_or_default());
                    result.affected_ids.push(id);
                }
            }
        }

        for id in spec.remove {
            let before = task.expected_results.len();
            task.expected_results.retain(|e| e.id != id);
            if task.expected_results.len() == before {
                return Err(WaveError::NotFound {
                    entity: "evr",
                    id,
                });
            }
            // Unbind everywhere
            for plan in &mut task.overall_plan {
                plan.evr_bindings.retain(|b| b != &id);
            }
            result.affected_ids.push(id);
        }
        Ok(())
    }

    fn bind_evr(&self, task: &mut Task, evr_id: &str, plan_ids: Vec<String>) {
        for plan_id in plan_ids {
            if let Some(plan) = task.find_plan_mut(&plan_id) {
                if !plan.evr_bindings.iter().any(|b| b == evr_id) {
                    plan.evr_bindings.push(evr_id.to_string());
                }
            }
            if let Some(evr) = task.find_evr_mut(evr_id) {
                if !evr.referenced_by.iter().any(|p| p == &plan_id) {
                    evr.referenced_by.push(plan_id);
                }
            }
        }
    }

    /// Complete and archive the current task.
    ///
    /// Archive-then-delete is a two-phase commit: the history copy must be
    /// written before the live JSON and panel are removed, so an archive
    /// failure leaves the task active.
    pub async fn complete_task(
        &self,
        summary: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<CompleteResult> {
        let task_id = self.peek_task_id().await?;
        let lock = self
            .locks
            .acquire(&task_id, LockType::Write, &self.acquire_opts(cancel.clone()))
            .await?;
        let outcome = self.complete_inner(summary, &cancel).await;
        self.locks.release(&lock).await.ok();
        outcome
    }

    async fn complete_inner(
        &self,
        summary: &str,
        cancel: &Option<CancellationToken>,
    ) -> Result<CompleteResult> {
        let (mut task, version) = self.load().await?;
        let _ = self.run_sync(&mut task).await;
        ensure_live(cancel)?;

        let gate = self
            .validator
            .check_task_completion(&task.expected_results, completion_window(&task));
        if !gate.can_complete {
            return Err(WaveError::EvrNotReady {
                required_final: gate.required_final,
            });
        }

        task.completed_at = Some(Utc::now());
        task.push_log(LogEntry::new(
            LogLevel::Info,
            LogCategory::Task,
            LogAction::Complete,
            if summary.trim().is_empty() {
                "Task completed".to_string()
            } else {
                format!("Task completed: {}", summary)
            },
        ));

        ensure_live(cancel)?;
        self.persist(&mut task, version).await?;
        self.archive(&task).await?;
        self.remove_current_files().await?;

        tracing::info!(task_id = %task.id, "task completed and archived");
        Ok(CompleteResult {
            archived_task_id: task.id,
            evr_summary: gate.summary,
            evr_ready: true,
        })
    }

    /// Read the current task, folding in any pending panel edits first.
    pub async fn get_current_task(
        &self,
        cancel: Option<CancellationToken>,
    ) -> Result<TaskReadView> {
        let task_id = self.peek_task_id().await?;
        let lock = self
            .locks
            .acquire(&task_id, LockType::Write, &self.acquire_opts(cancel.clone()))
            .await?;
        let outcome = self.read_inner(&cancel).await;
        self.locks.release(&lock).await.ok();
        outcome
    }

    async fn read_inner(&self, cancel: &Option<CancellationToken>) -> Result<TaskReadView> {
        let (mut task, version) = self.load().await?;
        let sync_result = self.run_sync(&mut task).await;
        ensure_live(cancel)?;

        if sync_result.applied {
            self.persist(&mut task, version).await?;
            // Re-read so the view reflects exactly what landed on disk
            let (reloaded, _) = self.load().await?;
            task = reloaded;
        }

        let summary = self.validator.summary(&task.expected_results);
        let gate = self
            .validator
            .check_task_completion(&task.expected_results, completion_window(&task));

        let panel_pending = match tokio::fs::read_to_string(self.panel_path()).await {
            Ok(text) => {
                let (_, body) = split_front_matter(&text);
                task.md_version.as_deref() != Some(body_etag(body).as_str())
            }
            Err(_) => false,
        };

        let logs_full_count = task.logs.len();
        let logs_highlights: Vec<LogEntry> = task
            .logs
            .iter()
            .rev()
            .filter(|l| l.action.is_highlight())
            .take(LOGS_HIGHLIGHT_LIMIT)
            .cloned()
            .collect();

        Ok(TaskReadView {
            md_version: task.md_version.clone(),
            evr_summary: summary,
            evr_required_final: gate.required_final,
            sync_preview: (!sync_result.is_empty()).then(|| sync_result.preview()),
            logs_highlights,
            logs_full_count,
            panel_pending,
            task,
        })
    }

    // ========================================================================
    // Persistence plumbing
    // ========================================================================

    async fn peek_task_id(&self) -> Result<String> {
        let value = fsio::read_json_opt::<serde_json::Value>(&self.task_path())
            .await?
            .ok_or(WaveError::NoActiveTask)?;
        value["id"]
            .as_str()
            .map(String::from)
            .ok_or(WaveError::NoActiveTask)
    }

    async fn try_load(&self) -> Result<Option<(Task, u64)>> {
        let path = self.task_path();
        let Some(value) = fsio::read_json_opt::<serde_json::Value>(&path).await? else {
            return Ok(None);
        };
        let task: Task = serde_json::from_value(value)
            .map_err(|e| WaveError::Parse(format!("{}: {}", path.display(), e)))?;
        let version = self.versions.current_version(&task.id).await;
        Ok(Some((task, version)))
    }

    async fn load(&self) -> Result<(Task, u64)> {
        self.try_load().await?.ok_or(WaveError::NoActiveTask)
    }

    /// Lazy sync against the panel file; failures are captured, never raised.
    async fn run_sync(&self, task: &mut Task) -> SyncResult {
        let panel_path = self.panel_path();
        let text = match tokio::fs::read_to_string(&panel_path).await {
            Ok(t) => Some(t),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(error = %e, "panel unreadable, skipping sync");
                return SyncResult {
                    error: Some(e.to_string()),
                    ..SyncResult::default()
                };
            }
        };
        let mtime: Option<DateTime<Utc>> = match tokio::fs::metadata(&panel_path).await {
            Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
            Err(_) => None,
        };
        let doc = text.map(|t| self.parser.parse(&t));
        self.sync.sync(task, doc.as_ref(), mtime)
    }

    /// Persist phase: bump `updated_at`, render, versioned JSON write
    /// (retried on conflict with a fresh counter), then the panel file.
    async fn persist(&self, task: &mut Task, expected_version: u64) -> Result<u64> {
        task.touch();
        let rendered = self.renderer.render(task);
        task.md_version = Some(rendered.md_version.clone());

        let mut expected = expected_version;
        for attempt in 0..=self.config.write_retries {
            let outcome = self
                .versions
                .atomic_write(&self.task_path(), task, &task.id, expected)
                .await?;
            if outcome.success {
                fsio::write_atomic(self.panel_path().as_path(), rendered.text.as_bytes()).await?;
                return Ok(outcome.version);
            }
            tracing::warn!(
                task_id = %task.id,
                attempt,
                expected,
                found = outcome.version,
                "versioned write conflicted, retrying with fresh counter"
            );
            expected = outcome.version;
        }
        Err(WaveError::VersionConflict {
            task_id: task.id.clone(),
            expected,
            found: self.versions.current_version(&task.id).await,
        })
    }

    async fn archive(&self, task: &Task) -> Result<()> {
        fsio::write_json_atomic(&self.history_path(&task.id), task).await?;
        fsio::write_json_atomic(
            &self.slug_index_path(&task.slug),
            &serde_json::json!({
                "task_id": task.id,
                "archived_at": Utc::now().to_rfc3339(),
            }),
        )
        .await?;
        task_log_archive(task);
        Ok(())
    }

    async fn remove_current_files(&self) -> Result<()> {
        for path in [self.task_path(), self.panel_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(WaveError::fs(path.display().to_string(), e)),
            }
        }
        Ok(())
    }
}

fn task_log_archive(task: &Task) {
    tracing::debug!(task_id = %task.id, slug = %task.slug, "task archived");
}

/// Start of the completion window: the newest plan completion. Runtime
/// EVR runs older than this must be repeated before the task completes.
fn completion_window(task: &Task) -> Option<DateTime<Utc>> {
    task.overall_plan.iter().filter_map(|p| p.completed_at).max()
}

/// Mark the next `to_do` plan in progress and point `current_plan_id` at it.
fn advance_plan(task: &mut Task) -> Option<String> {
    let next = task
        .overall_plan
        .iter_mut()
        .find(|p| p.status == ItemStatus::ToDo)?;
    next.status = ItemStatus::InProgress;
    let id = next.id.clone();
    task.current_plan_id = Some(id.clone());
    Some(id)
}

fn ensure_live(cancel: &Option<CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(WaveError::Cancelled),
        _ => Ok(()),
    }
}

/// Decode the `content` payload of a modify call into the shape the field
/// expects.
fn content_as<T: serde::de::DeserializeOwned>(params: &ModifyParams, field: &str) -> Result<T> {
    let content = params
        .content
        .clone()
        .ok_or_else(|| WaveError::Validation(format!("content is required for {}", field)))?;
    serde_json::from_value(content)
        .map_err(|e| WaveError::Validation(format!("bad content shape for {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(dir: &std::path::Path) -> TaskManager {
        TaskManager::open(dir.join(".wave"), EngineConfig::default())
            .await
            .unwrap()
    }

    fn init_params(plans: &[&str]) -> InitTaskParams {
        InitTaskParams {
            title: "Ship widget".into(),
            goal: "Implement the widget end to end".into(),
            overall_plan: Some(plans.iter().map(|s| s.to_string()).collect()),
            knowledge_refs: None,
            story: None,
        }
    }

    #[tokio::test]
    async fn test_init_creates_state_and_panel() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;

        let result = m.init_task(init_params(&["design", "build"]), None).await.unwrap();
        assert_eq!(result.plan_ids, vec!["plan-1", "plan-2"]);
        assert_eq!(result.current_plan_id.as_deref(), Some("plan-1"));
        assert!(!result.plan_required);

        assert!(m.task_path().exists());
        assert!(m.panel_path().exists());
        let panel = std::fs::read_to_string(m.panel_path()).unwrap();
        assert!(panel.contains("1. [-] design <!-- plan:plan-1 -->"));
        assert!(panel.contains("2. [ ] build <!-- plan:plan-2 -->"));
    }

    #[tokio::test]
    async fn test_init_without_plans_flags_plan_required() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let mut params = init_params(&[]);
        params.overall_plan = None;
        let result = m.init_task(params, None).await.unwrap();
        assert!(result.plan_required);
        assert!(result.current_plan_id.is_none());
    }

    #[tokio::test]
    async fn test_plan_completion_requires_notes() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design"]), None).await.unwrap();

        let err = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Plan,
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                    status: Some(ItemStatus::Completed),
                    evidence: None,
                    notes: None,
                    evr: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::Validation(_)));
    }

    #[tokio::test]
    async fn test_blocked_plan_cannot_complete() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design"]), None).await.unwrap();

        m.update_task_status(
            UpdateParams {
                update_type: UpdateType::Plan,
                plan_id: Some("plan-1".into()),
                step_id: None,
                status: Some(ItemStatus::Blocked),
                evidence: None,
                notes: None,
                evr: None,
            },
            None,
        )
        .await
        .unwrap();

        let err = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Plan,
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                    status: Some(ItemStatus::Completed),
                    evidence: None,
                    notes: Some("done".into()),
                    evr: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_step_completion_advances_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design"]), None).await.unwrap();

        let modified = m
            .modify_task(
                ModifyParams {
                    field: ModifyField::Steps,
                    content: Some(serde_json::json!(["draft", "review"])),
                    evr: None,
                    reason: "plan the work".into(),
                    change_type: "scope".into(),
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                },
                None,
            )
            .await
            .unwrap();
        let first_step = modified.affected_ids[0].clone();
        let second_step = modified.affected_ids[1].clone();

        let result = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Step,
                    plan_id: None,
                    step_id: Some(first_step),
                    status: Some(ItemStatus::Completed),
                    evidence: None,
                    notes: None,
                    evr: None,
                },
                None,
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.next_step.as_deref(), Some(second_step.as_str()));

        let view = m.get_current_task(None).await.unwrap();
        let plan = &view.task.overall_plan[0];
        assert_eq!(plan.steps[0].status, ItemStatus::Completed);
        assert_eq!(plan.steps[1].status, ItemStatus::InProgress);
    }

    #[tokio::test]
    async fn test_evr_run_created_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design"]), None).await.unwrap();

        m.update_task_status(
            UpdateParams {
                update_type: UpdateType::Evr,
                plan_id: None,
                step_id: None,
                status: None,
                evidence: None,
                notes: None,
                evr: Some(vec![EvrRunReport {
                    evr_id: "evr-smoke".into(),
                    status: EvrStatus::Pass,
                    by: Some(RunBy::Ci),
                    notes: Some("green".into()),
                    proof: None,
                }]),
            },
            None,
        )
        .await
        .unwrap();

        let view = m.get_current_task(None).await.unwrap();
        let evr = view.task.find_evr("evr-smoke").unwrap();
        assert_eq!(evr.status, EvrStatus::Pass);
        assert_eq!(evr.runs.len(), 1);
        assert!(view
            .logs_highlights
            .iter()
            .any(|l| l.message.contains("VERIFIED evr-smoke")));
    }

    #[tokio::test]
    async fn test_update_surfaces_target_hints() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design", "build"]), None).await.unwrap();

        m.modify_task(
            ModifyParams {
                field: ModifyField::Hints,
                content: Some(serde_json::json!(["start with the schema"])),
                evr: None,
                reason: "guidance".into(),
                change_type: "scope".into(),
                plan_id: Some("plan-1".into()),
                step_id: None,
            },
            None,
        )
        .await
        .unwrap();

        let result = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Plan,
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                    status: Some(ItemStatus::InProgress),
                    evidence: None,
                    notes: None,
                    evr: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.hints, vec!["start with the schema"]);

        // Completing hands focus (and hints) to the auto-advanced plan
        m.modify_task(
            ModifyParams {
                field: ModifyField::Hints,
                content: Some(serde_json::json!(["reuse the design notes"])),
                evr: None,
                reason: "guidance".into(),
                change_type: "scope".into(),
                plan_id: Some("plan-2".into()),
                step_id: None,
            },
            None,
        )
        .await
        .unwrap();
        let result = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Plan,
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                    status: Some(ItemStatus::Completed),
                    evidence: None,
                    notes: Some("done".into()),
                    evr: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.started_new_plan.as_deref(), Some("plan-2"));
        assert_eq!(result.hints, vec!["reuse the design notes"]);
    }

    #[tokio::test]
    async fn test_modify_plan_resets_current_plan() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["old plan"]), None).await.unwrap();

        let result = m
            .modify_task(
                ModifyParams {
                    field: ModifyField::Plan,
                    content: Some(serde_json::json!(["one", "two", "three"])),
                    evr: None,
                    reason: "replan".into(),
                    change_type: "refinement".into(),
                    plan_id: None,
                    step_id: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.affected_ids, vec!["plan-1", "plan-2", "plan-3"]);
        assert_eq!(result.current_plan_id.as_deref(), Some("plan-1"));
    }

    #[tokio::test]
    async fn test_cancelled_operation_leaves_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        m.init_task(init_params(&["design"]), None).await.unwrap();
        let before = std::fs::read_to_string(m.task_path()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = m
            .update_task_status(
                UpdateParams {
                    update_type: UpdateType::Plan,
                    plan_id: Some("plan-1".into()),
                    step_id: None,
                    status: Some(ItemStatus::Blocked),
                    evidence: None,
                    notes: None,
                    evr: None,
                },
                Some(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaveError::Cancelled));
        let after = std::fs::read_to_string(m.task_path()).unwrap();
        assert_eq!(before, after);
        // Lock was released despite the cancellation
        assert!(!m.docs_dir.join(".locks").join(format!(
            "{}.lock",
            serde_json::from_str::<serde_json::Value>(&after).unwrap()["id"]
                .as_str()
                .unwrap()
        )).exists());
    }
}
