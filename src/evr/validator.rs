//! EVR state machine and completion gates

use super::models::*;
use crate::error::ErrorCode;
use chrono::{DateTime, Utc};

/// Validates EVR readiness and gates plan/task completion.
///
/// The validator records outcomes and reports requirements; it never
/// executes the verification commands themselves.
#[derive(Debug, Default)]
pub struct EvrValidator;

impl EvrValidator {
    pub fn new() -> Self {
        Self
    }

    /// Record a verification run: prepend to history and mirror the newest
    /// run onto the EVR's top-level fields.
    pub fn track_run(&self, evr: &mut Evr, run: VerificationRun) {
        evr.status = run.status;
        evr.last_run = Some(run.at);
        evr.notes = run.notes.clone();
        evr.proof = run.proof.clone();
        evr.runs.insert(0, run);
    }

    /// Readiness: pass, or skip with a recorded reason, and referenced by
    /// at least one plan.
    pub fn is_ready(&self, evr: &Evr) -> bool {
        let status_ok = match evr.status {
            EvrStatus::Pass => true,
            EvrStatus::Skip => evr.notes.as_deref().is_some_and(|n| !n.trim().is_empty()),
            _ => false,
        };
        status_ok && !evr.referenced_by.is_empty()
    }

    /// Whether this EVR needs a fresh run during the completion window.
    /// Static results pass once with proof recorded; runtime results are
    /// revalidated at completion.
    pub fn requires_final_run(&self, evr: &Evr) -> bool {
        match evr.class() {
            EvrClass::Static => !(evr.status == EvrStatus::Pass && evr.proof.is_some()),
            EvrClass::Runtime => true,
        }
    }

    /// Status breakdown over all EVRs.
    pub fn summary(&self, evrs: &[Evr]) -> EvrSummary {
        let mut summary = EvrSummary::default();
        for evr in evrs {
            match evr.status {
                EvrStatus::Pass => summary.passed.push(evr.id.clone()),
                EvrStatus::Fail => summary.failed.push(evr.id.clone()),
                EvrStatus::Skip => summary.skipped.push(evr.id.clone()),
                EvrStatus::Unknown => summary.unknown.push(evr.id.clone()),
            }
            if evr.referenced_by.is_empty() {
                summary.unreferenced.push(evr.id.clone());
            }
        }
        summary.total = summary.passed.len()
            + summary.failed.len()
            + summary.skipped.len()
            + summary.unknown.len();
        summary
    }

    /// Gate for one plan: every bound EVR must pass the readiness
    /// predicate. Bound ids with no matching EVR count as pending.
    pub fn check_plan_gate(&self, bound: &[String], evrs: &[Evr]) -> PlanGate {
        let pending: Vec<String> = bound
            .iter()
            .filter(|id| {
                evrs.iter()
                    .find(|e| &e.id == *id)
                    .map(|e| !self.is_ready(e))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        PlanGate {
            bound_evrs: bound.to_vec(),
            can_complete: pending.is_empty(),
            pending_evrs: pending,
        }
    }

    /// Gate for the whole task: per-EVR blocking reasons plus the summary.
    ///
    /// `window_start` marks the completion window; a passing runtime-class
    /// EVR whose newest run predates it must be revalidated before the
    /// task can complete. Static results that passed with proof are
    /// exempt via [`EvrValidator::requires_final_run`].
    pub fn check_task_completion(
        &self,
        evrs: &[Evr],
        window_start: Option<DateTime<Utc>>,
    ) -> TaskGate {
        let mut required_final = Vec::new();
        for evr in evrs {
            let reason = match evr.status {
                EvrStatus::Unknown => Some(BlockReason::StatusUnknown),
                EvrStatus::Fail => Some(BlockReason::Failed),
                EvrStatus::Skip
                    if evr.notes.as_deref().map_or(true, |n| n.trim().is_empty()) =>
                {
                    Some(BlockReason::NeedReasonForSkip)
                }
                EvrStatus::Pass
                    if self.requires_final_run(evr)
                        && window_start
                            .is_some_and(|w| evr.last_run.map_or(true, |at| at < w)) =>
                {
                    Some(BlockReason::NeedsFinalRun)
                }
                _ => None,
            };
            if let Some(reason) = reason {
                required_final.push(RequiredFinal {
                    evr_id: evr.id.clone(),
                    reason,
                });
            }
        }

        let summary = self.summary(evrs);
        let can_complete = required_final.is_empty();
        TaskGate {
            can_complete,
            error_code: (!can_complete).then_some(ErrorCode::EvrNotReady),
            required_final,
            unreferenced: summary.unreferenced.clone(),
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn run(status: EvrStatus, notes: Option<&str>, proof: Option<&str>) -> VerificationRun {
        VerificationRun {
            at: Utc::now(),
            by: RunBy::Ai,
            status,
            notes: notes.map(String::from),
            proof: proof.map(String::from),
        }
    }

    fn referenced(id: &str) -> Evr {
        let mut evr = Evr::new(id, id);
        evr.referenced_by = vec!["plan-1".into()];
        evr
    }

    // ========================================================================
    // Run tracking
    // ========================================================================

    #[test]
    fn test_track_run_mirrors_newest() {
        let validator = EvrValidator::new();
        let mut evr = referenced("evr-a");

        validator.track_run(&mut evr, run(EvrStatus::Fail, Some("broke"), None));
        validator.track_run(&mut evr, run(EvrStatus::Pass, Some("fixed"), Some("log.txt")));

        assert_eq!(evr.runs.len(), 2);
        assert_eq!(evr.runs[0].status, EvrStatus::Pass);
        assert_eq!(evr.status, EvrStatus::Pass);
        assert_eq!(evr.notes.as_deref(), Some("fixed"));
        assert_eq!(evr.proof.as_deref(), Some("log.txt"));
        assert_eq!(evr.last_run, Some(evr.runs[0].at));
        // Reverse-chronological: older run pushed down
        assert_eq!(evr.runs[1].status, EvrStatus::Fail);
    }

    // ========================================================================
    // Readiness predicate
    // ========================================================================

    #[test]
    fn test_ready_requires_reference() {
        let validator = EvrValidator::new();
        let mut orphan = Evr::new("evr-a", "A");
        orphan.status = EvrStatus::Pass;
        assert!(!validator.is_ready(&orphan));

        let mut bound = referenced("evr-a");
        bound.status = EvrStatus::Pass;
        assert!(validator.is_ready(&bound));
    }

    #[test]
    fn test_skip_ready_only_with_notes() {
        let validator = EvrValidator::new();
        let mut evr = referenced("evr-a");
        evr.status = EvrStatus::Skip;
        assert!(!validator.is_ready(&evr));
        evr.notes = Some("  ".into());
        assert!(!validator.is_ready(&evr));
        evr.notes = Some("covered by e2e suite".into());
        assert!(validator.is_ready(&evr));
    }

    // ========================================================================
    // Gates
    // ========================================================================

    #[test]
    fn test_plan_gate_blocks_on_unknown() {
        let validator = EvrValidator::new();
        let evr = referenced("evr-a");
        let gate = validator.check_plan_gate(&["evr-a".to_string()], &[evr]);
        assert!(!gate.can_complete);
        assert_eq!(gate.pending_evrs, vec!["evr-a"]);
    }

    #[test]
    fn test_plan_gate_missing_binding_is_pending() {
        let validator = EvrValidator::new();
        let gate = validator.check_plan_gate(&["evr-ghost".to_string()], &[]);
        assert!(!gate.can_complete);
        assert_eq!(gate.pending_evrs, vec!["evr-ghost"]);
    }

    #[test]
    fn test_plan_gate_empty_bindings_pass() {
        let validator = EvrValidator::new();
        let gate = validator.check_plan_gate(&[], &[]);
        assert!(gate.can_complete);
    }

    #[test]
    fn test_task_gate_reasons() {
        let validator = EvrValidator::new();
        let mut unknown = referenced("evr-u");
        unknown.status = EvrStatus::Unknown;
        let mut failed = referenced("evr-f");
        failed.status = EvrStatus::Fail;
        let mut skipped = referenced("evr-s");
        skipped.status = EvrStatus::Skip;

        let gate = validator.check_task_completion(&[unknown, failed, skipped], None);
        assert!(!gate.can_complete);
        assert_eq!(gate.error_code, Some(ErrorCode::EvrNotReady));
        let reasons: Vec<_> = gate.required_final.iter().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                BlockReason::StatusUnknown,
                BlockReason::Failed,
                BlockReason::NeedReasonForSkip
            ]
        );
    }

    #[test]
    fn test_task_gate_passes_with_no_evrs() {
        let validator = EvrValidator::new();
        let gate = validator.check_task_completion(&[], None);
        assert!(gate.can_complete);
        assert!(gate.error_code.is_none());
        assert_eq!(gate.summary.total, 0);
    }

    #[test]
    fn test_task_gate_demands_fresh_run_inside_window() {
        let validator = EvrValidator::new();
        let window = Utc::now();

        // Runtime pass recorded before the window opened
        let mut stale = referenced("evr-r");
        validator.track_run(&mut stale, run(EvrStatus::Pass, None, Some("log")));
        stale.last_run = Some(window - chrono::Duration::seconds(30));
        stale.runs[0].at = stale.last_run.unwrap();

        let gate = validator.check_task_completion(std::slice::from_ref(&stale), Some(window));
        assert!(!gate.can_complete);
        assert_eq!(gate.required_final.len(), 1);
        assert_eq!(gate.required_final[0].reason, BlockReason::NeedsFinalRun);

        // Re-run inside the window clears the requirement
        let mut fresh = stale.clone();
        validator.track_run(&mut fresh, run(EvrStatus::Pass, None, Some("log")));
        let gate = validator.check_task_completion(&[fresh], Some(window));
        assert!(gate.can_complete);

        // No window means no freshness demand
        let gate = validator.check_task_completion(&[stale], None);
        assert!(gate.can_complete);
    }

    #[test]
    fn test_task_gate_exempts_static_pass_with_proof() {
        let validator = EvrValidator::new();
        let window = Utc::now();

        let mut evr = referenced("evr-s");
        evr.class = Some(EvrClass::Static);
        validator.track_run(&mut evr, run(EvrStatus::Pass, None, Some("diff clean")));
        evr.last_run = Some(window - chrono::Duration::seconds(30));
        evr.runs[0].at = evr.last_run.unwrap();

        let gate = validator.check_task_completion(&[evr], Some(window));
        assert!(gate.can_complete, "static pass with proof needs no final run");

        // A skip with a recorded reason is not asked to run either
        let mut skipped = referenced("evr-k");
        validator.track_run(&mut skipped, run(EvrStatus::Skip, Some("covered by e2e"), None));
        let gate = validator.check_task_completion(&[skipped], Some(Utc::now()));
        assert!(gate.can_complete);
    }

    #[test]
    fn test_summary_counts_and_unreferenced() {
        let validator = EvrValidator::new();
        let mut passed = referenced("evr-p");
        passed.status = EvrStatus::Pass;
        let orphan = Evr::new("evr-o", "O");

        let summary = validator.summary(&[passed, orphan]);
        assert_eq!(summary.passed, vec!["evr-p"]);
        assert_eq!(summary.unknown, vec!["evr-o"]);
        assert_eq!(summary.unreferenced, vec!["evr-o"]);
        assert_eq!(summary.total, 2);
    }

    #[test]
    fn test_static_class_skips_final_revalidation() {
        let validator = EvrValidator::new();
        let mut evr = referenced("evr-a");
        evr.class = Some(EvrClass::Static);
        evr.status = EvrStatus::Pass;
        evr.proof = Some("diff clean".into());
        assert!(!validator.requires_final_run(&evr));

        evr.proof = None;
        assert!(validator.requires_final_run(&evr));

        evr.class = None; // runtime by default
        evr.proof = Some("log".into());
        assert!(validator.requires_final_run(&evr));
    }
}
