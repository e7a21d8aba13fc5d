//! Panel renderer
//!
//! Emits the canonical Markdown form: fixed section order, stable anchors
//! on every plan/step/EVR, bijective checkboxes, and scalar-or-collapsible
//! rendering for `verify`/`expect`. The ETag (`md_version`) is the md5 of
//! the body, excluding front matter.

use super::models::{status_marker, PanelTemplate};
use crate::evr::Evr;
use crate::task::{ContextTag, Plan, Step, Task};
use chrono::Utc;
use std::fmt::Write as _;

/// Renders a [`Task`] into the canonical panel form.
#[derive(Debug)]
pub struct PanelRenderer {
    template: PanelTemplate,
    front_matter: bool,
}

/// A rendered panel plus its ETag
#[derive(Debug, Clone)]
pub struct RenderedPanel {
    pub text: String,
    pub md_version: String,
}

impl PanelRenderer {
    pub fn new(template: PanelTemplate, front_matter: bool) -> Self {
        Self {
            template,
            front_matter,
        }
    }

    /// Render the task. The returned `md_version` is the ETag the caller
    /// records on the task for constant-time edit detection.
    pub fn render(&self, task: &Task) -> RenderedPanel {
        let body = self.render_body(task);
        let md_version = body_etag(&body);

        let text = if self.front_matter {
            format!(
                "---\nmd_version: {}\nlast_modified: {}\n---\n\n{}",
                md_version,
                Utc::now().to_rfc3339(),
                body
            )
        } else {
            body
        };
        RenderedPanel { text, md_version }
    }

    fn render_body(&self, task: &Task) -> String {
        let mut out = String::new();
        let t = &self.template;

        writeln!(out, "# Task: {}", task.title).ok();
        writeln!(out).ok();
        writeln!(out, "Task ID: {}", task.id).ok();
        writeln!(out).ok();
        if !task.knowledge_refs.is_empty() {
            writeln!(out, "References: {}", task.knowledge_refs.join(", ")).ok();
            writeln!(out).ok();
        }

        if !task.goal.is_empty() {
            writeln!(out, "## {}", t.requirements).ok();
            writeln!(out).ok();
            for line in task.goal.lines() {
                writeln!(out, "- {}", line).ok();
            }
            writeln!(out).ok();
        }

        if !task.issues.is_empty() {
            writeln!(out, "## {}", t.issues).ok();
            writeln!(out).ok();
            for issue in &task.issues {
                writeln!(out, "- {}", issue).ok();
            }
            writeln!(out).ok();
        }

        if !task.task_hints.is_empty() {
            writeln!(out, "## {}", t.task_hints).ok();
            writeln!(out).ok();
            for hint in &task.task_hints {
                writeln!(out, "> {}", hint).ok();
            }
            writeln!(out).ok();
        }

        if !task.expected_results.is_empty() {
            writeln!(out, "## {}", t.expected_results).ok();
            writeln!(out).ok();
            for evr in &task.expected_results {
                self.render_evr(&mut out, evr);
            }
        }

        if !task.overall_plan.is_empty() {
            writeln!(out, "## {}", t.plans).ok();
            writeln!(out).ok();
            for (i, plan) in task.overall_plan.iter().enumerate() {
                self.render_plan(&mut out, plan, i + 1);
            }
            writeln!(out).ok();
        }

        if !task.logs.is_empty() {
            writeln!(out, "## {}", t.logs).ok();
            writeln!(out).ok();
            for entry in &task.logs {
                writeln!(
                    out,
                    "- {} {} [{}] {}: {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level,
                    entry.category,
                    entry.action,
                    entry.message
                )
                .ok();
            }
            writeln!(out).ok();
        }

        // Single trailing newline
        while out.ends_with("\n\n") {
            out.pop();
        }
        out
    }

    fn render_evr(&self, out: &mut String, evr: &Evr) {
        writeln!(out, "### {} <!-- evr:{} -->", evr.title, evr.id).ok();
        writeln!(out).ok();
        render_text_field(out, "Verify", &evr.verify);
        render_text_field(out, "Expect", &evr.expect);
        writeln!(out).ok();

        writeln!(out, "- status: {}", evr.status).ok();
        if let Some(class) = evr.class {
            let tag = match class {
                crate::evr::EvrClass::Static => "static",
                crate::evr::EvrClass::Runtime => "runtime",
            };
            writeln!(out, "- class: {}", tag).ok();
        }
        if let Some(last_run) = evr.last_run {
            writeln!(out, "- last_run: {}", last_run.to_rfc3339()).ok();
        }
        if let Some(notes) = &evr.notes {
            writeln!(out, "- notes: {}", notes).ok();
        }
        if let Some(proof) = &evr.proof {
            writeln!(out, "- proof: {}", proof).ok();
        }
        writeln!(out).ok();

        if !evr.runs.is_empty() {
            writeln!(out, "**Verification Runs:**").ok();
            writeln!(out).ok();
            for run in &evr.runs {
                let by = serde_json::to_value(run.by)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "tool".into());
                let mut line = format!("- [{}] {} by {}", run.status, run.at.to_rfc3339(), by);
                if let Some(notes) = &run.notes {
                    line.push_str(": ");
                    line.push_str(notes);
                }
                writeln!(out, "{}", line).ok();
            }
            writeln!(out).ok();
        }
    }

    fn render_plan(&self, out: &mut String, plan: &Plan, index: usize) {
        writeln!(
            out,
            "{}. [{}] {} <!-- plan:{} -->",
            index,
            status_marker(plan.status),
            plan.description,
            plan.id
        )
        .ok();
        render_annotations(out, "   ", &plan.hints, &plan.context_tags);
        for (j, step) in plan.steps.iter().enumerate() {
            self.render_step(out, step, index, j + 1);
        }
    }

    fn render_step(&self, out: &mut String, step: &Step, plan_index: usize, step_index: usize) {
        writeln!(
            out,
            "   {}.{} [{}] {} <!-- step:{} -->",
            plan_index,
            step_index,
            status_marker(step.status),
            step.description,
            step.id
        )
        .ok();
        render_annotations(out, "      ", &step.hints, &step.context_tags);
    }
}

/// `**Verify:**` / `**Expect:**` lines: one-element values stay inline,
/// the remainder of a multi-element value folds into a collapsible block.
fn render_text_field(out: &mut String, label: &str, values: &[String]) {
    match values {
        [] => {
            writeln!(out, "**{}:**", label).ok();
        }
        [single] => {
            writeln!(out, "**{}:** {}", label, single).ok();
        }
        [first, rest @ ..] => {
            writeln!(out, "**{}:** {}", label, first).ok();
            writeln!(out, "<details><summary>more</summary>").ok();
            writeln!(out).ok();
            for item in rest {
                writeln!(out, "- {}", item).ok();
            }
            writeln!(out).ok();
            writeln!(out, "</details>").ok();
        }
    }
}

fn render_annotations(out: &mut String, indent: &str, hints: &[String], tags: &[ContextTag]) {
    for hint in hints {
        writeln!(out, "{}> {}", indent, hint).ok();
    }
    for tag in tags {
        writeln!(out, "{}- [{}] {}", indent, tag.tag, tag.value).ok();
    }
}

/// ETag of a panel body: md5 of the text after front matter.
pub fn body_etag(body: &str) -> String {
    format!("{:x}", md5::compute(body.as_bytes()))
}

/// Strip front matter and return `(declared_md_version, body)`.
pub fn split_front_matter(text: &str) -> (Option<String>, &str) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (None, text);
    };
    let Some(end) = rest.find("\n---\n") else {
        return (None, text);
    };
    let header = &rest[..end];
    let mut declared = None;
    for line in header.lines() {
        if let Some(v) = line.strip_prefix("md_version:") {
            declared = Some(v.trim().to_string());
        }
    }
    let mut body = &rest[end + 5..];
    body = body.strip_prefix('\n').unwrap_or(body);
    (declared, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evr::{Evr, EvrStatus};
    use crate::task::{ItemStatus, LogAction, LogCategory, LogEntry, LogLevel};

    fn sample_task() -> Task {
        let mut plan = Plan::new("plan-1", "design");
        plan.status = ItemStatus::InProgress;
        plan.hints.push("start small".into());
        let mut step = Step::new("draft schema");
        step.id = "01JSTEP000000000000000000A".into();
        plan.steps.push(step);

        let mut evr = Evr::new("evr-build-passes", "Build passes");
        evr.verify = vec!["cargo build".into()];
        evr.expect = vec!["exit 0".into(), "no warnings".into()];
        evr.status = EvrStatus::Unknown;
        evr.referenced_by = vec!["plan-1".into()];

        Task {
            id: "01JTASK0000000000000000000".into(),
            title: "Ship widget".into(),
            slug: "ship-widget".into(),
            story: None,
            goal: "Implement the widget".into(),
            issues: vec!["flaky test on CI".into()],
            knowledge_refs: vec!["docs/widget.md".into()],
            task_hints: vec!["ask before deleting".into()],
            overall_plan: vec![plan],
            current_plan_id: Some("plan-1".into()),
            expected_results: vec![evr],
            logs: vec![LogEntry::new(
                LogLevel::Info,
                LogCategory::Task,
                LogAction::Create,
                "Task created",
            )],
            md_version: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_render_contains_all_sections_in_order() {
        let renderer = PanelRenderer::new(PanelTemplate::default(), false);
        let panel = renderer.render(&sample_task());
        let text = &panel.text;

        let positions: Vec<usize> = [
            "# Task: Ship widget",
            "Task ID: 01JTASK0000000000000000000",
            "References: docs/widget.md",
            "## Requirements",
            "## Issues",
            "## Task Hints",
            "## Expected Visible Results",
            "## Plans & Steps",
            "## Logs",
        ]
        .iter()
        .map(|s| text.find(s).unwrap_or_else(|| panic!("missing {}", s)))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_render_anchors_and_checkboxes() {
        let renderer = PanelRenderer::new(PanelTemplate::default(), false);
        let text = renderer.render(&sample_task()).text;
        assert!(text.contains("1. [-] design <!-- plan:plan-1 -->"));
        assert!(text.contains("   1.1 [ ] draft schema <!-- step:01JSTEP000000000000000000A -->"));
        assert!(text.contains("### Build passes <!-- evr:evr-build-passes -->"));
    }

    #[test]
    fn test_render_multi_element_expect_collapses() {
        let renderer = PanelRenderer::new(PanelTemplate::default(), false);
        let text = renderer.render(&sample_task()).text;
        assert!(text.contains("**Verify:** cargo build"));
        assert!(text.contains("**Expect:** exit 0"));
        assert!(text.contains("<details><summary>more</summary>"));
        assert!(text.contains("- no warnings"));
    }

    #[test]
    fn test_front_matter_carries_body_etag() {
        let renderer = PanelRenderer::new(PanelTemplate::default(), true);
        let panel = renderer.render(&sample_task());
        let (declared, body) = split_front_matter(&panel.text);
        assert_eq!(declared.as_deref(), Some(panel.md_version.as_str()));
        assert_eq!(body_etag(body), panel.md_version);
    }

    #[test]
    fn test_render_is_deterministic() {
        let task = sample_task();
        let renderer = PanelRenderer::new(PanelTemplate::default(), false);
        assert_eq!(renderer.render(&task).text, renderer.render(&task).text);
    }
}
