//! Panel parser
//!
//! Line-oriented state machine over the canonical panel grammar. Anchors
//! are matched first; items without anchors are kept with `anchor: None`
//! so the synchronizer can treat them as panel-side additions. Problems
//! are collected, never thrown: the caller gets a best-effort document.

use super::models::*;
use super::render::{body_etag, split_front_matter};
use crate::evr::{EvrClass, EvrStatus, RunBy, VerificationRun};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^# Task:\s*(.*)$").unwrap());
static TASK_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Task ID:\s*(\S+)\s*$").unwrap());
static REFS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^References:\s*(.*)$").unwrap());
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\s+(.*?)\s*$").unwrap());
static EVR_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^###\s+(.*?)(?:\s*<!--\s*evr:([A-Za-z0-9_-]+)\s*-->)?\s*$").unwrap()
});
static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*(Verify|Expect):\*\*\s*(.*)$").unwrap());
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s+(status|class|last_run|notes|proof):\s*(.*)$").unwrap());
static RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s+\[(\w+)\]\s+(\S+)\s+by\s+(\w+)(?::\s*(.*))?$").unwrap()
});
static PLAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.\s+\[(.)\]\s+(.*?)(?:\s*<!--\s*plan:([A-Za-z0-9_-]+)\s*-->)?\s*$").unwrap()
});
static STEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+(\d+)\.(\d+)\s+\[(.)\]\s+(.*?)(?:\s*<!--\s*step:([A-Za-z0-9_-]+)\s*-->)?\s*$")
        .unwrap()
});
static HINT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*>\s?(.*)$").unwrap());
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-\s+\[([^\]]+)\]\s+(.*)$").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-\s+(.*)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Requirements,
    Issues,
    TaskHints,
    Evrs,
    Plans,
    Logs,
    Unknown,
}

/// Which annotation target is current inside the Plans section
#[derive(Debug, Clone, Copy, PartialEq)]
enum PlanCursor {
    None,
    Plan,
    Step,
}

/// Which text field a `<details>` block extends
#[derive(Debug, Clone, Copy, PartialEq)]
enum DetailsTarget {
    Verify,
    Expect,
}

#[derive(Debug)]
pub struct PanelParser {
    template: PanelTemplate,
}

impl PanelParser {
    pub fn new(template: PanelTemplate) -> Self {
        Self { template }
    }

    /// Parse panel text into a best-effort [`PanelDoc`].
    pub fn parse(&self, text: &str) -> PanelDoc {
        let (declared_etag, body) = split_front_matter(text);
        let mut doc = PanelDoc {
            declared_etag,
            body_etag: body_etag(body),
            ..PanelDoc::default()
        };

        let defaults = PanelTemplate::default();
        let mut section = Section::Preamble;
        let mut cursor = PlanCursor::None;
        let mut in_runs = false;
        let mut details: Option<DetailsTarget> = None;

        for (idx, raw) in body.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end();
            if line.trim().is_empty() {
                continue;
            }

            if let Some(caps) = SECTION_RE.captures(line) {
                let heading = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                section = self.classify(heading, &defaults);
                if section == Section::Unknown {
                    doc.problems.push(ParseIssue {
                        line: line_no,
                        message: format!("unrecognized section heading: {}", heading),
                    });
                }
                cursor = PlanCursor::None;
                in_runs = false;
                details = None;
                continue;
            }

            match section {
                Section::Preamble => self.parse_preamble(line, &mut doc),
                Section::Requirements => {
                    if let Some(caps) = BULLET_RE.captures(line) {
                        doc.requirements.push(caps[1].to_string());
                    }
                }
                Section::Issues => {
                    if let Some(caps) = BULLET_RE.captures(line) {
                        doc.issues.push(caps[1].to_string());
                    }
                }
                Section::TaskHints => {
                    if let Some(caps) = HINT_RE.captures(line) {
                        doc.task_hints.push(caps[1].to_string());
                    }
                }
                Section::Evrs => {
                    self.parse_evr_line(line, line_no, &mut doc, &mut in_runs, &mut details)
                }
                Section::Plans => self.parse_plan_line(line, line_no, &mut doc, &mut cursor),
                Section::Logs => {
                    if let Some(caps) = BULLET_RE.captures(line) {
                        doc.log_lines.push(caps[1].to_string());
                    }
                }
                Section::Unknown => {}
            }
        }
        doc
    }

    fn classify(&self, heading: &str, defaults: &PanelTemplate) -> Section {
        let matches = |configured: &str, default: &str| {
            heading == configured || heading == default
        };
        if matches(&self.template.requirements, &defaults.requirements) {
            Section::Requirements
        } else if matches(&self.template.issues, &defaults.issues) {
            Section::Issues
        } else if matches(&self.template.task_hints, &defaults.task_hints) {
            Section::TaskHints
        } else if matches(&self.template.expected_results, &defaults.expected_results) {
            Section::Evrs
        } else if matches(&self.template.plans, &defaults.plans) {
            Section::Plans
        } else if matches(&self.template.logs, &defaults.logs) {
            Section::Logs
        } else {
            Section::Unknown
        }
    }

    fn parse_preamble(&self, line: &str, doc: &mut PanelDoc) {
        if let Some(caps) = TITLE_RE.captures(line) {
            doc.title = Some(caps[1].trim().to_string());
        } else if let Some(caps) = TASK_ID_RE.captures(line) {
            doc.task_id = Some(caps[1].to_string());
        } else if let Some(caps) = REFS_RE.captures(line) {
            doc.references = caps[1]
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    fn parse_evr_line(
        &self,
        line: &str,
        line_no: usize,
        doc: &mut PanelDoc,
        in_runs: &mut bool,
        details: &mut Option<DetailsTarget>,
    ) {
        if let Some(caps) = EVR_HEADING_RE.captures(line) {
            doc.evrs.push(PanelEvr {
                anchor: caps.get(2).map(|m| m.as_str().to_string()),
                title: caps[1].trim().to_string(),
                ..PanelEvr::default()
            });
            *in_runs = false;
            *details = None;
            return;
        }
        let Some(evr) = doc.evrs.last_mut() else {
            doc.problems.push(ParseIssue {
                line: line_no,
                message: "content before the first result heading".into(),
            });
            return;
        };

        if line == "<details><summary>more</summary>" {
            return; // target already set by the preceding field line
        }
        if line == "</details>" {
            *details = None;
            return;
        }
        if line == "**Verification Runs:**" {
            *in_runs = true;
            return;
        }

        if let Some(caps) = FIELD_RE.captures(line) {
            let values = if caps[2].trim().is_empty() {
                Vec::new()
            } else {
                vec![caps[2].trim().to_string()]
            };
            match &caps[1] {
                "Verify" => {
                    evr.verify = values;
                    *details = Some(DetailsTarget::Verify);
                }
                _ => {
                    evr.expect = values;
                    *details = Some(DetailsTarget::Expect);
                }
            }
            return;
        }

        if *in_runs {
            if let Some(caps) = RUN_RE.captures(line) {
                let status = EvrStatus::from_str(&caps[1]).unwrap_or_else(|_| {
                    doc.problems.push(ParseIssue {
                        line: line_no,
                        message: format!("unknown run status: {}", &caps[1]),
                    });
                    EvrStatus::Unknown
                });
                let at = parse_timestamp(&caps[2]).unwrap_or_else(|| {
                    doc.problems.push(ParseIssue {
                        line: line_no,
                        message: format!("bad run timestamp: {}", &caps[2]),
                    });
                    Utc::now()
                });
                let by = match &caps[3] {
                    "ai" => RunBy::Ai,
                    "user" => RunBy::User,
                    "ci" => RunBy::Ci,
                    _ => RunBy::Tool,
                };
                evr.runs.push(VerificationRun {
                    at,
                    by,
                    status,
                    notes: caps.get(4).map(|m| m.as_str().to_string()),
                    proof: None,
                });
            }
            return;
        }

        if let Some(caps) = META_RE.captures(line) {
            let value = caps[2].trim().to_string();
            match &caps[1] {
                "status" => match EvrStatus::from_str(&value) {
                    Ok(status) => evr.status = Some(status),
                    Err(_) => doc.problems.push(ParseIssue {
                        line: line_no,
                        message: format!("unknown result status: {}", value),
                    }),
                },
                "class" => match value.as_str() {
                    "static" => evr.class = Some(EvrClass::Static),
                    "runtime" => evr.class = Some(EvrClass::Runtime),
                    other => doc.problems.push(ParseIssue {
                        line: line_no,
                        message: format!("unknown result class: {}", other),
                    }),
                },
                "last_run" => evr.last_run = parse_timestamp(&value),
                "notes" => evr.notes = Some(value),
                _ => evr.proof = Some(value),
            }
            return;
        }

        // Continuation items inside a <details> block
        if let Some(target) = *details {
            if let Some(caps) = BULLET_RE.captures(line) {
                let item = caps[1].to_string();
                match target {
                    DetailsTarget::Verify => evr.verify.push(item),
                    DetailsTarget::Expect => evr.expect.push(item),
                }
            }
        }
    }

    fn parse_plan_line(
        &self,
        line: &str,
        line_no: usize,
        doc: &mut PanelDoc,
        cursor: &mut PlanCursor,
    ) {
        // Steps are indented; test before the plan pattern, which anchors
        // at column zero.
        if let Some(caps) = STEP_RE.captures(line) {
            if doc.plans.is_empty() {
                doc.problems.push(ParseIssue {
                    line: line_no,
                    message: "step before any plan".into(),
                });
                return;
            }
            let declared_parent: usize = caps[1].parse().unwrap_or(0);
            if declared_parent != doc.plans.len() {
                doc.problems.push(ParseIssue {
                    line: line_no,
                    message: format!(
                        "step numbering is ambiguous: parent {}, current plan {}",
                        declared_parent,
                        doc.plans.len()
                    ),
                });
            }
            let status = parse_marker(&caps[3], line_no, &mut doc.problems);
            doc.plans.last_mut().expect("non-empty").steps.push(PanelStep {
                anchor: caps.get(5).map(|m| m.as_str().to_string()),
                description: caps[4].trim().to_string(),
                status,
                hints: Vec::new(),
                tags: Vec::new(),
            });
            *cursor = PlanCursor::Step;
            return;
        }

        if let Some(caps) = PLAN_RE.captures(line) {
            let declared: usize = caps[1].parse().unwrap_or(0);
            if declared != doc.plans.len() + 1 {
                doc.problems.push(ParseIssue {
                    line: line_no,
                    message: format!(
                        "plan numbering is ambiguous: found {}, expected {}",
                        declared,
                        doc.plans.len() + 1
                    ),
                });
            }
            let status = parse_marker(&caps[2], line_no, &mut doc.problems);
            doc.plans.push(PanelPlan {
                anchor: caps.get(4).map(|m| m.as_str().to_string()),
                description: caps[3].trim().to_string(),
                status,
                hints: Vec::new(),
                tags: Vec::new(),
                steps: Vec::new(),
            });
            *cursor = PlanCursor::Plan;
            return;
        }

        if let Some(caps) = HINT_RE.captures(line) {
            let hint = caps[1].to_string();
            match cursor {
                PlanCursor::Step => {
                    if let Some(step) = doc.plans.last_mut().and_then(|p| p.steps.last_mut()) {
                        step.hints.push(hint);
                    }
                }
                PlanCursor::Plan => {
                    if let Some(plan) = doc.plans.last_mut() {
                        plan.hints.push(hint);
                    }
                }
                PlanCursor::None => doc.problems.push(ParseIssue {
                    line: line_no,
                    message: "hint outside any plan".into(),
                }),
            }
            return;
        }

        if let Some(caps) = TAG_RE.captures(line) {
            let tag = (caps[1].to_string(), caps[2].trim().to_string());
            match cursor {
                PlanCursor::Step => {
                    if let Some(step) = doc.plans.last_mut().and_then(|p| p.steps.last_mut()) {
                        step.tags.push(tag);
                    }
                }
                PlanCursor::Plan => {
                    if let Some(plan) = doc.plans.last_mut() {
                        plan.tags.push(tag);
                    }
                }
                PlanCursor::None => {}
            }
        }
    }
}

impl Default for PanelParser {
    fn default() -> Self {
        Self::new(PanelTemplate::default())
    }
}

fn parse_marker(text: &str, line_no: usize, problems: &mut Vec<ParseIssue>) -> crate::task::ItemStatus {
    let marker = text.chars().next().unwrap_or(' ');
    marker_status(marker).unwrap_or_else(|| {
        problems.push(ParseIssue {
            line: line_no,
            message: format!("unknown checkbox marker: [{}]", marker),
        });
        crate::task::ItemStatus::ToDo
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ItemStatus;

    const SAMPLE: &str = "\
# Task: Ship widget

Task ID: 01JTASK0000000000000000000

References: docs/widget.md, docs/api.md

## Requirements

- Implement the widget
- Cover it with tests

## Task Hints

> ask before deleting

## Expected Visible Results

### Build passes <!-- evr:evr-build-passes -->

**Verify:** cargo build
**Expect:** exit 0
<details><summary>more</summary>

- no warnings

</details>

- status: pass
- notes: clean build
- proof: build.log

**Verification Runs:**

- [pass] 2026-07-01T10:00:00+00:00 by ai: clean build

## Plans & Steps

1. [-] design <!-- plan:plan-1 -->
   > start small
   - [scope] core
   1.1 [x] draft schema <!-- step:01JSTEP000000000000000000A -->
      > keep it flat
2. [ ] build <!-- plan:plan-2 -->

## Logs

- 2026-07-01T09:00:00+00:00 INFO [TASK] CREATE: Task created
";

    #[test]
    fn test_parse_preamble_and_requirements() {
        let doc = PanelParser::default().parse(SAMPLE);
        assert_eq!(doc.title.as_deref(), Some("Ship widget"));
        assert_eq!(doc.task_id.as_deref(), Some("01JTASK0000000000000000000"));
        assert_eq!(doc.references, vec!["docs/widget.md", "docs/api.md"]);
        assert_eq!(
            doc.requirements,
            vec!["Implement the widget", "Cover it with tests"]
        );
        assert_eq!(doc.task_hints, vec!["ask before deleting"]);
        assert!(doc.problems.is_empty(), "problems: {:?}", doc.problems);
    }

    #[test]
    fn test_parse_evr_with_collapsible_expect() {
        let doc = PanelParser::default().parse(SAMPLE);
        assert_eq!(doc.evrs.len(), 1);
        let evr = &doc.evrs[0];
        assert_eq!(evr.anchor.as_deref(), Some("evr-build-passes"));
        assert_eq!(evr.title, "Build passes");
        assert_eq!(evr.verify, vec!["cargo build"]);
        assert_eq!(evr.expect, vec!["exit 0", "no warnings"]);
        assert_eq!(evr.status, Some(crate::evr::EvrStatus::Pass));
        assert_eq!(evr.notes.as_deref(), Some("clean build"));
        assert_eq!(evr.proof.as_deref(), Some("build.log"));
        assert_eq!(evr.runs.len(), 1);
        assert_eq!(evr.runs[0].notes.as_deref(), Some("clean build"));
    }

    #[test]
    fn test_parse_plans_and_steps() {
        let doc = PanelParser::default().parse(SAMPLE);
        assert_eq!(doc.plans.len(), 2);
        let plan = &doc.plans[0];
        assert_eq!(plan.anchor.as_deref(), Some("plan-1"));
        assert_eq!(plan.status, ItemStatus::InProgress);
        assert_eq!(plan.hints, vec!["start small"]);
        assert_eq!(plan.tags, vec![("scope".to_string(), "core".to_string())]);
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.anchor.as_deref(), Some("01JSTEP000000000000000000A"));
        assert_eq!(step.status, ItemStatus::Completed);
        assert_eq!(step.hints, vec!["keep it flat"]);
        assert_eq!(doc.plans[1].status, ItemStatus::ToDo);
    }

    #[test]
    fn test_unknown_marker_reads_todo_with_warning() {
        let text = "## Plans & Steps\n\n1. [?] odd <!-- plan:plan-1 -->\n";
        let doc = PanelParser::default().parse(text);
        assert_eq!(doc.plans[0].status, ItemStatus::ToDo);
        assert!(doc
            .problems
            .iter()
            .any(|p| p.message.contains("unknown checkbox marker")));
    }

    #[test]
    fn test_missing_anchor_is_tolerated() {
        let text = "## Plans & Steps\n\n1. [ ] hand-added plan\n";
        let doc = PanelParser::default().parse(text);
        assert_eq!(doc.plans.len(), 1);
        assert!(doc.plans[0].anchor.is_none());
    }

    #[test]
    fn test_ambiguous_numbering_is_reported() {
        let text = "## Plans & Steps\n\n3. [ ] first <!-- plan:plan-1 -->\n";
        let doc = PanelParser::default().parse(text);
        assert_eq!(doc.plans.len(), 1);
        assert!(doc
            .problems
            .iter()
            .any(|p| p.message.contains("numbering is ambiguous")));
    }

    #[test]
    fn test_body_etag_matches_raw_body() {
        let doc = PanelParser::default().parse(SAMPLE);
        assert!(doc.problems.is_empty());
        let (_, body) = crate::panel::render::split_front_matter(SAMPLE);
        assert_eq!(doc.body_etag, crate::panel::render::body_etag(body));
    }
}
