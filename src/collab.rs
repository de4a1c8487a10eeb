//! Collaborator seams: where tasks, follow-up work and post-cycle analysis
//! come from. The pipeline only depends on these traits; the defaults here
//! are deterministic and need no external service.

use crate::orchestrator::{CycleReport, Stage};
use crate::patch::touched_paths;
use anyhow::Result;
use patchline_common::{Task, TaskDraft, TaskKind};
use serde_json::{Value, json};

/// Produces new tasks when the backlog has nothing executable.
pub trait TaskGenerator {
    fn generate(&self, kind: TaskKind, count: usize) -> Result<Vec<TaskDraft>>;
}

/// Placeholder tasks without patch material. They keep the backlog visible
/// to an operator but are never selected for execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderGenerator;

impl TaskGenerator for PlaceholderGenerator {
    fn generate(&self, kind: TaskKind, count: usize) -> Result<Vec<TaskDraft>> {
        Ok((1..=count)
            .map(|i| {
                let label = match kind {
                    TaskKind::Micro => "Micro task",
                    TaskKind::Story => "Story",
                    TaskKind::Epic => "Epic",
                    TaskKind::Blueprint => "Blueprint",
                };
                TaskDraft::new(format!("{label} {i}"))
                    .with_kind(kind)
                    .with_meta("description", "")
                    .with_meta("generated", true)
            })
            .collect())
    }
}

/// Everything a responder sees about a failed cycle.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub task: &'a Task,
    pub stage: Stage,
    pub error: &'a str,
    pub diff: Option<&'a str>,
    pub test_output: Option<&'a str>,
    /// Number of ancestors of `task` in the remediation chain.
    pub depth: usize,
}

/// Proposes follow-up tasks after a failure. `Ok(None)` declines.
pub trait FailureResponder {
    fn handle(&self, ctx: &FailureContext<'_>) -> Result<Option<Vec<TaskDraft>>>;
}

/// Splits a failure into a diagnosis task and a repair task that carry the
/// failure details in their metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResponder;

const EXCERPT_LIMIT: usize = 2000;

impl FailureResponder for TemplateResponder {
    fn handle(&self, ctx: &FailureContext<'_>) -> Result<Option<Vec<TaskDraft>>> {
        let details = ctx.test_output.unwrap_or(ctx.error);
        let excerpt: String = details.chars().take(EXCERPT_LIMIT).collect();
        let files: Vec<String> = ctx.diff.map(touched_paths).unwrap_or_default();

        let diagnose = TaskDraft::new(format!("Diagnose {} failure: {}", ctx.stage, ctx.task.title))
            .with_meta("description", excerpt.clone())
            .with_meta("failed_stage", ctx.stage.as_str())
            .with_meta("files", files.clone());
        let repair = TaskDraft::new(format!("Repair: {}", ctx.task.title))
            .with_meta(
                "description",
                format!("Produce a corrected change for '{}'.", ctx.task.title),
            )
            .with_meta("failed_stage", ctx.stage.as_str())
            .with_meta("files", files);
        Ok(Some(vec![diagnose, repair]))
    }
}

/// Runs after every cycle on a background thread. Its result is stored as
/// ledger telemetry and never changes the cycle outcome.
pub trait AnalysisHook: Send + Sync {
    fn analyse(&self, report: &CycleReport) -> Result<Value>;
}

/// Size and timing figures for the cycle's patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffStatsHook;

impl AnalysisHook for DiffStatsHook {
    fn analyse(&self, report: &CycleReport) -> Result<Value> {
        let diff = report.diff.as_deref().unwrap_or_default();
        let added = diff
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .count();
        let removed = diff
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .count();
        Ok(json!({
            "success": report.success,
            "stage": report.stage,
            "files": touched_paths(diff).len(),
            "lines_added": added,
            "lines_removed": removed,
            "test_ms": report.test_report.as_ref().map(|t| t.duration_ms),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_placeholder_generator_has_no_material() {
        let drafts = PlaceholderGenerator.generate(TaskKind::Micro, 3).unwrap();
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].title.as_deref(), Some("Micro task 1"));
        let task = drafts[2].clone().into_task(Utc::now()).unwrap();
        assert!(!task.is_executable());
        assert_eq!(task.kind, TaskKind::Micro);
    }

    #[test]
    fn test_template_responder_proposes_two_children() {
        let task = TaskDraft::new("Fix add").into_task(Utc::now()).unwrap();
        let ctx = FailureContext {
            task: &task,
            stage: Stage::Test,
            error: "tests failed",
            diff: Some("diff --git a/src/demo.py b/src/demo.py\n"),
            test_output: Some("AssertionError: 1 != 2"),
            depth: 0,
        };
        let drafts = TemplateResponder.handle(&ctx).unwrap().unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(
            drafts[0].title.as_deref(),
            Some("Diagnose test failure: Fix add")
        );
        assert_eq!(drafts[0].metadata["description"], "AssertionError: 1 != 2");
        assert_eq!(drafts[1].metadata["files"], json!(["src/demo.py"]));
    }

    #[test]
    fn test_diff_stats_counts_lines() {
        let report = CycleReport {
            success: true,
            diff: Some("--- a/x\n+++ b/x\n@@ -1 +1,2 @@\n-a\n+b\n+c\n".into()),
            ..CycleReport::default()
        };
        let stats = DiffStatsHook.analyse(&report).unwrap();
        assert_eq!(stats["lines_added"], 2);
        assert_eq!(stats["lines_removed"], 1);
        assert_eq!(stats["files"], 1);
    }
}
