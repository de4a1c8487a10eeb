use crate::engine::TestReport;
use crate::errors::ErrorClass;
use crate::gates::ReviewVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages of one cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Select,
    IsolateBranch,
    BuildPatch,
    Review,
    Apply,
    Test,
    Commit,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Select => "select",
            Stage::IsolateBranch => "isolate_branch",
            Stage::BuildPatch => "build_patch",
            Stage::Review => "review",
            Stage::Apply => "apply",
            Stage::Test => "test",
            Stage::Commit => "commit",
            Stage::Finalize => "finalize",
        }
    }

    /// Failures at these stages happen after the patch is known to be
    /// sound, so follow-up work is worth proposing.
    pub fn is_remediable(&self) -> bool {
        matches!(self, Stage::Apply | Stage::Test | Stage::Commit)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReview {
    pub gate: String,
    pub verdict: ReviewVerdict,
}

/// What happened in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub success: bool,
    pub task_id: Option<String>,
    /// Stage that failed, or `None` on success.
    pub stage: Option<Stage>,
    pub commit: Option<String>,
    pub diff: Option<String>,
    pub reviews: Vec<GateReview>,
    pub test_report: Option<TestReport>,
    pub failure: Option<Failure>,
    /// The patch would not have changed anything.
    pub no_op: bool,
    pub rolled_back: bool,
    /// Ids of follow-up tasks proposed after the failure.
    pub remediation: Vec<String>,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        let task = self.task_id.as_deref().unwrap_or("-");
        match (&self.failure, self.stage) {
            _ if self.success => format!(
                "task {} committed {}",
                task,
                self.commit.as_deref().unwrap_or("-")
            ),
            _ if self.no_op => format!("task {} produced no changes", task),
            (Some(failure), Some(stage)) => format!(
                "task {} failed at {} ({}): {}",
                task, stage, failure.class, failure.message
            ),
            _ => format!("task {} failed", task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Stage::IsolateBranch).unwrap(),
            serde_json::json!("isolate_branch")
        );
        assert_eq!(Stage::BuildPatch.to_string(), "build_patch");
    }

    #[test]
    fn test_remediable_stages() {
        assert!(Stage::Test.is_remediable());
        assert!(Stage::Apply.is_remediable());
        assert!(!Stage::Review.is_remediable());
        assert!(!Stage::BuildPatch.is_remediable());
    }

    #[test]
    fn test_summary_mentions_failure() {
        let report = CycleReport {
            task_id: Some("t-1".into()),
            stage: Some(Stage::Test),
            failure: Some(Failure {
                class: ErrorClass::ExternalTool,
                message: "exit 1".into(),
            }),
            ..CycleReport::default()
        };
        assert_eq!(report.summary(), "task t-1 failed at test (external_tool): exit 1");
    }
}
