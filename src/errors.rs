//! Typed error hierarchy for the pipeline.
//!
//! One enum per subsystem:
//! - `LockError`: advisory file lock acquisition
//! - `StoreError` / `LedgerError`: persistence of tasks and audit records
//! - `PatchError`: turning patch material into a verified diff
//! - `EngineError`: version control and phase-guard failures
//! - `CycleError`: failures the orchestrator cannot contain
//!
//! Every recoverable error maps onto an [`ErrorClass`] so callers can react
//! to the kind of failure without matching on individual variants.

use crate::orchestrator::Stage;
use patchline_common::{ChangeSetError, DraftError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification shared by all recoverable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed input: bad task fields, invalid change set, unknown id.
    Structural,
    /// A required pipeline phase was not completed.
    Precondition,
    /// Git, the diff tool, or the test command failed.
    ExternalTool,
    /// The tree drifted from what the change was written against.
    Conflict,
    /// The change would not alter anything.
    NoOp,
    Io,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::Structural => "structural",
            ErrorClass::Precondition => "precondition",
            ErrorClass::ExternalTool => "external_tool",
            ErrorClass::Conflict => "conflict",
            ErrorClass::NoOp => "no_op",
            ErrorClass::Io => "io",
        };
        f.write_str(label)
    }
}

/// Errors acquiring a cross-process advisory lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} already exists")]
    DuplicateId { id: String },

    #[error("Invalid task: {0}")]
    Invalid(#[from] DraftError),

    #[error("Failed to read task file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write task file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse task file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize tasks: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Task store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. } | StoreError::DuplicateId { .. } | StoreError::Invalid(_) => {
                ErrorClass::Structural
            }
            StoreError::Parse { .. } | StoreError::Serialize(_) => ErrorClass::Structural,
            StoreError::Read { .. }
            | StoreError::Write { .. }
            | StoreError::Lock(_)
            | StoreError::LockPoisoned => ErrorClass::Io,
        }
    }
}

/// Errors from the audit ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("No audit record for task {task_id}")]
    NoRecord { task_id: String },

    #[error("Failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse ledger {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize audit data: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Audit ledger lock poisoned")]
    LockPoisoned,
}

/// Errors building a diff from patch material.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Invalid change set: {0}")]
    Invalid(#[from] ChangeSetError),

    #[error("Fingerprint mismatch for {path}: expected {expected}, found {}", .actual.as_deref().unwrap_or("missing file"))]
    Conflict {
        path: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("Change produces no difference")]
    NoOp,

    #[error("Diff generation failed for {path}: {output}")]
    DiffFailed { path: String, output: String },

    #[error("Generated patch does not apply cleanly: {output}")]
    DoesNotApply { output: String },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shadow tree I/O failed at {path}: {source}")]
    Shadow {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PatchError::Invalid(_) => ErrorClass::Structural,
            PatchError::Conflict { .. } | PatchError::DoesNotApply { .. } => ErrorClass::Conflict,
            PatchError::NoOp => ErrorClass::NoOp,
            PatchError::DiffFailed { .. } | PatchError::Spawn { .. } => ErrorClass::ExternalTool,
            PatchError::Shadow { .. } => ErrorClass::Io,
        }
    }
}

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot {operation}: missing prerequisite phase(s): {}", .missing.join(", "))]
    Precondition {
        operation: &'static str,
        missing: Vec<String>,
    },

    #[error("No task attached to the engine")]
    NoTaskAttached,

    #[error("git {operation} failed: {output}")]
    Tool {
        operation: &'static str,
        output: String,
    },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Precondition { .. } | EngineError::NoTaskAttached => {
                ErrorClass::Precondition
            }
            EngineError::Tool { .. } | EngineError::Spawn { .. } | EngineError::Git(_) => {
                ErrorClass::ExternalTool
            }
            EngineError::Io { .. } => ErrorClass::Io,
        }
    }
}

/// Failures a cycle cannot contain; the working tree may need manual repair.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(
        "Rollback of task {task_id} failed after {stage} stage; working tree needs manual intervention: {source}"
    )]
    RollbackFailed {
        task_id: String,
        stage: Stage,
        #[source]
        source: EngineError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchline_common::ParseEnumError;

    #[test]
    fn store_error_invalid_converts_from_draft_error() {
        let err: StoreError = DraftError::MissingTitle.into();
        assert!(matches!(err, StoreError::Invalid(DraftError::MissingTitle)));
        assert_eq!(err.class(), ErrorClass::Structural);
    }

    #[test]
    fn store_error_bad_status_is_structural() {
        let err: StoreError = DraftError::Invalid(ParseEnumError {
            field: "status",
            value: "finished".into(),
            expected: "open",
        })
        .into();
        assert_eq!(err.class(), ErrorClass::Structural);
        assert!(err.to_string().contains("finished"));
    }

    #[test]
    fn lock_error_wraps_into_store_and_ledger() {
        let timeout = || LockError::Timeout {
            path: PathBuf::from("/tmp/tasks.json.lock"),
            waited: Duration::from_millis(200),
        };
        let store_err: StoreError = timeout().into();
        assert_eq!(store_err.class(), ErrorClass::Io);
        let ledger_err: LedgerError = timeout().into();
        assert!(matches!(ledger_err, LedgerError::Lock(LockError::Timeout { .. })));
    }

    #[test]
    fn patch_error_classes() {
        assert_eq!(PatchError::NoOp.class(), ErrorClass::NoOp);
        assert_eq!(
            PatchError::Invalid(ChangeSetError::NoEdits).class(),
            ErrorClass::Structural
        );
        let conflict = PatchError::Conflict {
            path: "a.txt".into(),
            expected: "abc".into(),
            actual: None,
        };
        assert_eq!(conflict.class(), ErrorClass::Conflict);
        assert!(conflict.to_string().contains("missing file"));
    }

    #[test]
    fn engine_precondition_lists_missing_phases() {
        let err = EngineError::Precondition {
            operation: "commit",
            missing: vec!["tests_passed".into(), "review_passed".into()],
        };
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert_eq!(
            err.to_string(),
            "Cannot commit: missing prerequisite phase(s): tests_passed, review_passed"
        );
    }

    #[test]
    fn cycle_error_carries_stage_and_source() {
        let err = CycleError::RollbackFailed {
            task_id: "t-1".into(),
            stage: Stage::Test,
            source: EngineError::Tool {
                operation: "reset",
                output: "locked".into(),
            },
        };
        assert!(err.to_string().contains("t-1"));
        assert!(err.to_string().contains("manual intervention"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_class_display_is_snake_case() {
        assert_eq!(ErrorClass::ExternalTool.to_string(), "external_tool");
        assert_eq!(ErrorClass::NoOp.to_string(), "no_op");
    }
}
