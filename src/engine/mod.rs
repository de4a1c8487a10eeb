//! Execution engine: the only component that mutates the working tree.
//!
//! The engine wraps a [`GitWorkTree`] and a [`TestRunner`] and tracks the
//! [`PhaseFlags`] of the attached task. Every failing operation writes a
//! `failed_<operation>` snapshot to the ledger before the error is returned.

mod phase;
mod runner;
mod worktree;

pub use phase::{PhaseFlag, PhaseFlags, require_phases};
pub use runner::{TestReport, TestRunner};
pub use worktree::GitWorkTree;

use crate::errors::EngineError;
use crate::ledger::AuditLedger;
use patchline_common::Task;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ExecutionEngine {
    tree: GitWorkTree,
    runner: TestRunner,
    ledger: Arc<AuditLedger>,
    current: Option<Task>,
    flags: PhaseFlags,
    always_required: Vec<PhaseFlag>,
}

impl ExecutionEngine {
    pub fn new(tree: GitWorkTree, runner: TestRunner, ledger: Arc<AuditLedger>) -> Self {
        Self {
            tree,
            runner,
            ledger,
            current: None,
            flags: PhaseFlags::new(),
            always_required: Vec::new(),
        }
    }

    /// Gate flags a commit always requires, whether or not the gate ran.
    pub fn with_required_gates<I, S>(mut self, gates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.always_required = gates
            .into_iter()
            .map(|g| PhaseFlag::from_label(g.as_ref()))
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        self.tree.root()
    }

    pub fn work_tree(&self) -> &GitWorkTree {
        &self.tree
    }

    /// Start tracking `task`; its phase flags begin empty.
    pub fn attach_task(&mut self, task: &Task) {
        self.current = Some(task.clone());
        self.flags = PhaseFlags::new();
    }

    pub fn detach_task(&mut self) {
        self.current = None;
        self.flags = PhaseFlags::new();
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    pub fn flags(&self) -> &PhaseFlags {
        &self.flags
    }

    /// Mark a review gate as part of this run before it executes.
    pub fn introduce_gate(&mut self, gate: &str) {
        self.flags.introduce(PhaseFlag::gate(gate));
    }

    pub fn mark_gate(&mut self, gate: &str) {
        self.flags.mark(PhaseFlag::gate(gate));
    }

    pub fn head(&self) -> Result<String, EngineError> {
        self.tree.head()
    }

    pub fn isolate_branch(&mut self, name: &str, base: &str) -> Result<(), EngineError> {
        match self.tree.isolate_branch(name, base) {
            Ok(()) => {
                info!("Isolated work on branch {} (base {})", name, base);
                self.flags.mark(PhaseFlag::BranchIsolated);
                Ok(())
            }
            Err(e) => {
                self.record_failure("isolate_branch", &e, json!({ "branch": name, "base": base }));
                Err(e)
            }
        }
    }

    /// Check then apply `diff`. On a failed check the tree is untouched.
    pub fn apply(&mut self, diff: &str, reverse: bool) -> Result<(), EngineError> {
        let result = self
            .tree
            .check_patch(diff, reverse)
            .and_then(|()| self.tree.apply_patch(diff, reverse));
        match result {
            Ok(()) => {
                if reverse {
                    self.flags.clear(&PhaseFlag::PatchApplied);
                    self.flags.clear(&PhaseFlag::TestsPassed);
                } else {
                    self.flags.mark(PhaseFlag::PatchApplied);
                }
                debug!("Applied patch (reverse: {})", reverse);
                Ok(())
            }
            Err(e) => {
                self.record_failure("apply", &e, json!({ "reverse": reverse }));
                Err(e)
            }
        }
    }

    /// Run the test command. A failing run is recorded and reported, never
    /// raised.
    pub fn run_tests(&mut self, path: Option<&Path>) -> TestReport {
        let report = self.runner.run(path);
        if report.passed {
            self.flags.mark(PhaseFlag::TestsPassed);
            info!("Tests passed in {} ms", report.duration_ms);
        } else {
            self.flags.clear(&PhaseFlag::TestsPassed);
            warn!("Tests failed (exit code {:?})", report.exit_code);
            self.record_state(
                "failed_tests",
                json!({
                    "command": report.command,
                    "exit_code": report.exit_code,
                    "output": report.output,
                }),
            );
        }
        report
    }

    /// Commit everything in the tree. Refused unless every required phase
    /// has completed for the attached task.
    pub fn commit(&mut self, message: &str) -> Result<String, EngineError> {
        if self.current.is_none() {
            return Err(EngineError::NoTaskAttached);
        }
        let required = self.flags.required_for_commit(&self.always_required);
        if let Err(e) = require_phases(&self.flags, "commit", &required) {
            let missing = match &e {
                EngineError::Precondition { missing, .. } => missing.clone(),
                _ => Vec::new(),
            };
            self.record_failure("commit", &e, json!({ "missing": missing }));
            return Err(e);
        }

        match self.tree.commit_all(message) {
            Ok(sha) => {
                self.flags.mark(PhaseFlag::Committed);
                info!("Committed {}", sha);
                Ok(sha)
            }
            Err(e) => {
                self.record_failure("commit", &e, Value::Null);
                Err(e)
            }
        }
    }

    /// Restore the tree to `reference`, dropping untracked files.
    pub fn reset_hard(&mut self, reference: &str) -> Result<(), EngineError> {
        match self.tree.reset_hard(reference) {
            Ok(()) => {
                self.flags.clear(&PhaseFlag::PatchApplied);
                self.flags.clear(&PhaseFlag::TestsPassed);
                info!("Reset working tree to {}", reference);
                Ok(())
            }
            Err(e) => {
                self.record_failure("reset_hard", &e, json!({ "reference": reference }));
                Err(e)
            }
        }
    }

    fn record_failure(&self, operation: &str, error: &EngineError, mut extra: Value) {
        if !extra.is_object() {
            extra = json!({});
        }
        extra["error"] = Value::String(error.to_string());
        extra["class"] = json!(error.class());
        self.record_state(&format!("failed_{operation}"), extra);
    }

    fn record_state(&self, state: &str, extra: Value) {
        let Some(task) = &self.current else {
            return;
        };
        if let Err(e) = self.ledger.save(task, state, extra) {
            warn!("Failed to record {} for task {}: {}", state, task.id, e);
        }
    }
}
