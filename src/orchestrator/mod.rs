//! Cycle orchestrator: drives one task from selection to commit.
//!
//! Stages run in order and every transition is written to the audit ledger.
//! Once a patch has touched the working tree, any failure before a
//! successful commit resets the tree to the revision it had before the
//! patch. Only a failed rollback escapes as an error; every other outcome
//! is a [`CycleReport`].

mod report;

pub use report::{CycleReport, Failure, GateReview, Stage};

use crate::collab::{
    AnalysisHook, DiffStatsHook, FailureContext, FailureResponder, PlaceholderGenerator,
    TaskGenerator, TemplateResponder,
};
use crate::config::Config;
use crate::engine::{ExecutionEngine, GitWorkTree, TestRunner};
use crate::errors::{CycleError, EngineError, ErrorClass, PatchError, StoreError};
use crate::gates::{ApprovalGate, ReviewGate, RuleReviewer};
use crate::ledger::AuditLedger;
use crate::patch::{PatchBuilder, fingerprints_for, touched_paths};
use crate::store::{StatusFilter, TaskStore};
use anyhow::Context;
use dialoguer::{Select, theme::ColorfulTheme};
use patchline_common::{Task, TaskKind, TaskStatus};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Ledger id used for backlog replenishment events.
pub const REPLENISH_EVENT_ID: &str = "auto-backlog-replenish";

/// How the next task is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Id(String),
    /// Prompt the operator with the executable open tasks.
    Interactive,
    FirstAvailable,
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub base_ref: String,
    pub isolate_branch: bool,
    pub branch_prefix: String,
    pub tests_path: Option<PathBuf>,
    pub replenish_count: usize,
    pub remediation: bool,
    pub max_depth: usize,
    pub max_children: usize,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            base_ref: "HEAD".to_string(),
            isolate_branch: true,
            branch_prefix: "patchline/".to_string(),
            tests_path: None,
            replenish_count: 3,
            remediation: true,
            max_depth: 2,
            max_children: 3,
        }
    }
}

impl From<&Config> for CycleSettings {
    fn from(config: &Config) -> Self {
        let toml = &config.toml;
        Self {
            base_ref: toml.base_ref(),
            isolate_branch: toml.pipeline.isolate_branch,
            branch_prefix: toml.pipeline.branch_prefix.clone(),
            tests_path: config.tests_path(),
            replenish_count: toml.pipeline.replenish_count,
            remediation: toml.remediation.enabled,
            max_depth: toml.remediation.max_depth,
            max_children: toml.remediation.max_children,
        }
    }
}

/// Why a cycle stopped early.
struct Halt {
    stage: Stage,
    class: ErrorClass,
    message: String,
    /// A `failed_<stage>` snapshot already exists for this failure.
    recorded: bool,
    test_output: Option<String>,
}

impl Halt {
    fn new(stage: Stage, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            stage,
            class,
            message: message.into(),
            recorded: false,
            test_output: None,
        }
    }

    fn recorded(mut self) -> Self {
        self.recorded = true;
        self
    }

    fn store(stage: Stage, e: StoreError) -> Self {
        Self::new(stage, e.class(), e.to_string())
    }

    /// Engine failures are recorded by the engine itself.
    fn engine(stage: Stage, e: &EngineError) -> Self {
        Self::new(stage, e.class(), e.to_string()).recorded()
    }

    /// The runner writes `failed_tests` for every failed run.
    fn tests_failed(exit_code: Option<i32>, output: String) -> Self {
        let message = match exit_code {
            Some(code) => format!("Tests failed with exit code {code}"),
            None => "Tests failed to run".to_string(),
        };
        let mut halt = Self::new(Stage::Test, ErrorClass::ExternalTool, message).recorded();
        halt.test_output = Some(output);
        halt
    }
}

/// State carried through a single cycle.
struct Attempt {
    task: Task,
    report: CycleReport,
    /// Revision to reset to once the patch may have touched the tree.
    pre_patch: Option<String>,
}

pub struct Orchestrator {
    store: Arc<TaskStore>,
    ledger: Arc<AuditLedger>,
    engine: ExecutionEngine,
    builder: PatchBuilder,
    gates: Vec<Box<dyn ReviewGate>>,
    generator: Box<dyn TaskGenerator>,
    responder: Option<Box<dyn FailureResponder>>,
    hook: Option<Arc<dyn AnalysisHook>>,
    settings: CycleSettings,
    analysis: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        ledger: Arc<AuditLedger>,
        engine: ExecutionEngine,
        builder: PatchBuilder,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            engine,
            builder,
            gates: Vec::new(),
            generator: Box::new(PlaceholderGenerator),
            responder: Some(Box::new(TemplateResponder)),
            hook: None,
            settings,
            analysis: Vec::new(),
        }
    }

    /// Wire up every component from the project configuration.
    /// `auto_approve` skips interactive approval prompts.
    pub fn from_config(config: &Config, auto_approve: bool) -> anyhow::Result<Self> {
        config.ensure_state_dir()?;
        let storage = &config.toml.storage;
        let (store, ledger) = if storage.cross_process_lock {
            (
                TaskStore::open_shared(config.tasks_file(), config.lock_timeout())?,
                AuditLedger::open_shared(config.ledger_file(), config.lock_timeout())?,
            )
        } else {
            (
                TaskStore::open(config.tasks_file())?,
                AuditLedger::open(config.ledger_file())?,
            )
        };
        let ledger = Arc::new(ledger);

        let tree = GitWorkTree::open(&config.project_dir).with_context(|| {
            format!("Not a git work tree: {}", config.project_dir.display())
        })?;
        let runner = TestRunner::new(config.toml.test_command(), &config.project_dir);
        let engine = ExecutionEngine::new(tree, runner, Arc::clone(&ledger))
            .with_required_gates(&config.toml.gates.always_required);
        let builder = PatchBuilder::new(&config.project_dir);

        let mut orchestrator = Self::new(
            Arc::new(store),
            ledger,
            engine,
            builder,
            CycleSettings::from(config),
        );
        let gates = &config.toml.gates;
        if gates.review {
            orchestrator = orchestrator
                .with_gate(RuleReviewer::new().with_configured_rules(&gates.rules));
        }
        if gates.interactive {
            orchestrator = orchestrator
                .with_gate(ApprovalGate::new(gates.auto_approve_threshold, auto_approve));
        }
        if config.toml.pipeline.analysis {
            orchestrator = orchestrator.with_analysis_hook(DiffStatsHook);
        }
        Ok(orchestrator)
    }

    pub fn with_gate(mut self, gate: impl ReviewGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn with_generator(mut self, generator: impl TaskGenerator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn with_responder(mut self, responder: impl FailureResponder + 'static) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn without_responder(mut self) -> Self {
        self.responder = None;
        self
    }

    pub fn with_analysis_hook(mut self, hook: impl AnalysisHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn settings(&self) -> &CycleSettings {
        &self.settings
    }

    /// Run one task through the pipeline.
    pub fn run_cycle(&mut self, selection: Selection) -> Result<CycleReport, CycleError> {
        if let Err(e) = self.ensure_backlog() {
            warn!("Backlog replenishment failed: {:#}", e);
        }

        let task = match self.select(&selection) {
            Ok(task) => task,
            Err(halt) => {
                warn!("No task selected: {}", halt.message);
                return Ok(CycleReport {
                    task_id: match selection {
                        Selection::Id(id) => Some(id),
                        _ => None,
                    },
                    stage: Some(halt.stage),
                    failure: Some(Failure {
                        class: halt.class,
                        message: halt.message,
                    }),
                    ..CycleReport::default()
                });
            }
        };

        info!("Selected task {} ({})", task.short_id(), task.title);
        let task = match self.store.set_status(&task.id, TaskStatus::InProgress) {
            Ok(task) => task,
            Err(e) => {
                return Ok(CycleReport {
                    task_id: Some(task.id.clone()),
                    stage: Some(Stage::Select),
                    failure: Some(Failure {
                        class: e.class(),
                        message: e.to_string(),
                    }),
                    ..CycleReport::default()
                });
            }
        };
        self.engine.attach_task(&task);
        record(&self.ledger, &task, "selected", Value::Null);

        let mut attempt = Attempt {
            report: CycleReport {
                task_id: Some(task.id.clone()),
                ..CycleReport::default()
            },
            task,
            pre_patch: None,
        };
        let result = match self.drive(&mut attempt) {
            Ok(()) => {
                attempt.report.success = true;
                info!("{}", attempt.report.summary());
                Ok(attempt.report)
            }
            Err(halt) => self.recover(attempt, halt),
        };
        self.engine.detach_task();

        if let Ok(report) = &result {
            self.spawn_analysis(report);
        }
        result
    }

    /// Block until every outstanding analysis hook has finished.
    pub fn wait_for_analysis(&mut self) {
        for handle in self.analysis.drain(..) {
            if handle.join().is_err() {
                warn!("Analysis hook panicked");
            }
        }
    }

    /// Generate placeholder work when no open task can be executed. Skipped
    /// while enough non-executable open tasks are already waiting.
    fn ensure_backlog(&self) -> anyhow::Result<usize> {
        let count = self.settings.replenish_count;
        if count == 0 {
            return Ok(0);
        }
        let open = self.store.list(StatusFilter::Only(TaskStatus::Open))?;
        if open.iter().any(Task::is_executable) || open.len() >= count {
            return Ok(0);
        }

        let drafts = self.generator.generate(TaskKind::Micro, count)?;
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            ids.push(self.store.add(draft)?.id);
        }
        info!("Backlog replenished with {} task(s)", ids.len());
        if let Err(e) = self.ledger.save_event(
            REPLENISH_EVENT_ID,
            "Auto-replenish",
            "backlog_replenished",
            json!({ "count": ids.len(), "task_ids": ids }),
        ) {
            warn!("Failed to record backlog replenishment: {}", e);
        }
        Ok(ids.len())
    }

    fn select(&self, selection: &Selection) -> Result<Task, Halt> {
        let candidates: Vec<Task> = self
            .store
            .list(StatusFilter::Only(TaskStatus::Open))
            .map_err(|e| Halt::store(Stage::Select, e))?
            .into_iter()
            .filter(Task::is_executable)
            .collect();

        match selection {
            Selection::Id(id) => {
                let task = self.store.get(id).map_err(|e| Halt::store(Stage::Select, e))?;
                if task.status != TaskStatus::Open {
                    return Err(Halt::new(
                        Stage::Select,
                        ErrorClass::Precondition,
                        format!("Task {} is {}, not open", id, task.status),
                    ));
                }
                if !task.is_executable() {
                    return Err(Halt::new(
                        Stage::Select,
                        ErrorClass::Precondition,
                        format!("Task {} carries no patch material", id),
                    ));
                }
                Ok(task)
            }
            Selection::FirstAvailable => candidates.into_iter().next().ok_or_else(no_candidates),
            Selection::Interactive => {
                if candidates.is_empty() {
                    return Err(no_candidates());
                }
                let items: Vec<String> = candidates
                    .iter()
                    .map(|t| format!("[{}] {} ({})", t.short_id(), t.title, t.kind))
                    .collect();
                let picked = Select::with_theme(&ColorfulTheme::default())
                    .with_prompt("Select a task to run")
                    .items(&items)
                    .default(0)
                    .interact()
                    .map_err(|e| {
                        Halt::new(Stage::Select, ErrorClass::Io, format!("Selection prompt failed: {e}"))
                    })?;
                Ok(candidates[picked].clone())
            }
        }
    }

    fn drive(&mut self, attempt: &mut Attempt) -> Result<(), Halt> {
        let task = attempt.task.clone();

        if self.settings.isolate_branch {
            let branch = format!("{}{}", self.settings.branch_prefix, task.short_id());
            let base = self.settings.base_ref.clone();
            self.engine
                .isolate_branch(&branch, &base)
                .map_err(|e| Halt::engine(Stage::IsolateBranch, &e))?;
            record(
                &self.ledger,
                &task,
                "branch_isolated",
                json!({ "branch": branch, "base": base }),
            );
        }

        let diff = self.build_patch(attempt)?;
        self.review(attempt, &diff)?;

        let head = self
            .engine
            .head()
            .map_err(|e| Halt::new(Stage::Apply, e.class(), e.to_string()))?;
        if let Err(e) = self.engine.apply(&diff, false) {
            if !matches!(e, EngineError::Tool { operation: "apply --check", .. }) {
                attempt.pre_patch = Some(head);
            }
            return Err(Halt::engine(Stage::Apply, &e));
        }
        attempt.pre_patch = Some(head);
        record(&self.ledger, &task, "patch_applied", Value::Null);

        let tests = self.engine.run_tests(self.settings.tests_path.as_deref());
        let passed = tests.passed;
        let output = tests.output.clone();
        let exit_code = tests.exit_code;
        attempt.report.test_report = Some(tests);
        if !passed {
            return Err(Halt::tests_failed(exit_code, output));
        }
        record(
            &self.ledger,
            &task,
            "tests_passed",
            json!({ "duration_ms": attempt.report.test_report.as_ref().map(|t| t.duration_ms) }),
        );

        let message = commit_message(&task);
        let sha = self
            .engine
            .commit(&message)
            .map_err(|e| Halt::engine(Stage::Commit, &e))?;
        attempt.pre_patch = None;
        attempt.report.commit = Some(sha.clone());
        record(&self.ledger, &task, "committed", json!({ "commit_sha": sha }));

        self.finalize(&task, &diff)
    }

    fn build_patch(&self, attempt: &mut Attempt) -> Result<String, Halt> {
        let task = &attempt.task;
        let Some(material) = task.material() else {
            return Err(Halt::new(
                Stage::BuildPatch,
                ErrorClass::Structural,
                "Task carries no patch material",
            ));
        };
        record(&self.ledger, task, "build_patch", Value::Null);
        match self.builder.build_material(material) {
            Ok(diff) => {
                record(&self.ledger, task, "patch_built", json!({ "patch": diff }));
                attempt.report.diff = Some(diff.clone());
                Ok(diff)
            }
            Err(PatchError::NoOp) => {
                info!("Task {} produced an empty diff", task.short_id());
                attempt.report.no_op = true;
                record(&self.ledger, task, "no_op", Value::Null);
                Err(Halt::new(
                    Stage::BuildPatch,
                    ErrorClass::NoOp,
                    PatchError::NoOp.to_string(),
                )
                .recorded())
            }
            Err(e) => Err(Halt::new(Stage::BuildPatch, e.class(), e.to_string())),
        }
    }

    /// Run every gate in order. Each gate is introduced on the engine first,
    /// so a commit needs it to have passed.
    fn review(&mut self, attempt: &mut Attempt, diff: &str) -> Result<(), Halt> {
        let task = &attempt.task;
        for gate in self.gates.iter_mut() {
            let name = gate.name().to_string();
            self.engine.introduce_gate(&name);
            let verdict = match gate.review(diff, task) {
                Ok(verdict) => verdict,
                Err(e) => {
                    return Err(Halt::new(
                        Stage::Review,
                        ErrorClass::ExternalTool,
                        format!("Gate {name} failed to run: {e:#}"),
                    ));
                }
            };
            record(
                &self.ledger,
                task,
                "patch_reviewed",
                json!({ "gate": name, "verdict": verdict }),
            );
            attempt.report.reviews.push(GateReview {
                gate: name.clone(),
                verdict: verdict.clone(),
            });
            if !verdict.pass {
                record(
                    &self.ledger,
                    task,
                    "failed_review",
                    json!({ "gate": name, "comments": verdict.comments }),
                );
                return Err(Halt::new(
                    Stage::Review,
                    ErrorClass::Precondition,
                    format!("Gate {} rejected the patch: {}", name, verdict.comments),
                )
                .recorded());
            }
            self.engine.mark_gate(&name);
        }
        Ok(())
    }

    fn finalize(&self, task: &Task, diff: &str) -> Result<(), Halt> {
        let done = self
            .store
            .set_status(&task.id, TaskStatus::Done)
            .map_err(|e| Halt::store(Stage::Finalize, e))?;
        record(&self.ledger, &done, "status_done", Value::Null);

        let archived = self
            .store
            .archive_completed()
            .map_err(|e| Halt::store(Stage::Finalize, e))?;
        let current = self.store.get(&task.id).unwrap_or(done);
        record(&self.ledger, &current, "archived", json!({ "count": archived }));

        let paths = touched_paths(diff);
        let fingerprints = fingerprints_for(self.builder.root(), &paths);
        let refreshed = self
            .store
            .refresh_fingerprints(&fingerprints)
            .map_err(|e| Halt::store(Stage::Finalize, e))?;
        if !refreshed.is_empty() {
            info!("Refreshed fingerprints in {} open task(s)", refreshed.len());
            record(
                &self.ledger,
                &current,
                "fingerprints_propagated",
                json!({ "paths": paths, "tasks": refreshed }),
            );
        }
        Ok(())
    }

    fn recover(&mut self, attempt: Attempt, halt: Halt) -> Result<CycleReport, CycleError> {
        let Attempt {
            task,
            mut report,
            pre_patch,
        } = attempt;

        if !halt.recorded {
            record(
                &self.ledger,
                &task,
                &format!("failed_{}", halt.stage),
                json!({ "error": halt.message, "class": halt.class }),
            );
        }
        report.stage = Some(halt.stage);
        report.failure = Some(Failure {
            class: halt.class,
            message: halt.message.clone(),
        });

        if let Some(revision) = pre_patch {
            match self.engine.reset_hard(&revision) {
                Ok(()) => {
                    report.rolled_back = true;
                    record(
                        &self.ledger,
                        &task,
                        "rollback_succeeded",
                        json!({ "revision": revision }),
                    );
                }
                Err(source) => {
                    error!(
                        "Rollback of task {} to {} failed: {}",
                        task.id, revision, source
                    );
                    record(
                        &self.ledger,
                        &task,
                        "rollback_failed",
                        json!({ "revision": revision, "error": source.to_string() }),
                    );
                    return Err(CycleError::RollbackFailed {
                        task_id: task.id.clone(),
                        stage: halt.stage,
                        source,
                    });
                }
            }
        }

        let blocked = halt.stage.is_remediable() && self.remediate(&task, &halt, &mut report);
        if !blocked && halt.stage != Stage::Finalize {
            if let Err(e) = self.store.set_status(&task.id, TaskStatus::Open) {
                warn!("Failed to reopen task {}: {}", task.id, e);
            }
        }
        warn!("{}", report.summary());
        Ok(report)
    }

    /// Ask the responder for follow-up tasks. Returns `true` when children
    /// were created and the task is now blocked on them.
    fn remediate(&self, task: &Task, halt: &Halt, report: &mut CycleReport) -> bool {
        if !self.settings.remediation {
            return false;
        }
        let Some(responder) = &self.responder else {
            return false;
        };
        let depth = self.remediation_depth(task);
        if depth >= self.settings.max_depth {
            info!(
                "Task {} is {} level(s) deep; not proposing follow-ups",
                task.short_id(),
                depth
            );
            return false;
        }

        let ctx = FailureContext {
            task,
            stage: halt.stage,
            error: &halt.message,
            diff: report.diff.as_deref(),
            test_output: halt.test_output.as_deref(),
            depth,
        };
        let drafts = match responder.handle(&ctx) {
            Ok(Some(drafts)) => drafts,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failure responder failed for task {}: {:#}", task.id, e);
                return false;
            }
        };

        let mut children = Vec::new();
        for draft in drafts.into_iter().take(self.settings.max_children) {
            match self.store.add(draft.with_parent(&task.id)) {
                Ok(child) => children.push(child.id),
                Err(e) => warn!("Failed to add follow-up for task {}: {}", task.id, e),
            }
        }
        if children.is_empty() {
            return false;
        }

        match self.store.set_status(&task.id, TaskStatus::Blocked) {
            Ok(blocked) => record(
                &self.ledger,
                &blocked,
                "remediation_proposed",
                json!({ "children": children, "depth": depth }),
            ),
            Err(e) => warn!("Failed to block task {}: {}", task.id, e),
        }
        info!(
            "Proposed {} follow-up task(s) for {}",
            children.len(),
            task.short_id()
        );
        report.remediation = children;
        true
    }

    /// Number of ancestors along the `parent_id` chain.
    fn remediation_depth(&self, task: &Task) -> usize {
        let mut depth = 0;
        let mut parent = task.parent_id.clone();
        while let Some(id) = parent {
            if depth > self.settings.max_depth {
                break;
            }
            depth += 1;
            parent = self.store.get(&id).ok().and_then(|t| t.parent_id);
        }
        depth
    }

    fn spawn_analysis(&mut self, report: &CycleReport) {
        let Some(hook) = self.hook.clone() else {
            return;
        };
        let Some(task_id) = report.task_id.clone() else {
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        let report = report.clone();
        let spawned = thread::Builder::new()
            .name("patchline-analysis".to_string())
            .spawn(move || match hook.analyse(&report) {
                Ok(telemetry) => {
                    let data = json!({ "kind": "analysis", "telemetry": telemetry });
                    if let Err(e) = ledger.append_iteration(&task_id, data) {
                        warn!("Failed to record analysis for task {}: {}", task_id, e);
                    }
                }
                Err(e) => warn!("Analysis hook failed for task {}: {:#}", task_id, e),
            });
        match spawned {
            Ok(handle) => self.analysis.push(handle),
            Err(e) => warn!("Failed to start analysis hook: {}", e),
        }
    }
}

fn no_candidates() -> Halt {
    Halt::new(
        Stage::Select,
        ErrorClass::Precondition,
        "No open task carries patch material",
    )
}

fn commit_message(task: &Task) -> String {
    task.change_set
        .as_ref()
        .map(|cs| cs.message.trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("[patchline] {} {}", task.short_id(), task.title))
}

/// Ledger writes never fail a cycle.
fn record(ledger: &AuditLedger, task: &Task, state: &str, extra: Value) {
    if let Err(e) = ledger.save(task, state, extra) {
        warn!("Failed to record {} for task {}: {}", state, task.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::ReviewVerdict;
    use crate::testing::{commit_file, init_repo, state_dir};
    use anyhow::bail;
    use chrono::Utc;
    use patchline_common::{ChangeSet, FileEdit, TaskDraft};
    use std::fs;
    use tempfile::TempDir;

    const FIX: &str = "diff --git a/calc.txt b/calc.txt\n\
                       --- a/calc.txt\n\
                       +++ b/calc.txt\n\
                       @@ -1 +1 @@\n\
                       -x-y\n\
                       +x+y\n";

    struct Rig {
        orchestrator: Orchestrator,
        dir: TempDir,
    }

    fn rig(test_command: &str, settings: CycleSettings) -> Rig {
        let dir = init_repo();
        commit_file(dir.path(), "calc.txt", "x-y\n", "init");
        let state = state_dir(dir.path());
        let store = Arc::new(TaskStore::open(state.join("tasks.json")).unwrap());
        let ledger = Arc::new(AuditLedger::open(state.join("ledger.json")).unwrap());
        let tree = GitWorkTree::open(dir.path()).unwrap();
        let runner = TestRunner::new(test_command, dir.path());
        let engine = ExecutionEngine::new(tree, runner, Arc::clone(&ledger));
        let builder = PatchBuilder::new(dir.path());
        Rig {
            orchestrator: Orchestrator::new(store, ledger, engine, builder, settings),
            dir,
        }
    }

    fn no_branch() -> CycleSettings {
        CycleSettings {
            isolate_branch: false,
            ..CycleSettings::default()
        }
    }

    fn add(rig: &Rig, draft: TaskDraft) -> Task {
        rig.orchestrator.store().add(draft).unwrap()
    }

    struct Rejecting;

    impl ReviewGate for Rejecting {
        fn name(&self) -> &str {
            "style"
        }

        fn review(&mut self, _diff: &str, _task: &Task) -> anyhow::Result<ReviewVerdict> {
            Ok(ReviewVerdict::fail("needs work"))
        }
    }

    struct Broken;

    impl AnalysisHook for Broken {
        fn analyse(&self, _report: &CycleReport) -> anyhow::Result<Value> {
            bail!("analysis backend unavailable")
        }
    }

    #[test]
    fn test_successful_cycle_commits_and_archives() {
        let mut rig = rig("grep -q 'x+y' calc.txt", no_branch());
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));

        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert!(report.success, "{}", report.summary());
        assert!(report.commit.is_some());
        assert_eq!(
            rig.orchestrator.store().get(&task.id).unwrap().status,
            TaskStatus::Archived
        );
        let states = rig.orchestrator.ledger().states(&task.id).unwrap();
        assert_eq!(
            states,
            vec![
                "selected",
                "build_patch",
                "patch_built",
                "patch_applied",
                "tests_passed",
                "committed",
                "status_done",
                "archived"
            ]
        );
    }

    #[test]
    fn test_isolated_branch_is_created() {
        let mut rig = rig("true", CycleSettings::default());
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));
        let report = rig.orchestrator.run_cycle(Selection::Id(task.id.clone())).unwrap();
        assert!(report.success, "{}", report.summary());
        assert_eq!(
            rig.orchestrator.engine().work_tree().current_branch(),
            Some(format!("patchline/{}", task.short_id()))
        );
    }

    #[test]
    fn test_rejecting_gate_aborts_before_apply() {
        let mut rig = rig("true", no_branch());
        rig.orchestrator = rig.orchestrator.with_gate(Rejecting);
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));

        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert!(!report.success);
        assert_eq!(report.stage, Some(Stage::Review));
        assert!(!report.rolled_back);
        assert_eq!(report.reviews[0].verdict.comments, "needs work");
        assert_eq!(fs::read_to_string(rig.dir.path().join("calc.txt")).unwrap(), "x-y\n");
        let states = rig.orchestrator.ledger().states(&task.id).unwrap();
        assert_eq!(states.last().map(String::as_str), Some("failed_review"));
        assert_eq!(
            rig.orchestrator.store().get(&task.id).unwrap().status,
            TaskStatus::Open
        );
    }

    #[test]
    fn test_failing_tests_roll_back_and_propose_children() {
        let mut rig = rig("exit 1", no_branch());
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));

        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert_eq!(report.stage, Some(Stage::Test));
        assert!(report.rolled_back);
        assert_eq!(report.remediation.len(), 2);
        assert_eq!(fs::read_to_string(rig.dir.path().join("calc.txt")).unwrap(), "x-y\n");

        let store = rig.orchestrator.store();
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Blocked);
        for child in &report.remediation {
            assert_eq!(store.get(child).unwrap().parent_id.as_deref(), Some(task.id.as_str()));
        }
        let states = rig.orchestrator.ledger().states(&task.id).unwrap();
        let failed = states.iter().position(|s| s == "failed_tests").unwrap();
        let rolled = states.iter().position(|s| s == "rollback_succeeded").unwrap();
        assert!(failed < rolled);
        assert_eq!(states.last().map(String::as_str), Some("remediation_proposed"));
    }

    #[test]
    fn test_failed_rollback_escalates() {
        // A directory where the index file belongs makes the reset unable to
        // write the index.
        let mut rig = rig("rm -f .git/index && mkdir .git/index && exit 1", no_branch());
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));

        let err = rig
            .orchestrator
            .run_cycle(Selection::FirstAvailable)
            .unwrap_err();
        match &err {
            CycleError::RollbackFailed { task_id, stage, .. } => {
                assert_eq!(task_id, &task.id);
                assert_eq!(*stage, Stage::Test);
            }
            other => panic!("Expected RollbackFailed, got {:?}", other),
        }

        let states = rig.orchestrator.ledger().states(&task.id).unwrap();
        assert!(states.iter().any(|s| s == "failed_tests"));
        assert!(states.iter().any(|s| s == "failed_reset_hard"));
        assert!(!states.iter().any(|s| s == "rollback_succeeded"));
        assert_eq!(states.last().map(String::as_str), Some("rollback_failed"));

        let store = rig.orchestrator.store();
        assert!(store.list(StatusFilter::All).unwrap().iter().all(|t| t.parent_id.is_none()));
    }

    #[test]
    fn test_remediation_stops_at_max_depth() {
        let settings = CycleSettings {
            max_depth: 1,
            ..no_branch()
        };
        let mut rig = rig("exit 1", settings);
        let root = add(&rig, TaskDraft::new("root"));
        let child = add(&rig, TaskDraft::new("child").with_parent(&root.id).with_patch(FIX));

        let report = rig.orchestrator.run_cycle(Selection::Id(child.id.clone())).unwrap();
        assert_eq!(report.stage, Some(Stage::Test));
        assert!(report.remediation.is_empty());
        assert_eq!(
            rig.orchestrator.store().get(&child.id).unwrap().status,
            TaskStatus::Open
        );
    }

    #[test]
    fn test_no_op_is_reported_distinctly() {
        let mut rig = rig("true", no_branch());
        let change = ChangeSet::new("noop").with_edit(FileEdit::modify("calc.txt", "x-y\n"));
        let task = add(&rig, TaskDraft::new("already done").with_change_set(change));

        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert!(!report.success);
        assert!(report.no_op);
        assert_eq!(report.stage, Some(Stage::BuildPatch));
        assert_eq!(report.failure.unwrap().class, ErrorClass::NoOp);
        let states = rig.orchestrator.ledger().states(&task.id).unwrap();
        assert_eq!(states.last().map(String::as_str), Some("no_op"));
    }

    #[test]
    fn test_selection_skips_tasks_without_material() {
        let mut rig = rig("true", no_branch());
        add(&rig, TaskDraft::new("idea only"));
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));
        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert_eq!(report.task_id.as_deref(), Some(task.id.as_str()));
        assert!(report.success, "{}", report.summary());
    }

    #[test]
    fn test_empty_backlog_is_replenished() {
        let mut rig = rig("true", no_branch());
        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert_eq!(report.stage, Some(Stage::Select));
        assert_eq!(report.failure.unwrap().class, ErrorClass::Precondition);

        let open = rig
            .orchestrator
            .store()
            .list(StatusFilter::Only(TaskStatus::Open))
            .unwrap();
        assert_eq!(open.len(), 3);
        let events = rig.orchestrator.ledger().states(REPLENISH_EVENT_ID).unwrap();
        assert_eq!(events, vec!["backlog_replenished"]);

        // placeholders already waiting: no second batch
        rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        assert_eq!(rig.orchestrator.store().list(StatusFilter::All).unwrap().len(), 3);
    }

    #[test]
    fn test_fingerprints_propagate_to_open_tasks() {
        let mut rig = rig("true", no_branch());
        let first = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));
        let stale = ChangeSet::new("later").with_edit(
            FileEdit::modify("calc.txt", "x*y\n")
                .with_before_sha(patchline_common::fingerprint(b"x-y\n")),
        );
        let second = add(&rig, TaskDraft::new("follow up").with_change_set(stale));

        let report = rig.orchestrator.run_cycle(Selection::Id(first.id.clone())).unwrap();
        assert!(report.success, "{}", report.summary());
        let refreshed = rig.orchestrator.store().get(&second.id).unwrap();
        let sha = refreshed.change_set.unwrap().edits[0].before_sha.clone();
        assert_eq!(sha, Some(patchline_common::fingerprint(b"x+y\n")));
    }

    #[test]
    fn test_analysis_failure_never_changes_report() {
        let mut rig = rig("true", no_branch());
        rig.orchestrator = rig.orchestrator.with_analysis_hook(Broken);
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));
        let report = rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        rig.orchestrator.wait_for_analysis();
        assert!(report.success);
        let record = rig.orchestrator.ledger().record(&task.id).unwrap().unwrap();
        assert!(record.iterations.is_empty());
    }

    #[test]
    fn test_analysis_telemetry_is_appended() {
        let mut rig = rig("true", no_branch());
        rig.orchestrator = rig.orchestrator.with_analysis_hook(DiffStatsHook);
        let task = add(&rig, TaskDraft::new("fix calc").with_patch(FIX));
        rig.orchestrator.run_cycle(Selection::FirstAvailable).unwrap();
        rig.orchestrator.wait_for_analysis();
        let record = rig.orchestrator.ledger().record(&task.id).unwrap().unwrap();
        assert_eq!(record.iterations.len(), 1);
        assert_eq!(record.iterations[0].data["telemetry"]["lines_added"], 1);
    }

    #[test]
    fn test_commit_message_prefers_change_set_message() {
        let task = TaskDraft::new("t")
            .with_change_set(ChangeSet::new("Fix the adder"))
            .into_task(Utc::now())
            .unwrap();
        assert_eq!(commit_message(&task), "Fix the adder");

        let bare = TaskDraft::new("Tidy up").with_id("abcdef123456").into_task(Utc::now()).unwrap();
        assert_eq!(commit_message(&bare), "[patchline] abcdef12 Tidy up");
    }
}
