//! Phase flags and the commit guard.
//!
//! Each attached task gets a fresh [`PhaseFlags`]. Mandatory phases are
//! always required before a commit; optional ones (branch isolation and
//! review gates) become required once they are introduced during the run.

use crate::errors::EngineError;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseFlag {
    BranchIsolated,
    PatchApplied,
    TestsPassed,
    Committed,
    /// `<gate>_passed` for a named review gate.
    Gate(String),
}

impl PhaseFlag {
    pub fn gate(name: impl Into<String>) -> Self {
        PhaseFlag::Gate(name.into())
    }

    /// Parse a label such as `tests_passed` or `review_passed`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "branch_isolated" => PhaseFlag::BranchIsolated,
            "patch_applied" => PhaseFlag::PatchApplied,
            "tests_passed" => PhaseFlag::TestsPassed,
            "committed" => PhaseFlag::Committed,
            other => PhaseFlag::Gate(other.strip_suffix("_passed").unwrap_or(other).to_string()),
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, PhaseFlag::BranchIsolated | PhaseFlag::Gate(_))
    }
}

impl fmt::Display for PhaseFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseFlag::BranchIsolated => f.write_str("branch_isolated"),
            PhaseFlag::PatchApplied => f.write_str("patch_applied"),
            PhaseFlag::TestsPassed => f.write_str("tests_passed"),
            PhaseFlag::Committed => f.write_str("committed"),
            PhaseFlag::Gate(name) => write!(f, "{name}_passed"),
        }
    }
}

const MANDATORY_FOR_COMMIT: [PhaseFlag; 2] = [PhaseFlag::PatchApplied, PhaseFlag::TestsPassed];

/// Completed and introduced phases for the task currently in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseFlags {
    completed: BTreeSet<PhaseFlag>,
    introduced: BTreeSet<PhaseFlag>,
}

impl PhaseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an optional phase is part of this run, whether or not it
    /// ends up passing.
    pub fn introduce(&mut self, flag: PhaseFlag) {
        if flag.is_optional() {
            self.introduced.insert(flag);
        }
    }

    pub fn mark(&mut self, flag: PhaseFlag) {
        self.introduce(flag.clone());
        self.completed.insert(flag);
    }

    pub fn clear(&mut self, flag: &PhaseFlag) {
        self.completed.remove(flag);
    }

    pub fn has(&self, flag: &PhaseFlag) -> bool {
        self.completed.contains(flag)
    }

    pub fn completed(&self) -> impl Iterator<Item = &PhaseFlag> {
        self.completed.iter()
    }

    pub fn introduced(&self) -> impl Iterator<Item = &PhaseFlag> {
        self.introduced.iter()
    }

    /// Flags a commit needs: the mandatory pair, every introduced optional
    /// flag, and any configured always-required flags.
    pub fn required_for_commit(&self, always: &[PhaseFlag]) -> Vec<PhaseFlag> {
        let mut required: Vec<PhaseFlag> = MANDATORY_FOR_COMMIT.to_vec();
        for flag in self.introduced.iter().chain(always) {
            if !required.contains(flag) {
                required.push(flag.clone());
            }
        }
        required
    }
}

/// Fail with a `Precondition` error naming every flag in `required` that has
/// not been completed.
pub fn require_phases(
    flags: &PhaseFlags,
    operation: &'static str,
    required: &[PhaseFlag],
) -> Result<(), EngineError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|flag| !flags.has(flag))
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Precondition { operation, missing })
    }
}
