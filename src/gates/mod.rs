//! Review gates run between building a patch and applying it.
//!
//! A gate only reads the diff. Before a gate runs its flag is introduced on
//! the engine, so a commit is refused unless the gate later passed.

mod approval;
mod rules;

pub use approval::ApprovalGate;
pub use rules::{Rule, RuleConfig, RuleKind, RuleReviewer};

use anyhow::Result;
use patchline_common::Task;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub pass: bool,
    pub comments: String,
}

impl ReviewVerdict {
    pub fn pass(comments: impl Into<String>) -> Self {
        Self {
            pass: true,
            comments: comments.into(),
        }
    }

    pub fn fail(comments: impl Into<String>) -> Self {
        Self {
            pass: false,
            comments: comments.into(),
        }
    }
}

pub trait ReviewGate {
    /// Short name; the phase flag is `<name>_passed`.
    fn name(&self) -> &str;

    fn review(&mut self, diff: &str, task: &Task) -> Result<ReviewVerdict>;
}
