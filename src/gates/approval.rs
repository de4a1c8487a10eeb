//! Interactive human approval of a patch before it touches the tree.

use super::{ReviewGate, ReviewVerdict};
use crate::patch::touched_paths;
use anyhow::Result;
use dialoguer::{Select, theme::ColorfulTheme};
use patchline_common::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    /// Approve this and every later patch in the session.
    ApprovedAll,
    Rejected,
}

pub struct ApprovalGate {
    /// Patches touching at most this many files are approved without asking.
    pub auto_threshold: usize,
    pub skip_all: bool,
}

impl ApprovalGate {
    pub fn new(auto_threshold: usize, skip_all: bool) -> Self {
        Self {
            auto_threshold,
            skip_all,
        }
    }

    /// Decide without prompting when possible.
    fn auto_decision(&self, files: usize) -> Option<&'static str> {
        if self.skip_all {
            Some("auto-approved (--yes)")
        } else if files > 0 && files <= self.auto_threshold {
            Some("auto-approved (within file threshold)")
        } else {
            None
        }
    }

    fn prompt_user(&mut self, task: &Task, diff: &str, files: &[String]) -> Result<ApprovalDecision> {
        println!();
        println!(
            "{} {}",
            console::style(format!("[{}]", task.short_id())).cyan(),
            console::style(&task.title).bold()
        );
        for path in files {
            println!("  {}", console::style(path).dim());
        }
        println!("  {} line(s) of diff", diff.lines().count());

        let options = &[
            "Yes, apply this patch",
            "Yes, and auto-approve remaining patches (--yes)",
            "No, reject this patch",
        ];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Apply this patch?")
            .items(options)
            .default(0)
            .interact()?;

        Ok(match selection {
            0 => ApprovalDecision::Approved,
            1 => {
                self.skip_all = true;
                ApprovalDecision::ApprovedAll
            }
            _ => ApprovalDecision::Rejected,
        })
    }
}

impl ReviewGate for ApprovalGate {
    fn name(&self) -> &str {
        "approval"
    }

    fn review(&mut self, diff: &str, task: &Task) -> Result<ReviewVerdict> {
        let files = touched_paths(diff);
        if let Some(reason) = self.auto_decision(files.len()) {
            return Ok(ReviewVerdict::pass(reason));
        }
        Ok(match self.prompt_user(task, diff, &files)? {
            ApprovalDecision::Approved | ApprovalDecision::ApprovedAll => {
                ReviewVerdict::pass("approved by operator")
            }
            ApprovalDecision::Rejected => ReviewVerdict::fail("rejected by operator"),
        })
    }
}
