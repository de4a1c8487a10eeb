//! Built-in rule-based reviewer.

use super::{ReviewGate, ReviewVerdict};
use anyhow::Result;
use patchline_common::Task;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_LINES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// The pattern must not appear in any added line.
    Forbid,
    /// The pattern must appear somewhere in the diff.
    Require,
}

/// A pattern rule as written in `patchline.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub kind: RuleKind,
    pub pattern: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    NotEmpty,
    LooksLikeDiff,
    NoTodo,
    MaxLines(usize),
    Forbid { pattern: String, message: String },
    Require { pattern: String, message: String },
}

impl Rule {
    /// `None` when the diff satisfies the rule, otherwise the reason.
    fn check(&self, diff: &str) -> Option<String> {
        match self {
            Rule::NotEmpty => diff.trim().is_empty().then(|| "Patch is empty".to_string()),
            Rule::LooksLikeDiff => {
                let start = diff.trim_start();
                let ok = ["---", "diff ", "@@ "].iter().any(|p| start.starts_with(p));
                (!ok).then(|| "Patch does not look like a unified diff".to_string())
            }
            Rule::NoTodo => added_lines(diff)
                .any(|line| line.contains("TODO"))
                .then(|| "Patch adds a TODO marker".to_string()),
            Rule::MaxLines(max) => {
                let count = diff.lines().count();
                (count > *max).then(|| format!("Patch has {count} lines (limit {max})"))
            }
            Rule::Forbid { pattern, message } => added_lines(diff)
                .any(|line| line.contains(pattern.as_str()))
                .then(|| message.clone()),
            Rule::Require { pattern, message } => {
                (!diff.contains(pattern.as_str())).then(|| message.clone())
            }
        }
    }
}

impl From<&RuleConfig> for Rule {
    fn from(config: &RuleConfig) -> Self {
        match config.kind {
            RuleKind::Forbid => Rule::Forbid {
                pattern: config.pattern.clone(),
                message: config
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Patch adds forbidden pattern '{}'", config.pattern)),
            },
            RuleKind::Require => Rule::Require {
                pattern: config.pattern.clone(),
                message: config
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Patch is missing required pattern '{}'", config.pattern)),
            },
        }
    }
}

fn added_lines(diff: &str) -> impl Iterator<Item = &str> {
    diff.lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
}

/// Checks a diff against an ordered rule list and stops at the first
/// failure.
#[derive(Debug, Clone)]
pub struct RuleReviewer {
    name: String,
    rules: Vec<Rule>,
}

impl Default for RuleReviewer {
    fn default() -> Self {
        Self {
            name: "review".to_string(),
            rules: vec![
                Rule::NotEmpty,
                Rule::LooksLikeDiff,
                Rule::NoTodo,
                Rule::MaxLines(DEFAULT_MAX_LINES),
            ],
        }
    }
}

impl RuleReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_configured_rules(mut self, configs: &[RuleConfig]) -> Self {
        self.rules.extend(configs.iter().map(Rule::from));
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl ReviewGate for RuleReviewer {
    fn name(&self) -> &str {
        &self.name
    }

    fn review(&mut self, diff: &str, _task: &Task) -> Result<ReviewVerdict> {
        for rule in &self.rules {
            if let Some(reason) = rule.check(diff) {
                return Ok(ReviewVerdict::fail(reason));
            }
        }
        Ok(ReviewVerdict::pass(format!("{} rule(s) passed", self.rules.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use patchline_common::TaskDraft;

    const DIFF: &str = "diff --git a/a.rs b/a.rs\n--- a/a.rs\n+++ b/a.rs\n@@ -1 +1 @@\n-old\n+new\n";

    fn task() -> Task {
        TaskDraft::new("t").into_task(Utc::now()).unwrap()
    }

    #[test]
    fn test_default_rules_pass_clean_diff() {
        let verdict = RuleReviewer::new().review(DIFF, &task()).unwrap();
        assert!(verdict.pass, "{}", verdict.comments);
    }

    #[test]
    fn test_rejects_empty_and_non_diff() {
        let mut reviewer = RuleReviewer::new();
        assert_eq!(
            reviewer.review("  \n", &task()).unwrap(),
            ReviewVerdict::fail("Patch is empty")
        );
        assert!(!reviewer.review("hello world\n", &task()).unwrap().pass);
        assert!(reviewer.review("@@ -1 +1 @@\n-a\n+b\n", &task()).unwrap().pass);
    }

    #[test]
    fn test_rejects_added_todo_only() {
        let mut reviewer = RuleReviewer::new();
        let added = DIFF.replace("+new", "+new // TODO tidy");
        assert!(!reviewer.review(&added, &task()).unwrap().pass);
        let removed = DIFF.replace("-old", "-old // TODO tidy");
        assert!(reviewer.review(&removed, &task()).unwrap().pass);
    }

    #[test]
    fn test_max_lines() {
        let mut reviewer = RuleReviewer {
            name: "review".into(),
            rules: vec![Rule::MaxLines(3)],
        };
        let verdict = reviewer.review(DIFF, &task()).unwrap();
        assert!(!verdict.pass);
        assert!(verdict.comments.contains("limit 3"));
    }

    #[test]
    fn test_configured_patterns() {
        let configs = vec![
            RuleConfig {
                kind: RuleKind::Forbid,
                pattern: "dbg!(".into(),
                message: Some("debug macro left in patch".into()),
            },
            RuleConfig {
                kind: RuleKind::Require,
                pattern: "a.rs".into(),
                message: None,
            },
        ];
        let mut reviewer = RuleReviewer::new().with_configured_rules(&configs);
        assert!(reviewer.review(DIFF, &task()).unwrap().pass);

        let with_dbg = DIFF.replace("+new", "+dbg!(new)");
        assert_eq!(
            reviewer.review(&with_dbg, &task()).unwrap().comments,
            "debug macro left in patch"
        );

        let other_file = DIFF.replace("a.rs", "b.rs");
        let verdict = reviewer.review(&other_file, &task()).unwrap();
        assert!(verdict.comments.contains("missing required pattern 'a.rs'"));
    }

    #[test]
    fn test_rule_config_parses_from_toml() {
        let config: RuleConfig =
            toml::from_str("kind = \"forbid\"\npattern = \"unsafe\"\n").unwrap();
        assert_eq!(config.kind, RuleKind::Forbid);
        assert!(config.message.is_none());
    }
}
