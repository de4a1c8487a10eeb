//! Task records and their normalization.

use crate::change_set::{ChangeSet, LegacyDiff};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A string did not name a known enum value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {field} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub field: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// A draft could not be turned into a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("Task title is required")]
    MissingTitle,

    #[error(transparent)]
    Invalid(#[from] ParseEnumError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Micro,
    Story,
    Epic,
    Blueprint,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Micro => "micro",
            TaskKind::Story => "story",
            TaskKind::Epic => "epic",
            TaskKind::Blueprint => "blueprint",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "micro" => Ok(TaskKind::Micro),
            "story" => Ok(TaskKind::Story),
            "epic" => Ok(TaskKind::Epic),
            "blueprint" => Ok(TaskKind::Blueprint),
            other => Err(ParseEnumError {
                field: "type",
                value: other.to_string(),
                expected: "micro, story, epic, blueprint",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Done,
    Archived,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Open,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Archived,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Archived => "archived",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                field: "status",
                value: s.to_string(),
                expected: "open, in_progress, done, archived, blocked",
            })
    }
}

/// A unit of work as persisted in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<LegacyDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Any other keys, preserved verbatim.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Borrowed view of the material a task can be turned into a patch from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatchMaterial<'a> {
    /// A ready-made unified diff.
    Built(&'a str),
    ChangeSet(&'a ChangeSet),
    Legacy(&'a LegacyDiff),
}

impl Task {
    /// Patch material by priority: built diff, then change set, then legacy
    /// descriptor. A blank built diff counts as absent.
    pub fn material(&self) -> Option<PatchMaterial<'_>> {
        if let Some(patch) = self.patch.as_deref().filter(|p| !p.trim().is_empty()) {
            return Some(PatchMaterial::Built(patch));
        }
        if let Some(change_set) = &self.change_set {
            return Some(PatchMaterial::ChangeSet(change_set));
        }
        self.diff.as_ref().map(PatchMaterial::Legacy)
    }

    pub fn is_executable(&self) -> bool {
        self.material().is_some()
    }

    /// First eight characters of the id, used for branch names and display.
    pub fn short_id(&self) -> &str {
        self.id
            .char_indices()
            .nth(8)
            .map(|(idx, _)| &self.id[..idx])
            .unwrap_or(&self.id)
    }

    pub fn description(&self) -> Option<&str> {
        self.metadata.get("description").and_then(Value::as_str)
    }
}

/// Loosely typed input for creating a task.
///
/// Kind and status are kept as strings so invalid values surface as a
/// [`DraftError`] rather than a deserialization failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<LegacyDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind.as_str().to_string());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        self.patch = Some(patch.into());
        self
    }

    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.change_set = Some(change_set);
        self
    }

    pub fn with_legacy_diff(mut self, diff: LegacyDiff) -> Self {
        self.diff = Some(diff);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fill defaults and validate: a fresh UUID when no id is given,
    /// `created_at = now`, kind `micro`, status `open`.
    pub fn into_task(self, now: DateTime<Utc>) -> Result<Task, DraftError> {
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or(DraftError::MissingTitle)?;
        let kind = match self.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => TaskKind::default(),
        };
        let status = match self.status.as_deref() {
            Some(status) => status.parse()?,
            None => TaskStatus::default(),
        };
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Task {
            id,
            title,
            kind,
            status,
            created_at: self.created_at.unwrap_or(now),
            patch: self.patch,
            change_set: self.change_set,
            diff: self.diff,
            parent_id: self.parent_id,
            metadata: self.metadata,
        })
    }
}

impl From<Task> for TaskDraft {
    fn from(task: Task) -> Self {
        Self {
            id: Some(task.id),
            title: Some(task.title),
            kind: Some(task.kind.as_str().to_string()),
            status: Some(task.status.as_str().to_string()),
            created_at: Some(task.created_at),
            patch: task.patch,
            change_set: task.change_set,
            diff: task.diff,
            parent_id: task.parent_id,
            metadata: task.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_set::FileEdit;

    #[test]
    fn test_into_task_fills_defaults() {
        let now = Utc::now();
        let task = TaskDraft::new("Fix add").into_task(now).unwrap();
        assert_eq!(task.title, "Fix add");
        assert_eq!(task.kind, TaskKind::Micro);
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.created_at, now);
        assert_eq!(task.id.len(), 36);
    }

    #[test]
    fn test_into_task_rejects_bad_status() {
        let err = TaskDraft::new("x")
            .with_status("finished")
            .into_task(Utc::now())
            .unwrap_err();
        match err {
            DraftError::Invalid(e) => {
                assert_eq!(e.field, "status");
                assert_eq!(e.value, "finished");
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_into_task_requires_title() {
        assert_eq!(
            TaskDraft::default().into_task(Utc::now()),
            Err(DraftError::MissingTitle)
        );
        assert_eq!(
            TaskDraft::new("   ").into_task(Utc::now()),
            Err(DraftError::MissingTitle)
        );
    }

    #[test]
    fn test_material_priority() {
        let cs = ChangeSet::new("m").with_edit(FileEdit::add("a.txt", "a\n"));
        let mut task = TaskDraft::new("t")
            .with_change_set(cs)
            .with_legacy_diff(LegacyDiff::new("b.txt", "", "b\n"))
            .with_patch("   \n")
            .into_task(Utc::now())
            .unwrap();
        assert!(matches!(task.material(), Some(PatchMaterial::ChangeSet(_))));

        task.patch = Some("diff --git a/x b/x\n".into());
        assert!(matches!(task.material(), Some(PatchMaterial::Built(_))));

        task.patch = None;
        task.change_set = None;
        assert!(matches!(task.material(), Some(PatchMaterial::Legacy(_))));

        task.diff = None;
        assert!(!task.is_executable());
    }

    #[test]
    fn test_metadata_round_trips_through_json() {
        let json = r#"{
            "id": "t-1",
            "title": "Refactor",
            "type": "story",
            "status": "blocked",
            "created_at": "2024-01-02T03:04:05Z",
            "description": "split module",
            "priority": 2
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.kind, TaskKind::Story);
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.description(), Some("split module"));
        assert_eq!(task.metadata.get("priority"), Some(&Value::from(2)));

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "story");
        assert_eq!(value["priority"], 2);
        assert!(value.get("patch").is_none());
    }

    #[test]
    fn test_short_id() {
        let mut task = TaskDraft::new("t").with_id("abcdef0123456789").into_task(Utc::now()).unwrap();
        assert_eq!(task.short_id(), "abcdef01");
        task.id = "abc".into();
        assert_eq!(task.short_id(), "abc");
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("closed".parse::<TaskStatus>().is_err());
    }
}
