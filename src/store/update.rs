use patchline_common::{ChangeSet, ParseEnumError, Task, TaskStatus};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Which tasks a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(TaskStatus),
}

impl StatusFilter {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(status) => task.status == *status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(StatusFilter::All);
        }
        s.parse().map(StatusFilter::Only)
    }
}

/// Fields to merge into an existing task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub title: Option<String>,
    pub parent_id: Option<String>,
    pub change_set: Option<ChangeSet>,
    pub metadata: Map<String, Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.change_set = Some(change_set);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(parent_id) = &self.parent_id {
            task.parent_id = Some(parent_id.clone());
        }
        if let Some(change_set) = &self.change_set {
            task.change_set = Some(change_set.clone());
        }
        for (key, value) in &self.metadata {
            task.metadata.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_filter_parse() {
        assert_eq!("all".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!(
            "in_progress".parse::<StatusFilter>().unwrap(),
            StatusFilter::Only(TaskStatus::InProgress)
        );
        assert!("pending".parse::<StatusFilter>().is_err());
    }
}
