use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One point-in-time snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: String,
    pub timestamp: DateTime<Utc>,
    /// Full copy of the task at the time of the snapshot.
    pub task: Value,
    #[serde(default)]
    pub extra: Value,
}

/// Free-form telemetry appended after the fact, e.g. post-cycle analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Everything the ledger knows about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Snapshot>,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
}

impl AuditRecord {
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            created_at: now,
            history: Vec::new(),
            iterations: Vec::new(),
        }
    }

    /// Snapshot states in the order they were recorded.
    pub fn states(&self) -> Vec<&str> {
        self.history.iter().map(|s| s.state.as_str()).collect()
    }

    pub fn last_state(&self) -> Option<&str> {
        self.history.last().map(|s| s.state.as_str())
    }
}
