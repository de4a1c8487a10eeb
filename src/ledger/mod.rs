//! Append-only audit ledger.
//!
//! One [`AuditRecord`] per task id, each holding the ordered snapshot history
//! and any iteration telemetry. Snapshots are never edited or removed; the
//! file is rewritten atomically after every append.

mod record;

pub use record::{AuditRecord, Iteration, Snapshot};

use crate::errors::LedgerError;
use crate::lock::FileLock;
use crate::persist::{to_pretty_json, write_atomic};
use chrono::Utc;
use patchline_common::Task;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Records {
    records: Vec<AuditRecord>,
    index: HashMap<String, usize>,
}

impl Records {
    fn from_vec(records: Vec<AuditRecord>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.task_id.clone(), i))
            .collect();
        Self { records, index }
    }

    fn get(&self, task_id: &str) -> Option<&AuditRecord> {
        self.index.get(task_id).map(|&i| &self.records[i])
    }

    fn get_mut(&mut self, task_id: &str) -> Option<&mut AuditRecord> {
        self.index.get(task_id).map(|&i| &mut self.records[i])
    }

    fn get_or_create(&mut self, task_id: &str) -> &mut AuditRecord {
        let idx = match self.index.get(task_id) {
            Some(&idx) => idx,
            None => {
                self.records.push(AuditRecord::new(task_id, Utc::now()));
                let idx = self.records.len() - 1;
                self.index.insert(task_id.to_string(), idx);
                idx
            }
        };
        &mut self.records[idx]
    }
}

pub struct AuditLedger {
    path: PathBuf,
    inner: Mutex<Records>,
    file_lock: Option<FileLock>,
}

impl AuditLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let records = load_records(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Records::from_vec(records)),
            file_lock: None,
        })
    }

    /// Open the ledger with cross-process locking enabled.
    pub fn open_shared(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, LedgerError> {
        let mut ledger = Self::open(path)?;
        ledger.file_lock = Some(FileLock::for_target(&ledger.path, lock_timeout));
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a snapshot of `task` in `state`, creating the record if needed.
    pub fn save(&self, task: &Task, state: &str, extra: Value) -> Result<(), LedgerError> {
        let task_value = serde_json::to_value(task).map_err(LedgerError::Serialize)?;
        self.append_snapshot(&task.id, state, task_value, extra)
    }

    /// Snapshot for an event that is not tied to a stored task.
    pub fn save_event(
        &self,
        task_id: &str,
        title: &str,
        state: &str,
        extra: Value,
    ) -> Result<(), LedgerError> {
        let pseudo = serde_json::json!({ "id": task_id, "title": title });
        self.append_snapshot(task_id, state, pseudo, extra)
    }

    /// Append telemetry to an existing record. Non-object data is wrapped
    /// under a `value` key.
    pub fn append_iteration(&self, task_id: &str, data: Value) -> Result<(), LedgerError> {
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.write(|records| {
            let record = records
                .get_mut(task_id)
                .ok_or_else(|| LedgerError::NoRecord {
                    task_id: task_id.to_string(),
                })?;
            record.iterations.push(Iteration {
                timestamp: Utc::now(),
                data,
            });
            Ok(())
        })
    }

    /// Copy of every record.
    pub fn load(&self) -> Result<Vec<AuditRecord>, LedgerError> {
        self.read(|records| Ok(records.records.clone()))
    }

    pub fn record(&self, task_id: &str) -> Result<Option<AuditRecord>, LedgerError> {
        self.read(|records| Ok(records.get(task_id).cloned()))
    }

    pub fn history(&self, task_id: &str) -> Result<Vec<Snapshot>, LedgerError> {
        self.read(|records| {
            Ok(records
                .get(task_id)
                .map(|r| r.history.clone())
                .unwrap_or_default())
        })
    }

    pub fn states(&self, task_id: &str) -> Result<Vec<String>, LedgerError> {
        self.read(|records| {
            Ok(records
                .get(task_id)
                .map(|r| r.states().into_iter().map(str::to_string).collect())
                .unwrap_or_default())
        })
    }

    fn append_snapshot(
        &self,
        task_id: &str,
        state: &str,
        task: Value,
        extra: Value,
    ) -> Result<(), LedgerError> {
        let extra = if extra.is_null() {
            Value::Object(Map::new())
        } else {
            extra
        };
        self.write(|records| {
            records.get_or_create(task_id).history.push(Snapshot {
                state: state.to_string(),
                timestamp: Utc::now(),
                task,
                extra,
            });
            Ok(())
        })
    }

    fn read<R>(&self, f: impl FnOnce(&Records) -> Result<R, LedgerError>) -> Result<R, LedgerError> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let _guard = match &self.file_lock {
            Some(lock) => {
                let guard = lock.acquire()?;
                *inner = Records::from_vec(load_records(&self.path)?);
                Some(guard)
            }
            None => None,
        };
        f(&inner)
    }

    fn write(&self, f: impl FnOnce(&mut Records) -> Result<(), LedgerError>) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let _guard = match &self.file_lock {
            Some(lock) => {
                let guard = lock.acquire()?;
                *inner = Records::from_vec(load_records(&self.path)?);
                Some(guard)
            }
            None => None,
        };
        f(&mut inner)?;
        persist(&self.path, &inner.records)
    }
}

fn load_records(path: &Path) -> Result<Vec<AuditRecord>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|source| LedgerError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn persist(path: &Path, records: &[AuditRecord]) -> Result<(), LedgerError> {
    let bytes = to_pretty_json(records).map_err(LedgerError::Serialize)?;
    write_atomic(path, &bytes).map_err(|source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    })
}
