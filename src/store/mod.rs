//! Task store: the persisted backlog.
//!
//! The whole collection lives in memory behind one `Mutex` and is written
//! back as a pretty JSON array after every mutation. Every public method
//! takes the mutex exactly once; the private helpers work on the already
//! locked collection, so composite operations never re-lock.
//!
//! With a [`FileLock`] attached, each operation also holds the advisory lock
//! on `<path>.lock` and reloads the file first, so several processes can
//! share one backlog.

mod update;

pub use update::{StatusFilter, TaskUpdate};

use crate::errors::StoreError;
use crate::lock::FileLock;
use crate::persist::{to_pretty_json, write_atomic};
use chrono::Utc;
use patchline_common::{Task, TaskDraft, TaskStatus, normalize_path};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

pub struct TaskStore {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
    file_lock: Option<FileLock>,
}

impl TaskStore {
    /// Open the store backed by `path`. A missing file is an empty backlog.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = load_tasks(&path)?;
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
            file_lock: None,
        })
    }

    /// Open the store with cross-process locking enabled.
    pub fn open_shared(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        let file_lock = FileLock::for_target(&path, lock_timeout);
        let tasks = {
            let _guard = file_lock.acquire()?;
            load_tasks(&path)?
        };
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
            file_lock: Some(file_lock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Normalize and persist a new task.
    pub fn add(&self, draft: TaskDraft) -> Result<Task, StoreError> {
        let task = draft.into_task(Utc::now())?;
        self.write(|tasks| {
            if tasks.iter().any(|t| t.id == task.id) {
                return Err(StoreError::DuplicateId { id: task.id.clone() });
            }
            tasks.push(task.clone());
            Ok(task)
        })
    }

    pub fn list(&self, filter: StatusFilter) -> Result<Vec<Task>, StoreError> {
        self.read(|tasks| {
            Ok(tasks
                .iter()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect())
        })
    }

    pub fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.read(|tasks| find(tasks, id).cloned())
    }

    /// Merge `update` into the task and persist. Returns the updated task.
    pub fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        self.write(|tasks| {
            let task = find_mut(tasks, id)?;
            update.apply_to(task);
            Ok(task.clone())
        })
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        self.update(id, TaskUpdate::status(status))
    }

    /// Soft delete: the task stays on disk with status `archived`.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.write(|tasks| {
            find_mut(tasks, id)?.status = TaskStatus::Archived;
            Ok(())
        })
    }

    /// Move every `done` task to `archived`. Returns how many moved.
    pub fn archive_completed(&self) -> Result<usize, StoreError> {
        let pending = self.read(|tasks| Ok(tasks.iter().any(|t| t.status == TaskStatus::Done)))?;
        if !pending {
            return Ok(0);
        }
        self.write(|tasks| {
            let mut archived = 0;
            for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Done) {
                task.status = TaskStatus::Archived;
                archived += 1;
            }
            Ok(archived)
        })
    }

    /// Point the `before_sha` of every open task's edits at the new content of
    /// the given paths. Returns the ids of tasks that changed.
    pub fn refresh_fingerprints(
        &self,
        fingerprints: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, StoreError> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        self.write(|tasks| {
            let mut refreshed = Vec::new();
            for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Open) {
                let Some(change_set) = task.change_set.as_mut() else {
                    continue;
                };
                let mut touched = false;
                for edit in &mut change_set.edits {
                    let Ok(path) = normalize_path(&edit.path) else {
                        continue;
                    };
                    if let Some(sha) = fingerprints.get(&path) {
                        if edit.before_sha.as_deref() != Some(sha.as_str()) {
                            edit.before_sha = Some(sha.clone());
                            touched = true;
                        }
                    }
                }
                if touched {
                    refreshed.push(task.id.clone());
                }
            }
            Ok(refreshed)
        })
    }

    /// Full copy of the backlog.
    pub fn export(&self) -> Result<Vec<Task>, StoreError> {
        self.list(StatusFilter::All)
    }

    /// Discard in-memory state and re-read the backing file.
    pub fn reload(&self) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().map_err(|_| StoreError::LockPoisoned)?;
        let _guard = self.file_lock.as_ref().map(FileLock::acquire).transpose()?;
        *tasks = load_tasks(&self.path)?;
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&[Task]) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut tasks = self.tasks.lock().map_err(|_| StoreError::LockPoisoned)?;
        let _guard = match &self.file_lock {
            Some(lock) => {
                let guard = lock.acquire()?;
                *tasks = load_tasks(&self.path)?;
                Some(guard)
            }
            None => None,
        };
        f(&tasks)
    }

    /// Run a mutation and persist the result. Nothing is written when `f`
    /// fails.
    fn write<R>(&self, f: impl FnOnce(&mut Vec<Task>) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut tasks = self.tasks.lock().map_err(|_| StoreError::LockPoisoned)?;
        let _guard = match &self.file_lock {
            Some(lock) => {
                let guard = lock.acquire()?;
                *tasks = load_tasks(&self.path)?;
                Some(guard)
            }
            None => None,
        };
        let mut staged = tasks.clone();
        let result = f(&mut staged)?;
        persist(&self.path, &staged)?;
        *tasks = staged;
        Ok(result)
    }
}

fn find<'a>(tasks: &'a [Task], id: &str) -> Result<&'a Task, StoreError> {
    tasks
        .iter()
        .find(|t| t.id == id)
        .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
}

fn find_mut<'a>(tasks: &'a mut [Task], id: &str) -> Result<&'a mut Task, StoreError> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
}

fn load_tasks(path: &Path) -> Result<Vec<Task>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let drafts: Vec<TaskDraft> =
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    // Hand-authored entries may omit the id or timestamp. Whatever gets
    // generated for them is written back so later loads see the same task.
    let filled = drafts.iter().any(|draft| {
        draft.created_at.is_none() || draft.id.as_deref().is_none_or(|id| id.trim().is_empty())
    });
    let now = Utc::now();
    let tasks = drafts
        .into_iter()
        .map(|draft| draft.into_task(now))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::new();
    if let Some(dup) = tasks.iter().find(|t| !seen.insert(t.id.as_str())) {
        return Err(StoreError::DuplicateId { id: dup.id.clone() });
    }

    if filled {
        debug!("Persisting generated ids and timestamps to {}", path.display());
        persist(path, &tasks)?;
    }
    debug!("Loaded {} task(s) from {}", tasks.len(), path.display());
    Ok(tasks)
}

fn persist(path: &Path, tasks: &[Task]) -> Result<(), StoreError> {
    let bytes = to_pretty_json(tasks).map_err(StoreError::Serialize)?;
    write_atomic(path, &bytes).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchline_common::{ChangeSet, DraftError, FileEdit, TaskKind};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn setup() -> (TaskStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.json")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_missing_file_is_empty_backlog() {
        let (store, _dir) = setup();
        assert!(store.export().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_normalizes_and_persists() {
        let (store, _dir) = setup();
        let task = store.add(TaskDraft::new("Fix add")).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.kind, TaskKind::Micro);

        let reopened = TaskStore::open(store.path()).unwrap();
        assert_eq!(reopened.get(&task.id).unwrap(), task);
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let (store, _dir) = setup();
        store.add(TaskDraft::new("a").with_id("t-1")).unwrap();
        let err = store.add(TaskDraft::new("b").with_id("t-1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { ref id } if id == "t-1"));
        assert_eq!(store.export().unwrap().len(), 1);
    }

    #[test]
    fn test_add_rejects_invalid_status_without_persisting() {
        let (store, _dir) = setup();
        let err = store
            .add(TaskDraft::new("bad").with_status("finished"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(DraftError::Invalid(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_open_listing_excludes_blocked() {
        let (store, _dir) = setup();
        let open = store.add(TaskDraft::new("open")).unwrap();
        let blocked = store.add(TaskDraft::new("blocked")).unwrap();
        store.set_status(&blocked.id, TaskStatus::Blocked).unwrap();

        let listed = store.list(StatusFilter::Only(TaskStatus::Open)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, open.id);
        assert_eq!(store.list(StatusFilter::All).unwrap().len(), 2);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (store, _dir) = setup();
        assert!(matches!(
            store.get("nope"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.update("nope", TaskUpdate::status(TaskStatus::Done)),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_merges_metadata() {
        let (store, _dir) = setup();
        let task = store
            .add(TaskDraft::new("t").with_meta("description", "first"))
            .unwrap();
        let updated = store
            .update(
                &task.id,
                TaskUpdate::default()
                    .with_title("renamed")
                    .with_meta("attempts", 2),
            )
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.description(), Some("first"));
        assert_eq!(updated.metadata["attempts"], 2);
    }

    #[test]
    fn test_remove_is_soft_delete() {
        let (store, _dir) = setup();
        let task = store.add(TaskDraft::new("t")).unwrap();
        store.remove(&task.id).unwrap();
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Archived);
    }

    #[test]
    fn test_archive_completed_counts_and_persists() {
        let (store, _dir) = setup();
        let a = store.add(TaskDraft::new("a")).unwrap();
        let b = store.add(TaskDraft::new("b")).unwrap();
        store.add(TaskDraft::new("c")).unwrap();
        store.set_status(&a.id, TaskStatus::Done).unwrap();
        store.set_status(&b.id, TaskStatus::Done).unwrap();

        assert_eq!(store.archive_completed().unwrap(), 2);
        assert_eq!(store.archive_completed().unwrap(), 0);

        let reopened = TaskStore::open(store.path()).unwrap();
        let archived = reopened
            .list(StatusFilter::Only(TaskStatus::Archived))
            .unwrap();
        assert_eq!(archived.len(), 2);
    }

    #[test]
    fn test_refresh_fingerprints_updates_open_tasks_only() {
        let (store, _dir) = setup();
        let cs = ChangeSet::new("m").with_edit(FileEdit::modify("./src/a.py", "x").with_before_sha("old"));
        let open = store.add(TaskDraft::new("open").with_change_set(cs.clone())).unwrap();
        let done = store.add(TaskDraft::new("done").with_change_set(cs)).unwrap();
        store.set_status(&done.id, TaskStatus::Done).unwrap();

        let mut shas = BTreeMap::new();
        shas.insert("src/a.py".to_string(), "new".to_string());
        let refreshed = store.refresh_fingerprints(&shas).unwrap();
        assert_eq!(refreshed, vec![open.id.clone()]);

        let open = store.get(&open.id).unwrap();
        assert_eq!(
            open.change_set.unwrap().edits[0].before_sha.as_deref(),
            Some("new")
        );
        let done = store.get(&done.id).unwrap();
        assert_eq!(
            done.change_set.unwrap().edits[0].before_sha.as_deref(),
            Some("old")
        );
    }

    #[test]
    fn test_non_array_document_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"{"id": "x"}"#).unwrap();
        assert!(matches!(
            TaskStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_renormalizes_stored_tasks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"[{"id": "legacy", "title": "old entry", "owner": "ops"}]"#).unwrap();
        let store = TaskStore::open(&path).unwrap();
        let task = store.get("legacy").unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.kind, TaskKind::Micro);
        assert_eq!(task.metadata["owner"], "ops");
    }

    #[test]
    fn test_generated_ids_are_stable_across_shared_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"[{"title": "hand authored", "patch": "diff --git a/x b/x\n"}]"#).unwrap();

        let store = TaskStore::open_shared(&path, Duration::from_secs(2)).unwrap();
        let listed = store.list(StatusFilter::All).unwrap();
        assert_eq!(listed.len(), 1);
        let id = listed[0].id.clone();
        let created_at = listed[0].created_at;

        assert_eq!(store.get(&id).unwrap().created_at, created_at);
        let started = store.set_status(&id, TaskStatus::InProgress).unwrap();
        assert_eq!(started.id, id);

        let other = TaskStore::open(&path).unwrap();
        assert_eq!(other.get(&id).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn test_duplicate_ids_on_disk_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, r#"[{"id": "t-1", "title": "a"}, {"id": "t-1", "title": "b"}]"#).unwrap();
        assert!(matches!(
            TaskStore::open(&path),
            Err(StoreError::DuplicateId { ref id }) if id == "t-1"
        ));
    }

    #[test]
    fn test_reload_picks_up_external_writes() {
        let (store, _dir) = setup();
        store.add(TaskDraft::new("a")).unwrap();
        let other = TaskStore::open(store.path()).unwrap();
        other.add(TaskDraft::new("b")).unwrap();

        assert_eq!(store.export().unwrap().len(), 1);
        store.reload().unwrap();
        assert_eq!(store.export().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_adds_are_all_persisted() {
        let (store, _dir) = setup();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .add(TaskDraft::new(format!("task {worker}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = TaskStore::open(store.path()).unwrap();
        let tasks = reopened.export().unwrap();
        assert_eq!(tasks.len(), 200);
        let mut ids: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_shared_stores_see_each_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let first = TaskStore::open_shared(&path, Duration::from_secs(2)).unwrap();
        let second = TaskStore::open_shared(&path, Duration::from_secs(2)).unwrap();

        let task = first.add(TaskDraft::new("shared")).unwrap();
        assert_eq!(second.get(&task.id).unwrap().title, "shared");
        second.set_status(&task.id, TaskStatus::Blocked).unwrap();
        assert_eq!(first.get(&task.id).unwrap().status, TaskStatus::Blocked);
    }
}
