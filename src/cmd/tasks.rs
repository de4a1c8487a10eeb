//! Backlog commands (`patchline list`, `add`, `remove`, `archive`).

use anyhow::{Context, Result};
use std::path::Path;

use patchline::config::Config;
use patchline::store::{StatusFilter, TaskStore};
use patchline_common::{ChangeSet, LegacyDiff, TaskDraft};

/// Task fields accepted by `patchline add`.
pub struct AddArgs<'a> {
    pub title: &'a str,
    pub kind: Option<&'a str>,
    pub description: Option<&'a str>,
    pub parent: Option<&'a str>,
    pub change_set: Option<&'a Path>,
    pub patch: Option<&'a Path>,
    pub legacy: Option<&'a Path>,
}

fn open_store(config: &Config) -> Result<TaskStore> {
    let store = if config.toml.storage.cross_process_lock {
        TaskStore::open_shared(config.tasks_file(), config.lock_timeout())?
    } else {
        TaskStore::open(config.tasks_file())?
    };
    Ok(store)
}

pub fn cmd_list(project_dir: &Path, status: &str) -> Result<()> {
    let filter: StatusFilter = status.parse()?;
    let config = Config::load(project_dir)?;
    let store = open_store(&config)?;
    let tasks = store.list(filter)?;

    if tasks.is_empty() {
        println!("(Backlog empty)");
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<8} {:<20} Title",
        "Id", "Status", "Type", "Created"
    );
    println!(
        "{:<10} {:<12} {:<8} {:<20} -----",
        "--------", "----------", "------", "-------------------"
    );
    for task in &tasks {
        let marker = if task.is_executable() { "" } else { " (no patch)" };
        println!(
            "{:<10} {:<12} {:<8} {:<20} {}{}",
            task.short_id(),
            task.status.as_str(),
            task.kind.as_str(),
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            task.title,
            console::style(marker).dim()
        );
    }
    Ok(())
}

pub fn cmd_add(project_dir: &Path, args: AddArgs<'_>) -> Result<()> {
    let config = Config::load(project_dir)?;
    config.ensure_state_dir()?;
    let store = open_store(&config)?;

    let mut draft = TaskDraft::new(args.title);
    if let Some(kind) = args.kind {
        draft.kind = Some(kind.to_string());
    }
    if let Some(description) = args.description {
        draft = draft.with_meta("description", description);
    }
    if let Some(parent) = args.parent {
        draft = draft.with_parent(parent);
    }
    if let Some(path) = args.change_set {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read change set: {}", path.display()))?;
        let change_set: ChangeSet = serde_json::from_str(&content)
            .with_context(|| format!("Invalid change set JSON: {}", path.display()))?;
        change_set
            .validate()
            .with_context(|| format!("Invalid change set: {}", path.display()))?;
        draft = draft.with_change_set(change_set);
    }
    if let Some(path) = args.patch {
        let diff = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch: {}", path.display()))?;
        draft = draft.with_patch(diff);
    }
    if let Some(path) = args.legacy {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read diff descriptor: {}", path.display()))?;
        let legacy: LegacyDiff = serde_json::from_str(&content)
            .with_context(|| format!("Invalid diff descriptor JSON: {}", path.display()))?;
        draft = draft.with_legacy_diff(legacy);
    }

    let task = store.add(draft)?;
    println!(
        "Added task {} {}",
        console::style(&task.id).cyan(),
        console::style(&task.title).bold()
    );
    Ok(())
}

pub fn cmd_remove(project_dir: &Path, id: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = open_store(&config)?;
    store.remove(id)?;
    println!("Archived task {}", id);
    Ok(())
}

pub fn cmd_archive(project_dir: &Path) -> Result<()> {
    let config = Config::load(project_dir)?;
    let store = open_store(&config)?;
    let count = store.archive_completed()?;
    println!("Archived {} completed task(s)", count);
    Ok(())
}
