//! Shared fixtures for unit tests: throwaway git repositories.

use git2::Repository;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fresh repository with a local identity configured.
pub fn init_repo() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    dir
}

/// Write `name` and commit every change in the tree. Returns the commit id.
pub fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
    let repo = Repository::open(dir).unwrap();
    let file_path = dir.join(name);
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&file_path, content).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    let oid = match repo.head() {
        Ok(head) => {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        }
        Err(_) => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[]).unwrap(),
    };
    oid.to_string()
}

/// Create the ignored pipeline state directory inside `repo`.
pub fn state_dir(repo: &Path) -> PathBuf {
    let dir = repo.join(crate::config::STATE_DIR);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(".gitignore"), "*\n").unwrap();
    dir
}
