//! Git working tree operations.
//!
//! Branch, commit, reset and HEAD lookups go through `git2`. Patches are
//! checked and applied with the `git apply` CLI, which reads diffs exactly
//! as the patch builder writes them.

use crate::errors::EngineError;
use crate::process::run_captured;
use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, IndexAddOption, Repository, ResetType, Signature, Status, StatusOptions};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct GitWorkTree {
    repo: Repository,
    root: PathBuf,
}

impl GitWorkTree {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let repo = Repository::open(path)?;
        let root = repo
            .workdir()
            .ok_or_else(|| {
                git2::Error::from_str("repository has no working directory (bare repository)")
            })?
            .to_path_buf();
        Ok(Self { repo, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full id of the commit HEAD points at.
    pub fn head(&self) -> Result<String, EngineError> {
        let commit = self.repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Name of the checked-out branch, if HEAD is not detached.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if head.is_branch() {
            head.shorthand().map(str::to_string)
        } else {
            None
        }
    }

    /// Create `name` at `base` (or reuse it if it exists) and check it out.
    pub fn isolate_branch(&self, name: &str, base: &str) -> Result<(), EngineError> {
        let branch = match self.repo.find_branch(name, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let base_commit = self.repo.revparse_single(base)?.peel_to_commit()?;
                self.repo.branch(name, &base_commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let refname = branch
            .get()
            .name()
            .ok_or_else(|| git2::Error::from_str("branch name is not valid UTF-8"))?
            .to_string();
        let target = branch.get().peel_to_commit()?;

        let mut checkout = CheckoutBuilder::new();
        checkout.safe();
        self.repo.checkout_tree(target.as_object(), Some(&mut checkout))?;
        self.repo.set_head(&refname)?;
        debug!("Checked out {} at {}", refname, target.id());
        Ok(())
    }

    /// `git apply --check [-R]`: fails without touching the tree.
    pub fn check_patch(&self, diff: &str, reverse: bool) -> Result<(), EngineError> {
        self.git_apply(diff, reverse, true)
    }

    pub fn apply_patch(&self, diff: &str, reverse: bool) -> Result<(), EngineError> {
        self.git_apply(diff, reverse, false)
    }

    /// Stage everything, including deletions, and commit on HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String, EngineError> {
        let mut index = self.repo.index()?;
        index.read(false)?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            return Err(EngineError::Tool {
                operation: "commit",
                output: "nothing to commit, working tree clean".to_string(),
            });
        }

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("patchline", "patchline@localhost"))?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(oid.to_string())
    }

    /// Hard reset tracked files to `reference` and delete untracked files
    /// that are not ignored.
    pub fn reset_hard(&self, reference: &str) -> Result<(), EngineError> {
        let target = self.repo.revparse_single(reference)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .reset(&target, ResetType::Hard, Some(&mut checkout))?;
        self.remove_untracked()
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn dirty_paths(&self) -> Result<Vec<String>, EngineError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT)
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect())
    }

    fn remove_untracked(&self) -> Result<(), EngineError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let untracked: Vec<String> = self
            .repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|entry| entry.status().contains(Status::WT_NEW))
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();

        let mut parents = BTreeSet::new();
        for rel in &untracked {
            let path = self.root.join(rel);
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!("Removed untracked {}", rel),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(EngineError::Io { path, source }),
            }
            let mut dir = path.parent();
            while let Some(d) = dir.filter(|d| *d != self.root && d.starts_with(&self.root)) {
                parents.insert(d.to_path_buf());
                dir = d.parent();
            }
        }
        // Deepest first; directories that still hold files are kept.
        for dir in parents.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    fn git_apply(&self, diff: &str, reverse: bool, check_only: bool) -> Result<(), EngineError> {
        let mut args = vec!["apply"];
        if check_only {
            args.push("--check");
        }
        if reverse {
            args.push("-R");
        }
        args.push("-");

        let out = run_captured("git", &args, &self.root, Some(diff.as_bytes())).map_err(|source| {
            EngineError::Spawn {
                command: format!("git {}", args.join(" ")),
                source,
            }
        })?;
        if out.success() {
            Ok(())
        } else {
            Err(EngineError::Tool {
                operation: if check_only { "apply --check" } else { "apply" },
                output: out.combined(),
            })
        }
    }
}
