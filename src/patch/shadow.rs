//! Disposable copy of the working tree that edits are applied to.

use crate::errors::PatchError;
use patchline_common::{EditMode, FileEdit};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::{DirEntry, WalkDir};

pub(crate) struct ShadowTree {
    _dir: TempDir,
    root: PathBuf,
}

impl ShadowTree {
    /// Copy `source` into a fresh temporary directory, skipping `.git`
    /// anywhere and the `excluded` top-level names. Symlinks are not copied.
    pub fn materialize(source: &Path, excluded: &[String]) -> Result<Self, PatchError> {
        let dir = tempfile::Builder::new()
            .prefix("patchline-shadow-")
            .tempdir()
            .map_err(|source| PatchError::Shadow {
                path: std::env::temp_dir(),
                source,
            })?;
        let root = dir.path().join("shadow");
        fs::create_dir_all(&root).map_err(|e| shadow_err(&root, e))?;
        let root = root.canonicalize().map_err(|e| shadow_err(&root, e))?;

        let walker = WalkDir::new(source)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_excluded(e, excluded));
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(source).to_path_buf();
                PatchError::Shadow {
                    path,
                    source: e.into(),
                }
            })?;
            let Ok(rel) = entry.path().strip_prefix(source) else {
                continue;
            };
            let dest = root.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&dest).map_err(|e| shadow_err(&dest, e))?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &dest).map_err(|e| shadow_err(&dest, e))?;
            }
        }

        Ok(Self { _dir: dir, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply one edit at the already normalized `path`.
    pub fn apply(&self, path: &str, edit: &FileEdit) -> Result<(), PatchError> {
        let target = self.root.join(path);
        match edit.mode {
            EditMode::Delete => {
                if target.is_file() {
                    fs::remove_file(&target).map_err(|e| shadow_err(&target, e))?;
                }
            }
            EditMode::Add | EditMode::Modify => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| shadow_err(parent, e))?;
                }
                let content = edit.after.as_deref().unwrap_or_default();
                fs::write(&target, content).map_err(|e| shadow_err(&target, e))?;
            }
        }
        Ok(())
    }
}

fn is_excluded(entry: &DirEntry, excluded: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    name == ".git" || (entry.depth() == 1 && excluded.iter().any(|e| *e == name))
}

fn shadow_err(path: &Path, source: std::io::Error) -> PatchError {
    PatchError::Shadow {
        path: path.to_path_buf(),
        source,
    }
}
