use super::headers::relativize_headers;
use super::shadow::ShadowTree;
use crate::config::STATE_DIR;
use crate::errors::PatchError;
use crate::process::run_captured;
use patchline_common::{
    ChangeSet, LegacyDiff, PatchMaterial, fingerprint_file, normalize_path,
};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEV_NULL: &str = "/dev/null";

/// Turns patch material into a unified diff that applies to the working tree
/// at `root`. Building never modifies the working tree.
#[derive(Debug, Clone)]
pub struct PatchBuilder {
    root: PathBuf,
    excluded: Vec<String>,
}

impl PatchBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: vec![STATE_DIR.to_string()],
        }
    }

    /// Skip another top-level directory when copying the tree.
    pub fn with_excluded(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Diff for whichever material the task carries. A ready-made diff is
    /// passed through with a trailing newline ensured.
    pub fn build_material(&self, material: PatchMaterial<'_>) -> Result<String, PatchError> {
        match material {
            PatchMaterial::Built(diff) => finish(diff.to_string()),
            PatchMaterial::ChangeSet(change_set) => self.build(change_set),
            PatchMaterial::Legacy(legacy) => self.build_legacy(legacy),
        }
    }

    /// Build a verified diff from a change set.
    pub fn build(&self, change_set: &ChangeSet) -> Result<String, PatchError> {
        change_set.validate()?;
        let paths = change_set.touched_paths()?;
        self.verify_fingerprints(change_set)?;

        let shadow = ShadowTree::materialize(&self.root, &self.excluded)?;
        for edit in &change_set.edits {
            shadow.apply(&edit.normalized_path()?, edit)?;
        }

        let mut raw = String::new();
        for path in &paths {
            let original = self.root.join(path);
            let shadowed = shadow.root().join(path);
            let left = if original.is_file() {
                path.clone()
            } else {
                DEV_NULL.to_string()
            };
            let right = if shadowed.is_file() {
                shadowed.to_string_lossy().into_owned()
            } else {
                DEV_NULL.to_string()
            };
            if left == DEV_NULL && right == DEV_NULL {
                continue;
            }
            raw.push_str(&no_index_diff(&self.root, path, &left, &right)?);
        }

        let shadow_root = shadow.root().to_string_lossy();
        let roots = vec![shadow_root.trim_start_matches('/').to_string()];
        let diff = finish(relativize_headers(&raw, &roots))?;
        self.check_applies(&diff)?;
        debug!(
            "Built patch touching {} path(s), {} bytes",
            paths.len(),
            diff.len()
        );
        Ok(diff)
    }

    /// Build a verified diff straight from a before/after pair. An empty
    /// `before` creates the file and an empty `after` deletes it. Non-empty
    /// sides are read as complete lines.
    pub fn build_legacy(&self, legacy: &LegacyDiff) -> Result<String, PatchError> {
        let path = normalize_path(&legacy.file)?;
        let before = with_final_newline(&legacy.before);
        let after = with_final_newline(&legacy.after);
        if before == after {
            return Err(PatchError::NoOp);
        }

        let scratch = tempfile::Builder::new()
            .prefix("patchline-legacy-")
            .tempdir()
            .map_err(|source| PatchError::Shadow {
                path: std::env::temp_dir(),
                source,
            })?;
        let left = write_side(scratch.path(), "before", &path, &before)?;
        let right = write_side(scratch.path(), "after", &path, &after)?;

        let raw = no_index_diff(scratch.path(), &path, &left, &right)?;
        let diff = finish(relativize_headers(
            &raw,
            &["before".to_string(), "after".to_string()],
        ))?;
        self.check_applies(&diff)?;
        Ok(diff)
    }

    /// `git apply --check` the diff against the working tree.
    pub fn check_applies(&self, diff: &str) -> Result<(), PatchError> {
        let out = run_captured("git", ["apply", "--check", "-"], &self.root, Some(diff.as_bytes()))
            .map_err(|source| PatchError::Spawn {
                command: "git apply --check".to_string(),
                source,
            })?;
        if out.success() {
            Ok(())
        } else {
            Err(PatchError::DoesNotApply {
                output: out.combined(),
            })
        }
    }

    fn verify_fingerprints(&self, change_set: &ChangeSet) -> Result<(), PatchError> {
        for edit in &change_set.edits {
            let Some(expected) = edit.before_sha.as_deref() else {
                continue;
            };
            let path = edit.normalized_path()?;
            let full = self.root.join(&path);
            let actual = match fingerprint_file(&full) {
                Ok(sha) => Some(sha),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(source) => return Err(PatchError::Shadow { path: full, source }),
            };
            if actual.as_deref() != Some(expected.to_ascii_lowercase().as_str()) {
                return Err(PatchError::Conflict {
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn with_final_newline(content: &str) -> Cow<'_, str> {
    if content.is_empty() || content.ends_with('\n') {
        Cow::Borrowed(content)
    } else {
        Cow::Owned(format!("{content}\n"))
    }
}

/// Write one side of a legacy diff under `scratch/<side>/<path>` and return
/// the argument to pass to `git diff`.
fn write_side(scratch: &Path, side: &str, path: &str, content: &str) -> Result<String, PatchError> {
    if content.is_empty() {
        return Ok(DEV_NULL.to_string());
    }
    let target = scratch.join(side).join(path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| PatchError::Shadow {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&target, content).map_err(|source| PatchError::Shadow {
        path: target.clone(),
        source,
    })?;
    Ok(format!("{side}/{path}"))
}

/// `git diff --no-index` between two paths. Exit code 1 means "differences
/// found" and is not an error.
fn no_index_diff(cwd: &Path, label: &str, left: &str, right: &str) -> Result<String, PatchError> {
    let out = run_captured(
        "git",
        [
            "diff",
            "--no-index",
            "--binary",
            "--no-color",
            "--no-ext-diff",
            "--no-renames",
            "--src-prefix=a/",
            "--dst-prefix=b/",
            "--",
            left,
            right,
        ],
        cwd,
        None,
    )
    .map_err(|source| PatchError::Spawn {
        command: "git diff --no-index".to_string(),
        source,
    })?;
    match out.code {
        Some(0) => Ok(String::new()),
        Some(1) => Ok(out.stdout),
        _ => Err(PatchError::DiffFailed {
            path: label.to_string(),
            output: out.combined(),
        }),
    }
}

fn finish(mut diff: String) -> Result<String, PatchError> {
    if diff.trim().is_empty() {
        return Err(PatchError::NoOp);
    }
    if !diff.ends_with('\n') {
        diff.push('\n');
    }
    Ok(diff)
}
