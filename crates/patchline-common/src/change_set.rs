//! Structured change format.
//!
//! A [`ChangeSet`] describes edits as whole-file contents rather than hunks.
//! The patch builder turns it into a unified diff against the live tree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Structural problems with a change set or legacy diff descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeSetError {
    #[error("Change set has no edits")]
    NoEdits,

    #[error("Edit for '{path}' ({mode}) is missing 'after' content")]
    MissingContent { path: String, mode: EditMode },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    Add,
    #[default]
    Modify,
    Delete,
}

impl EditMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditMode::Add => "add",
            EditMode::Modify => "modify",
            EditMode::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EditMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file-level edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    #[serde(default)]
    pub mode: EditMode,
    /// Full new contents; required for add and modify.
    #[serde(default)]
    pub after: Option<String>,
    /// Fingerprint of the file this edit was written against.
    #[serde(default)]
    pub before_sha: Option<String>,
}

impl FileEdit {
    pub fn add(path: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: EditMode::Add,
            after: Some(after.into()),
            before_sha: None,
        }
    }

    pub fn modify(path: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: EditMode::Modify,
            after: Some(after.into()),
            before_sha: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: EditMode::Delete,
            after: None,
            before_sha: None,
        }
    }

    pub fn with_before_sha(mut self, sha: impl Into<String>) -> Self {
        self.before_sha = Some(sha.into());
        self
    }

    /// Repository-relative, forward-slash form of `path`.
    pub fn normalized_path(&self) -> Result<String, ChangeSetError> {
        normalize_path(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub edits: Vec<FileEdit>,
}

impl ChangeSet {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_edit(mut self, edit: FileEdit) -> Self {
        self.edits.push(edit);
        self
    }

    /// Check the change set is well formed without touching any files.
    pub fn validate(&self) -> Result<(), ChangeSetError> {
        if self.edits.is_empty() {
            return Err(ChangeSetError::NoEdits);
        }
        for edit in &self.edits {
            let path = edit.normalized_path()?;
            if edit.mode != EditMode::Delete && edit.after.is_none() {
                return Err(ChangeSetError::MissingContent {
                    path,
                    mode: edit.mode,
                });
            }
        }
        Ok(())
    }

    /// Normalized paths of every edit, in edit order without duplicates.
    pub fn touched_paths(&self) -> Result<Vec<String>, ChangeSetError> {
        let mut paths: Vec<String> = Vec::with_capacity(self.edits.len());
        for edit in &self.edits {
            let path = edit.normalized_path()?;
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

/// Legacy before/after descriptor for a single file.
///
/// An empty `before` means the file is created, an empty `after` means it is
/// deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDiff {
    pub file: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
}

impl LegacyDiff {
    pub fn new(file: impl Into<String>, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            before: before.into(),
            after: after.into(),
        }
    }
}

/// Normalize a repository-relative path.
///
/// Backslashes become forward slashes, `.` components and repeated
/// separators are dropped. Absolute paths and `..` components are rejected.
pub fn normalize_path(raw: &str) -> Result<String, ChangeSetError> {
    let invalid = |reason| ChangeSetError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    let unified = raw.trim().replace('\\', "/");
    if unified.starts_with('/') {
        return Err(invalid("absolute paths are not allowed"));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(invalid("absolute paths are not allowed"));
    }

    let mut parts = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(invalid("parent directory components are not allowed")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_dot_prefix_and_backslashes() {
        assert_eq!(normalize_path("./src\\lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(normalize_path("a//b/./c.txt").unwrap(), "a/b/c.txt");
    }

    #[test]
    fn test_normalize_rejects_escape_and_absolute() {
        assert!(matches!(
            normalize_path("../etc/passwd"),
            Err(ChangeSetError::InvalidPath { .. })
        ));
        assert!(matches!(
            normalize_path("src/../../x"),
            Err(ChangeSetError::InvalidPath { .. })
        ));
        assert!(normalize_path("/etc/passwd").is_err());
        assert!(normalize_path("C:\\windows").is_err());
        assert!(normalize_path("./").is_err());
    }

    #[test]
    fn test_validate_requires_edits() {
        assert_eq!(ChangeSet::new("empty").validate(), Err(ChangeSetError::NoEdits));
    }

    #[test]
    fn test_validate_requires_after_for_modify() {
        let mut edit = FileEdit::modify("a.txt", "x");
        edit.after = None;
        let cs = ChangeSet::new("m").with_edit(edit);
        match cs.validate() {
            Err(ChangeSetError::MissingContent { path, mode }) => {
                assert_eq!(path, "a.txt");
                assert_eq!(mode, EditMode::Modify);
            }
            other => panic!("Expected MissingContent, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_needs_no_content() {
        let cs = ChangeSet::new("d").with_edit(FileEdit::delete("old.txt"));
        assert!(cs.validate().is_ok());
    }

    #[test]
    fn test_touched_paths_dedupes_in_order() {
        let cs = ChangeSet::new("m")
            .with_edit(FileEdit::modify("./b.txt", "1"))
            .with_edit(FileEdit::add("a.txt", "2"))
            .with_edit(FileEdit::modify("b.txt", "3"));
        assert_eq!(cs.touched_paths().unwrap(), vec!["b.txt", "a.txt"]);
    }

    #[test]
    fn test_deserialize_defaults_mode_to_modify() {
        let cs: ChangeSet = serde_json::from_str(
            r#"{"message": "m", "edits": [{"path": "x.txt", "after": "hi\n"}]}"#,
        )
        .unwrap();
        assert_eq!(cs.edits[0].mode, EditMode::Modify);
        assert!(cs.edits[0].before_sha.is_none());
        assert!(cs.author.is_empty());
    }

    #[test]
    fn test_deserialize_rejects_unknown_mode() {
        let result: Result<ChangeSet, _> =
            serde_json::from_str(r#"{"edits": [{"path": "x", "mode": "rename"}]}"#);
        assert!(result.is_err());
    }
}
