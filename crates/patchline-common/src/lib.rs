//! Shared domain types for the patchline pipeline.
//!
//! Everything here is plain data: tasks, the structured change format and
//! content fingerprints. The main crate owns all I/O.

pub mod change_set;
pub mod fingerprint;
pub mod task;

pub use change_set::{ChangeSet, ChangeSetError, EditMode, FileEdit, LegacyDiff, normalize_path};
pub use fingerprint::{fingerprint, fingerprint_file};
pub use task::{DraftError, ParseEnumError, PatchMaterial, Task, TaskDraft, TaskKind, TaskStatus};
