//! Test command execution.

use crate::process::run_captured;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Outcome of one test run. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub command: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration_ms: u64,
}

/// Runs the configured test command through `sh -c` in the repository root.
#[derive(Debug, Clone)]
pub struct TestRunner {
    command: String,
    root: PathBuf,
}

impl TestRunner {
    pub fn new(command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command, appending `path` as a final argument when given.
    pub fn run(&self, path: Option<&Path>) -> TestReport {
        let started = Instant::now();
        let finish = |passed: bool, exit_code: Option<i32>, output: String| TestReport {
            passed,
            command: self.command.clone(),
            exit_code,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let mut args: Vec<String> = vec!["-c".to_string()];
        match path {
            Some(path) => {
                let resolved = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.root.join(path)
                };
                if !resolved.exists() {
                    return finish(
                        false,
                        None,
                        format!("Tests path '{}' does not exist", path.display()),
                    );
                }
                // "$@" keeps the path a single argument whatever it contains.
                args.push(format!("{} \"$@\"", self.command));
                args.push("patchline-tests".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            None => args.push(self.command.clone()),
        }

        match run_captured("sh", &args, &self.root, None) {
            Ok(out) => {
                let passed = out.success();
                let output = out.combined();
                finish(passed, out.code, output)
            }
            Err(e) => finish(false, None, format!("Failed to spawn test command: {e}")),
        }
    }
}
