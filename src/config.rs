//! `patchline.toml` configuration.
//!
//! Every section has serde defaults, so a missing file or a partial file both
//! yield a working configuration. A few settings can be overridden through
//! the environment.

use crate::gates::RuleConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding pipeline state inside the repository.
pub const STATE_DIR: &str = ".patchline";
pub const CONFIG_FILE: &str = "patchline.toml";

pub const ENV_TEST_COMMAND: &str = "PATCHLINE_TEST_COMMAND";
pub const ENV_BASE_REF: &str = "PATCHLINE_BASE_REF";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default = "default_isolate_branch")]
    pub isolate_branch: bool,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Passed to the test command as its final argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_path: Option<PathBuf>,
    /// Placeholder tasks generated when nothing is executable. 0 disables.
    #[serde(default = "default_replenish_count")]
    pub replenish_count: usize,
    /// Record diff statistics after each cycle.
    #[serde(default = "default_analysis")]
    pub analysis: bool,
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

fn default_isolate_branch() -> bool {
    true
}

fn default_branch_prefix() -> String {
    "patchline/".to_string()
}

fn default_test_command() -> String {
    "cargo test".to_string()
}

fn default_replenish_count() -> usize {
    3
}

fn default_analysis() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_ref: default_base_ref(),
            isolate_branch: default_isolate_branch(),
            branch_prefix: default_branch_prefix(),
            test_command: default_test_command(),
            tests_path: None,
            replenish_count: default_replenish_count(),
            analysis: default_analysis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_tasks_file")]
    pub tasks_file: PathBuf,
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
    /// Hold an advisory file lock around every read and write.
    #[serde(default)]
    pub cross_process_lock: bool,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_tasks_file() -> PathBuf {
    Path::new(STATE_DIR).join("tasks.json")
}

fn default_ledger_file() -> PathBuf {
    Path::new(STATE_DIR).join("ledger.json")
}

fn default_lock_timeout_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tasks_file: default_tasks_file(),
            ledger_file: default_ledger_file(),
            cross_process_lock: false,
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    /// Run the built-in rule reviewer.
    #[serde(default = "default_review")]
    pub review: bool,
    /// Ask an operator before applying patches.
    #[serde(default)]
    pub interactive: bool,
    /// Interactive approval is skipped for patches touching at most this
    /// many files.
    #[serde(default)]
    pub auto_approve_threshold: usize,
    /// Gate flags a commit needs even if the gate never ran,
    /// e.g. `["security_passed"]`.
    #[serde(default)]
    pub always_required: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_review() -> bool {
    true
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            review: default_review(),
            interactive: false,
            auto_approve_threshold: 0,
            always_required: Vec::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_remediation_enabled")]
    pub enabled: bool,
    /// Tasks this deep in the parent chain get no further children.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
}

fn default_remediation_enabled() -> bool {
    true
}

fn default_max_depth() -> usize {
    2
}

fn default_max_children() -> usize {
    3
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: default_remediation_enabled(),
            max_depth: default_max_depth(),
            max_children: default_max_children(),
        }
    }
}

/// The complete patchline.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchlineToml {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
}

impl PatchlineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse patchline.toml")
    }

    /// Load `<state_dir>/patchline.toml`, or defaults when it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize patchline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Test command, with `PATCHLINE_TEST_COMMAND` taking precedence.
    pub fn test_command(&self) -> String {
        std::env::var(ENV_TEST_COMMAND)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.pipeline.test_command.clone())
    }

    /// Base revision for new branches, with `PATCHLINE_BASE_REF` taking
    /// precedence.
    pub fn base_ref(&self) -> String {
        std::env::var(ENV_BASE_REF)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.pipeline.base_ref.clone())
    }
}

/// Runtime configuration: the parsed file plus resolved paths.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: PatchlineToml,
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project dir: {}", project_dir.display()))?;
        let state_dir = project_dir.join(STATE_DIR);
        let toml = PatchlineToml::load_or_default(&state_dir)?;
        Ok(Self {
            project_dir,
            state_dir,
            toml,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.resolve(&self.toml.storage.tasks_file)
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.resolve(&self.toml.storage.ledger_file)
    }

    pub fn tests_path(&self) -> Option<PathBuf> {
        self.toml.pipeline.tests_path.clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.storage.lock_timeout_secs)
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    /// Create the state directory with a `.gitignore` that hides it from git.
    /// Returns `true` when the directory was newly created.
    pub fn ensure_state_dir(&self) -> Result<bool> {
        let created = !self.state_dir.exists();
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state dir: {}", self.state_dir.display())
        })?;
        let gitignore = self.state_dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n")
                .with_context(|| format!("Failed to write {}", gitignore.display()))?;
        }
        Ok(created)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}
