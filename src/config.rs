//! Configuration for foreman.
//!
//! Settings are read from `foreman.toml`, given explicitly with `--config`
//! or found next to the state file. Every key is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [backend]
//! command = "codeagent-wrapper"
//! timeout_secs = 3600
//!
//! [scheduling]
//! dependency_mode = "strict"   # or "legacy"
//!
//! [fix_loop]
//! escalation_backend = "codex"
//!
//! [reviews]
//! auto_complete = true
//! ```
//!
//! `FOREMAN_TIMEOUT_SECS` overrides the backend timeout. The backend binary
//! itself can be overridden with `CODEAGENT_WRAPPER`.

use crate::backend::DEFAULT_TIMEOUT_SECS;
use crate::dag::DependencyMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "foreman.toml";

const TIMEOUT_ENV_VAR: &str = "FOREMAN_TIMEOUT_SECS";

/// Execution backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    /// Wrapper command name or path (default: looked up as `codeagent-wrapper`)
    #[serde(default)]
    pub command: Option<String>,
    /// Seconds before a batch is abandoned
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulingSection {
    #[serde(default)]
    pub dependency_mode: DependencyMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixLoopSection {
    /// Backend used once a task has failed review repeatedly
    #[serde(default = "default_escalation_backend")]
    pub escalation_backend: String,
}

fn default_escalation_backend() -> String {
    "codex".to_string()
}

impl Default for FixLoopSection {
    fn default() -> Self {
        Self {
            escalation_backend: default_escalation_backend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewsSection {
    /// Complete tasks with a clean consolidated review automatically
    #[serde(default = "default_auto_complete")]
    pub auto_complete: bool,
}

fn default_auto_complete() -> bool {
    true
}

impl Default for ReviewsSection {
    fn default() -> Self {
        Self {
            auto_complete: default_auto_complete(),
        }
    }
}

/// Contents of `foreman.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub scheduling: SchedulingSection,
    #[serde(default)]
    pub fix_loop: FixLoopSection,
    #[serde(default)]
    pub reviews: ReviewsSection,
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `foreman.toml` from `dir`, or defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Backend timeout, with `FOREMAN_TIMEOUT_SECS` taking precedence.
    pub fn timeout_secs(&self) -> u64 {
        std::env::var(TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.backend.timeout_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.backend.timeout_secs == 0 {
            warnings.push("backend.timeout_secs is 0: every batch will time out".to_string());
        }
        if let Some(command) = &self.backend.command
            && command.trim().is_empty()
        {
            warnings.push("backend.command is empty; the default wrapper will be used".to_string());
        }
        if self.fix_loop.escalation_backend.trim().is_empty() {
            warnings.push("fix_loop.escalation_backend is empty".to_string());
        }

        warnings
    }
}

/// Resolved settings for one command invocation.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// Parsed foreman.toml
    pub toml: ForemanToml,
    /// Path of AGENT_STATE.json
    pub state_file: PathBuf,
    /// Directory the worker agents run in
    pub workdir: PathBuf,
    /// Build requests without dispatching or saving
    pub dry_run: bool,
}

impl ForemanConfig {
    /// Defaults for `state_file`, without reading any config file.
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            toml: ForemanToml::default(),
            state_file: state_file.into(),
            workdir: PathBuf::from("."),
            dry_run: false,
        }
    }

    /// Load the config for `state_file`: `explicit` if given, otherwise
    /// `foreman.toml` beside the state file, otherwise defaults.
    pub fn load(state_file: impl Into<PathBuf>, explicit: Option<&Path>) -> Result<Self> {
        let state_file = state_file.into();
        let toml = match explicit {
            Some(path) => ForemanToml::load(path)?,
            None => {
                let dir = state_file
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                ForemanToml::load_or_default(dir)?
            }
        };
        Ok(Self {
            toml,
            ..Self::new(state_file)
        })
    }

    pub fn with_toml(mut self, toml: ForemanToml) -> Self {
        self.toml = toml;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.toml.timeout_secs())
    }

    pub fn dependency_mode(&self) -> DependencyMode {
        self.toml.scheduling.dependency_mode
    }

    pub fn escalation_backend(&self) -> &str {
        &self.toml.fix_loop.escalation_backend
    }

    pub fn auto_complete(&self) -> bool {
        self.toml.reviews.auto_complete
    }

    /// Configured wrapper command, ignoring blank values.
    pub fn backend_command(&self) -> Option<&str> {
        self.toml
            .backend
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
    }

    pub fn workdir_string(&self) -> String {
        self.workdir.display().to_string()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
