//! Bootstrap an orchestration from a spec directory.
//!
//! A spec directory holds:
//!
//! ```text
//! <spec>/
//! ├── requirements.md   # referenced by every task prompt
//! ├── design.md         # referenced by every task prompt
//! └── tasks.md          # parsed into the task list
//! ```
//!
//! `initialize` parses `tasks.md`, assigns owner agents and windows, checks
//! the dependency graph and writes `AGENT_STATE.json`.

pub mod parser;

pub use parser::{ParseError, detect_criticality, detect_task_type, parse_tasks};

use crate::dag::{TaskGraph, check_dependencies};
use crate::errors::EngineError;
use crate::orchestrator::OperationReport;
use crate::orchestrator::state::{OrchestrationState, STATE_FILE_NAME, StateStore};
use crate::task::Task;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files every spec directory must contain.
pub const REQUIRED_SPEC_FILES: [&str; 3] = ["requirements.md", "design.md", "tasks.md"];

/// Options for [`initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub spec_dir: PathBuf,
    /// tmux session name (default `orch-<spec dir name>`)
    pub session: Option<String>,
    /// Where to write the state file (default: the spec directory's parent)
    pub output_dir: Option<PathBuf>,
}

impl InitOptions {
    pub fn new(spec_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec_dir: spec_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn session_name(&self) -> String {
        self.session.clone().unwrap_or_else(|| {
            let name = self
                .spec_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "spec".to_string());
            format!("orch-{}", name)
        })
    }

    pub fn state_file(&self) -> PathBuf {
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self
                .spec_dir
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        dir.join(STATE_FILE_NAME)
    }
}

/// Check that `spec_dir` exists and holds the required files.
pub fn validate_spec_dir(spec_dir: &Path) -> Vec<String> {
    if !spec_dir.is_dir() {
        return vec![format!("Spec directory does not exist: {}", spec_dir.display())];
    }
    let missing: Vec<&str> = REQUIRED_SPEC_FILES
        .into_iter()
        .filter(|name| !spec_dir.join(name).is_file())
        .collect();
    if missing.is_empty() {
        Vec::new()
    } else {
        vec![format!("Missing: {}", missing.join(", "))]
    }
}

/// Fill in the fields the parser leaves to orchestration.
fn assign_routing(task: &mut Task) {
    task.owner_agent = Some(task.task_type.default_agent().to_string());
    if task.is_leaf() {
        task.target_window = Some(format!("task-{}", task.task_id));
    }
    task.created_at = Some(Utc::now());
}

/// Parse the spec directory into a fresh state document.
pub fn build_state(options: &InitOptions) -> Result<OrchestrationState, Vec<String>> {
    let errors = validate_spec_dir(&options.spec_dir);
    if !errors.is_empty() {
        return Err(errors);
    }

    let tasks_path = options.spec_dir.join("tasks.md");
    let content = fs::read_to_string(&tasks_path)
        .map_err(|e| vec![format!("Failed to read {}: {}", tasks_path.display(), e)])?;
    let (mut tasks, parse_errors) = parse_tasks(&content);
    if !parse_errors.is_empty() {
        return Err(parse_errors.iter().map(ToString::to_string).collect());
    }
    if tasks.is_empty() {
        return Err(vec!["tasks.md contains no tasks".to_string()]);
    }

    let graph = TaskGraph::build(&tasks).map_err(|e| e.messages())?;
    let dependency_errors = check_dependencies(&graph);
    if !dependency_errors.is_empty() {
        return Err(EngineError::Dependency {
            errors: dependency_errors,
        }
        .messages());
    }

    for task in &mut tasks {
        assign_routing(task);
    }

    let spec_path = std::path::absolute(&options.spec_dir).unwrap_or_else(|_| options.spec_dir.clone());
    Ok(OrchestrationState::new(spec_path.display().to_string(), options.session_name()).with_tasks(tasks))
}

/// Initialize an orchestration and write its state file.
pub fn initialize(options: &InitOptions, dry_run: bool) -> OperationReport {
    let state = match build_state(options) {
        Ok(state) => state,
        Err(errors) => {
            warn!(spec_dir = %options.spec_dir.display(), "Initialization failed");
            return OperationReport::failure(
                format!("Failed to initialize from {}", options.spec_dir.display()),
                errors,
            );
        }
    };

    let state_file = options.state_file();
    let store = StateStore::new(&state_file);
    if store.exists() {
        warn!(path = %state_file.display(), "Overwriting existing state file");
    }

    let leaves = state.tasks.iter().filter(|t| t.is_leaf()).count();
    let mut report = OperationReport::success(format!(
        "Orchestration initialized: {}",
        state_file.display()
    ))
    .with_count("tasks", state.tasks.len())
    .with_count("leaf_tasks", leaves)
    .with_count("optional", state.tasks.iter().filter(|t| t.is_optional).count());

    if dry_run {
        report.message = format!("Would write {}", state_file.display());
        return report;
    }
    if let Err(e) = store.save(&state) {
        return OperationReport::from_error("Failed to write state file", &e);
    }

    info!(
        path = %state_file.display(),
        session = %state.session_name,
        tasks = state.tasks.len(),
        "Orchestration initialized"
    );
    report
}
