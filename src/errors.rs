//! Typed error hierarchy for the orchestration engine.
//!
//! Every structured error carries the field or location it refers to plus a
//! human-readable message:
//! - `EngineError`: fatal or batch-scoped failures returned by operations
//! - `DependencyError`: one cycle or missing reference in the task graph
//! - `ConflictWarning`: a write-write overlap that is resolved by serializing
//!   the two tasks; it is logged, never returned as a failure

use crate::task::TaskStatus;
use std::path::PathBuf;
use thiserror::Error;

/// One problem in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// A cycle, recorded as the path from the repeated task back to itself.
    #[error("Circular dependency: {}", .cycle.join(" -> "))]
    Circular { cycle: Vec<String> },

    /// A task references ids that do not exist.
    #[error("Task {task_id} has missing dependencies: {}", .missing.join(", "))]
    Missing {
        task_id: String,
        missing: Vec<String>,
    },
}

impl DependencyError {
    /// The task the error is reported against.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Circular { cycle } => cycle.first().map(String::as_str).unwrap_or(""),
            Self::Missing { task_id, .. } => task_id,
        }
    }
}

/// Errors raised by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The state document is missing, unreadable or corrupt.
    #[error("State file {path}: {message}")]
    StateIo { path: PathBuf, message: String },

    /// Schema or business-rule violation.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// The dependency graph is inconsistent; scheduling must not proceed.
    #[error("Dependency errors: {}", format_dependency_errors(.errors))]
    Dependency { errors: Vec<DependencyError> },

    /// The execution backend could not be reached, timed out, or failed.
    #[error("Dispatch failed for {location}: {message}")]
    Dispatch { location: String, message: String },

    /// An illegal lifecycle change was attempted.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    Transition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl EngineError {
    pub fn state_io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateIo {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn dispatch(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            location: location.into(),
            message: message.into(),
        }
    }

    /// The field, path or location this error refers to.
    pub fn location(&self) -> String {
        match self {
            Self::StateIo { path, .. } => path.display().to_string(),
            Self::Validation { field, .. } => field.clone(),
            Self::Dependency { errors } => errors
                .iter()
                .map(DependencyError::task_id)
                .collect::<Vec<_>>()
                .join(","),
            Self::Dispatch { location, .. } => location.clone(),
            Self::Transition { task_id, .. } => task_id.clone(),
        }
    }

    /// Flatten into discrete, user-visible error strings.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Dependency { errors } => errors.iter().map(ToString::to_string).collect(),
            other => vec![other.to_string()],
        }
    }
}

fn format_dependency_errors(errors: &[DependencyError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Two tasks in the same ready set write the same file(s).
///
/// Resolved automatically by placing the tasks in different batches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "File conflict between tasks {task_a} and {task_b} on [{}]. Tasks will be serialized.",
    .files.join(", ")
)]
pub struct ConflictWarning {
    pub task_a: String,
    pub task_b: String,
    pub files: Vec<String>,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
