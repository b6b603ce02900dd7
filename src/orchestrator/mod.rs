//! Orchestration driver.
//!
//! Each operation is one tick: load the state document, run the pipeline
//! against it in memory, persist at checkpoints and return an
//! [`OperationReport`]. This is the only layer that touches the state file.

pub mod dispatch;
pub mod reviews;
pub mod state;
pub mod validate;

pub use dispatch::dispatch_batch;
pub use reviews::{consolidate_reviews, dispatch_reviews};
pub use state::{
    BlockedItem, DecisionPriority, OrchestrationState, PendingDecision, STATE_FILE_NAME,
    StateStore,
};
pub use validate::{validate_state, validate_state_file};

use crate::config::ForemanConfig;
use crate::errors::{EngineError, EngineResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of one operation, as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationReport {
    pub success: bool,
    pub message: String,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Named counters (tasks dispatched, reports created, ...)
    pub counts: BTreeMap<String, usize>,
    /// Human decisions outstanding after the operation
    pub pending_decisions: usize,
    /// Backend input that would have been sent, in dry-run mode
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<String>,
}

impl OperationReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            errors,
            ..Default::default()
        }
    }

    pub fn from_error(message: impl Into<String>, err: &EngineError) -> Self {
        Self::failure(message, err.messages())
    }

    pub fn with_count(mut self, key: &str, value: usize) -> Self {
        self.counts.insert(key.to_string(), value);
        self
    }

    pub fn count(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Process exit code: 2 while a human decision is pending, 1 on
    /// failure, else 0.
    pub fn exit_code(&self) -> i32 {
        if self.pending_decisions > 0 {
            2
        } else if !self.success {
            1
        } else {
            0
        }
    }
}

/// Persist the state unless running dry.
pub(crate) fn checkpoint(
    store: &StateStore,
    state: &OrchestrationState,
    config: &ForemanConfig,
) -> EngineResult<()> {
    if config.dry_run {
        return Ok(());
    }
    store.save(state)
}

/// Reference lines shared by task and review prompts.
pub(crate) fn reference_documents(spec_path: &str) -> Vec<String> {
    vec![
        "Reference Documents:".to_string(),
        format!("- Requirements: {}/requirements.md", spec_path),
        format!("- Design: {}/design.md", spec_path),
    ]
}
