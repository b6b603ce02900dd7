//! Review pipeline: findings, consolidation and the fix loop.
//!
//! ## Components
//!
//! - [`findings`]: Severity, per-reviewer findings and final reports
//! - [`consolidate`]: Folds a review round into a final verdict
//! - [`fix_loop`]: Retry, escalation and human fallback for failed reviews
//!
//! ## Example
//!
//! ```
//! use foreman::review::{FixLoopAction, Severity, evaluate_fix_loop_action};
//!
//! assert_eq!(evaluate_fix_loop_action(0, Severity::Major), FixLoopAction::Retry);
//! assert_eq!(evaluate_fix_loop_action(2, Severity::Major), FixLoopAction::Escalate);
//! assert_eq!(evaluate_fix_loop_action(3, Severity::Major), FixLoopAction::HumanFallback);
//! assert_eq!(evaluate_fix_loop_action(3, Severity::Minor), FixLoopAction::Pass);
//! ```

pub mod consolidate;
pub mod findings;
pub mod fix_loop;

pub use consolidate::{ConsolidationSummary, consolidate, consolidate_reviews};
pub use findings::{FinalReport, ReviewFinding, Severity, generate_summary, overall_severity};
pub use fix_loop::{
    ESCALATION_THRESHOLD, FixLoopAction, FixLoopOutcome, FixRequest, MAX_FIX_ATTEMPTS,
    ReviewOutcome, build_fix_prompt, enter_fix_loop, evaluate_fix_loop_action,
    format_review_history, on_fix_task_complete, on_review_complete, process_fix_loop,
    rollback_fix_dispatch, should_enter_fix_loop,
};
