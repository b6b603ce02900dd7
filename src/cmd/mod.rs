//! CLI command implementations.
//!
//! | Module     | Commands handled                           |
//! |------------|--------------------------------------------|
//! | `init`     | `Init`                                     |
//! | `dispatch` | `DispatchBatch`                            |
//! | `reviews`  | `DispatchReviews`, `ConsolidateReviews`    |
//! | `validate` | `ValidateState`                            |

pub mod dispatch;
pub mod init;
pub mod reviews;
pub mod validate;

pub use dispatch::cmd_dispatch_batch;
pub use init::cmd_init;
pub use reviews::{cmd_consolidate_reviews, cmd_dispatch_reviews};
pub use validate::cmd_validate_state;

use crate::Cli;
use anyhow::{Context, Result};
use console::style;
use foreman::backend::{CodeagentBackend, DEFAULT_BINARY};
use foreman::config::ForemanConfig;
use foreman::orchestrator::OperationReport;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolve the config for a state-file command from the global flags.
pub(crate) fn load_config(cli: &Cli, state_file: &Path) -> Result<ForemanConfig> {
    let config = ForemanConfig::load(state_file, cli.config.as_deref())
        .with_context(|| format!("Failed to load configuration for {}", state_file.display()))?;
    Ok(config
        .with_workdir(cli.workdir.clone())
        .with_dry_run(cli.dry_run))
}

/// Locate the wrapper binary.
///
/// A dry run never executes the backend, so a missing binary only matters
/// when dispatching for real.
pub(crate) fn build_backend(config: &ForemanConfig) -> Result<CodeagentBackend, OperationReport> {
    match CodeagentBackend::locate(config.backend_command()) {
        Ok(backend) => Ok(backend.with_timeout(config.timeout())),
        Err(_) if config.dry_run => Ok(CodeagentBackend::new(PathBuf::from(DEFAULT_BINARY))),
        Err(e) => Err(OperationReport::failure(
            "Execution backend unavailable",
            vec![e.to_string()],
        )),
    }
}

/// Spinner shown on stderr while a backend call is in flight.
pub(crate) fn spinner(message: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(spinner_style);
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Print the report as JSON or as styled text.
pub fn print_report(report: &OperationReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("Failed to serialize report")?
        );
        return Ok(());
    }

    if report.success {
        println!("{} {}", style("✔").green().bold(), report.message);
    } else {
        println!("{} {}", style("✘").red().bold(), style(&report.message).red());
    }

    for (key, value) in &report.counts {
        println!("  {} {}", style(format!("{}:", key)).dim(), value);
    }
    for error in &report.errors {
        println!("  {} {}", style("-").red(), error);
    }
    for warning in &report.warnings {
        println!("  {} {}", style("⚠").yellow(), warning);
    }
    if report.pending_decisions > 0 {
        println!(
            "{}",
            style(format!(
                "{} human decision(s) pending in the state file",
                report.pending_decisions
            ))
            .yellow()
            .bold()
        );
    }
    for preview in &report.previews {
        println!();
        println!("{}", style("Backend input (dry run):").cyan());
        println!("{}", preview);
    }
    Ok(())
}
