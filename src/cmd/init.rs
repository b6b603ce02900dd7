//! `foreman init`.

use crate::Cli;
use anyhow::Result;
use foreman::init::{InitOptions, initialize};
use foreman::orchestrator::OperationReport;
use std::path::Path;

pub fn cmd_init(
    cli: &Cli,
    spec_dir: &Path,
    session: Option<&str>,
    output: Option<&Path>,
) -> Result<OperationReport> {
    let mut options = InitOptions::new(spec_dir);
    if let Some(session) = session {
        options = options.with_session(session);
    }
    if let Some(output) = output {
        options = options.with_output_dir(output);
    }
    Ok(initialize(&options, cli.dry_run))
}
