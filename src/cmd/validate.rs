//! `foreman validate-state`.

use super::load_config;
use crate::Cli;
use anyhow::Result;
use foreman::orchestrator::{OperationReport, validate_state_file};
use std::path::Path;

pub fn cmd_validate_state(cli: &Cli, state_file: &Path) -> Result<OperationReport> {
    let config = load_config(cli, state_file)?;
    Ok(validate_state_file(&config))
}
