//! `foreman dispatch-batch`.

use super::{build_backend, load_config, spinner};
use crate::Cli;
use anyhow::Result;
use foreman::orchestrator::{OperationReport, dispatch_batch};
use std::path::Path;

pub async fn cmd_dispatch_batch(cli: &Cli, state_file: &Path) -> Result<OperationReport> {
    let config = load_config(cli, state_file)?;
    let backend = match build_backend(&config) {
        Ok(backend) => backend,
        Err(report) => return Ok(report),
    };

    let bar = spinner("Dispatching ready tasks...", cli.json || config.dry_run);
    let report = dispatch_batch(&config, &backend).await;
    bar.finish_and_clear();
    Ok(report)
}
