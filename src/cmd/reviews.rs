//! `foreman dispatch-reviews` and `foreman consolidate-reviews`.

use super::{build_backend, load_config, spinner};
use crate::Cli;
use anyhow::Result;
use foreman::orchestrator::{OperationReport, consolidate_reviews, dispatch_reviews};
use std::path::Path;

pub async fn cmd_dispatch_reviews(cli: &Cli, state_file: &Path) -> Result<OperationReport> {
    let config = load_config(cli, state_file)?;
    let backend = match build_backend(&config) {
        Ok(backend) => backend,
        Err(report) => return Ok(report),
    };

    let bar = spinner("Waiting for reviewers...", cli.json || config.dry_run);
    let report = dispatch_reviews(&config, &backend).await;
    bar.finish_and_clear();
    Ok(report)
}

pub fn cmd_consolidate_reviews(cli: &Cli, state_file: &Path) -> Result<OperationReport> {
    let config = load_config(cli, state_file)?;
    Ok(consolidate_reviews(&config))
}
