use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Multi-agent task orchestrator: conflict-aware batches, reviews and fix loops")]
pub struct Cli {
    /// Debug logging (overridden by FOREMAN_LOG / RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the operation report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Build backend input without dispatching or saving state
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Directory the worker agents run in
    #[arg(long, global = true, default_value = ".")]
    pub workdir: PathBuf,

    /// Path to foreman.toml (default: beside the state file)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create AGENT_STATE.json from a spec directory
    Init {
        /// Directory holding requirements.md, design.md and tasks.md
        spec_dir: PathBuf,

        /// tmux session name (default: orch-<spec dir name>)
        #[arg(short, long)]
        session: Option<String>,

        /// Output directory for the state file (default: the spec directory's parent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the fix loop, then dispatch every ready task in conflict-free batches
    DispatchBatch {
        /// Path to AGENT_STATE.json
        state_file: PathBuf,
    },
    /// Dispatch reviewers for tasks pending review
    DispatchReviews {
        /// Path to AGENT_STATE.json
        state_file: PathBuf,
    },
    /// Fold collected review findings into final reports
    ConsolidateReviews {
        /// Path to AGENT_STATE.json
        state_file: PathBuf,
    },
    /// Check a state file for structural and review-gate problems
    ValidateState {
        /// Path to AGENT_STATE.json
        state_file: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "foreman=debug" } else { "foreman=info" };
    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let report = match &cli.command {
        Commands::Init {
            spec_dir,
            session,
            output,
        } => cmd::cmd_init(&cli, spec_dir, session.as_deref(), output.as_deref())?,
        Commands::DispatchBatch { state_file } => cmd::cmd_dispatch_batch(&cli, state_file).await?,
        Commands::DispatchReviews { state_file } => {
            cmd::cmd_dispatch_reviews(&cli, state_file).await?
        }
        Commands::ConsolidateReviews { state_file } => {
            cmd::cmd_consolidate_reviews(&cli, state_file)?
        }
        Commands::ValidateState { state_file } => cmd::cmd_validate_state(&cli, state_file)?,
    };

    cmd::print_report(&report, cli.json)?;
    std::process::exit(report.exit_code());
}
