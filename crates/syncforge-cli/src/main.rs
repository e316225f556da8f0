mod commands;
mod http_source;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use syncforge_types::state::SyncMode;

#[derive(Parser)]
#[command(
    name = "syncforge",
    version,
    about = "Paginated REST ingestion into year-bucketed document stores"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Fetch and reconcile, but write to in-memory stores only
        #[arg(long)]
        dry_run: bool,
        /// Override the sync mode configured in the pipeline
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Validate pipeline configuration and open every backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => SyncMode::Full,
            ModeArg::Incremental => SyncMode::Incremental,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            dry_run,
            mode,
        } => commands::run::execute(&pipeline, dry_run, mode.map(SyncMode::from)).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
    }
}
