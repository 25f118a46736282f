//! Flowline - run, resume and schedule sandboxed automation flows.
//!
//! Main entry point for the Flowline CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{pieces, resume, run, status, stop, worker};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Flowline - run, resume and schedule sandboxed automation flows
#[derive(Parser)]
#[command(name = "flowline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config directory (default: platform config dir)
    #[arg(long, global = true, env = "FLOWLINE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a flow file once
    Run(run::RunArgs),

    /// Resume a paused run
    Resume(resume::ResumeArgs),

    /// Stop or cancel a run
    Stop(stop::StopArgs),

    /// Show a run's status and step outputs
    Status(status::StatusArgs),

    /// Enable flow triggers and process scheduled jobs until Ctrl-C
    Worker(worker::WorkerArgs),

    /// Manage the piece catalog
    Pieces(pieces::PiecesArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = flowline_config::load_config_with_options(None, cli.config_dir.as_deref())?;
    let config_dir = loaded
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".flowline"));
    let logging = loaded.config.logging();

    // Console (human-readable, stderr) + optional daily JSON file.
    let filter = if cli.verbose {
        "flowline=debug,flowline_engine=debug,flowline_config=debug,info"
    } else {
        "flowline=info,flowline_engine=info,warn"
    };

    use tracing_subscriber::prelude::*;
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::new(filter));

    let mut _guard = None;
    let file = if logging.file {
        let log_dir = logging.dir.clone().unwrap_or_else(|| config_dir.join("logs"));
        let file_appender = tracing_appender::rolling::daily(&log_dir, "flowline.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "flowline=trace,flowline_engine=trace,flowline_config=trace,info",
                )),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(console).with(file).init();

    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }
    if cli.verbose {
        for source in loaded.loaded_from() {
            eprintln!("Loaded config: {}", source.display());
        }
    }

    let ctx = commands::Context {
        config: loaded.config,
        config_dir,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Resume(args) => resume::run(args, &ctx).await,
        Commands::Stop(args) => stop::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Worker(args) => worker::run(args, &ctx).await,
        Commands::Pieces(args) => pieces::run(args, &ctx).await,
    }
}
