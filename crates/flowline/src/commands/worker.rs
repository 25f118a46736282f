//! `flowline worker` - enable flow triggers and process scheduled jobs.
//!
//! Loads every `.json`/`.toml` flow in a directory, re-arms delayed runs
//! left paused by a previous process, enables each flow's trigger, then
//! drives the scheduler until Ctrl-C. Triggers are disabled on the way out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tokio::sync::watch;
use tracing::{info, warn};

use flowline_engine::{FlowVersion, JobProcessor, TriggerRegistration};

use super::Context;

/// Arguments for `flowline worker`.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Directory of flow definitions
    pub flows_dir: PathBuf,
}

pub async fn run(args: WorkerArgs, ctx: &Context) -> Result<()> {
    let flows = load_flows(&args.flows_dir)?;
    let engine = ctx.engine()?;

    let recovered = engine.recover_paused_runs()?;
    if recovered > 0 {
        info!(count = recovered, "Re-armed delayed runs");
    }

    let mut enabled = Vec::new();
    for flow in flows {
        match engine.enable_trigger(&flow).await {
            Ok(registration) => {
                match &registration {
                    TriggerRegistration::Manual => {}
                    TriggerRegistration::Webhook { webhook_id } => {
                        println!("{}: webhook {}", flow.id, webhook_id);
                    }
                    TriggerRegistration::Polling { job_id, .. } => {
                        println!("{}: polling ({})", flow.id, job_id);
                    }
                }
                enabled.push(flow);
            }
            Err(e) => warn!(flow = %flow.id, error = %e, "Failed to enable trigger"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = if ctx.config.scheduler().enabled {
        let processor: Arc<dyn JobProcessor> = engine.clone();
        Some(tokio::spawn(
            engine.scheduler().clone().run(processor, shutdown_rx),
        ))
    } else {
        info!("Scheduler disabled; not processing jobs");
        None
    };

    println!("Worker running with {} flow(s). Press Ctrl-C to stop.", enabled.len());
    tokio::signal::ctrl_c().await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = loop_handle {
        let _ = handle.await;
    }
    for flow in &enabled {
        if let Err(e) = engine.disable_trigger(flow).await {
            warn!(flow = %flow.id, error = %e, "Failed to disable trigger");
        }
    }
    info!("Worker stopped");
    Ok(())
}

/// Parse every flow file in `dir`; unreadable ones are logged and skipped.
fn load_flows(dir: &Path) -> Result<Vec<FlowVersion>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read flows directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "toml")))
        .collect();
    paths.sort();

    let mut flows = Vec::new();
    for path in paths {
        match FlowVersion::from_file(&path) {
            Ok(flow) => flows.push(flow),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping flow"),
        }
    }
    Ok(flows)
}
