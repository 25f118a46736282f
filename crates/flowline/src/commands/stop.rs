//! `flowline stop` - cancel a paused run.

use anyhow::Result;
use clap::Args;

use flowline_engine::StopOutcome;

use super::Context;

/// Arguments for `flowline stop`.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Run ID to stop
    pub run_id: String,
}

pub async fn run(args: StopArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.engine()?;
    // A fresh engine holds no in-flight runs, so this cancels a paused one.
    match engine.stop_run(&args.run_id)? {
        StopOutcome::Signalled => println!("Stop requested: {}", args.run_id),
        StopOutcome::Cancelled => println!("Stopped: {}", args.run_id),
    }
    Ok(())
}
