//! `flowline resume` - continue a paused run.

use anyhow::Result;
use clap::Args;

use super::{Context, parse_json_arg, report_run};

/// Arguments for `flowline resume`.
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Run ID printed by `flowline run`
    pub run_id: String,

    /// Resume payload as JSON (becomes the paused step's output)
    #[arg(long)]
    pub payload: Option<String>,
}

pub async fn run(args: ResumeArgs, ctx: &Context) -> Result<()> {
    let payload = args
        .payload
        .as_deref()
        .map(|raw| parse_json_arg("payload", Some(raw), serde_json::Value::Null))
        .transpose()?;

    let engine = ctx.engine()?;
    let result = engine.resume_flow(&args.run_id, payload).await?;
    report_run(&result, ctx)
}
