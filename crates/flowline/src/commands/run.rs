//! `flowline run` - execute a flow file once.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use serde_json::{Value, json};

use flowline_engine::FlowVersion;

use super::{Context, parse_json_arg, report_run};

/// Arguments for `flowline run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow definition (`.json` or `.toml`)
    pub flow: PathBuf,

    /// Run configs as a JSON object or list of {key, value} pairs
    #[arg(long)]
    pub configs: Option<String>,

    /// Trigger payload as JSON
    #[arg(long)]
    pub payload: Option<String>,
}

pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let flow = FlowVersion::from_file(&args.flow)
        .with_context(|| format!("Failed to load flow {}", args.flow.display()))?;
    let configs = parse_json_arg("configs", args.configs.as_deref(), json!({}))?;
    let payload = parse_json_arg("payload", args.payload.as_deref(), Value::Null)?;

    if ctx.verbose {
        eprintln!("Executing flow '{}' ({} steps)", flow.id, flow.step_names().len());
    }

    let engine = ctx.engine()?;
    let result = engine.execute_flow(&flow, &configs, payload).await?;
    report_run(&result, ctx)
}
