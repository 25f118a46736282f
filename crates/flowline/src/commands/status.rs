//! `flowline status` - show a run, or list runs by status.

use anyhow::{Result, bail};
use clap::Args;

use flowline_engine::{RunResult, RunStatus};

use super::Context;

/// Arguments for `flowline status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Run ID to show; omit to list runs
    pub run_id: Option<String>,

    /// Status to list (RUNNING, PAUSED, SUCCEEDED, FAILED, STOPPED)
    #[arg(long, default_value = "PAUSED")]
    pub status: String,
}

pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let engine = ctx.engine()?;

    if let Some(run_id) = args.run_id {
        let record = engine.get_run(&run_id)?;
        let result = RunResult::from(&record);
        if ctx.json_output {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("Run {}: {}", record.run_id, record.status.as_str());
            println!("  Flow:    {}", record.flow_version_id);
            println!("  Updated: {}", record.updated_at.to_rfc3339());
            for (name, step) in result.steps.iter() {
                println!("  {:<24} {:?}", name, step.status());
            }
            if let Some(error) = &record.error {
                println!("  Error:   {}", error);
            }
        }
        return Ok(());
    }

    let status = parse_status(&args.status)?;
    let runs = engine.list_runs(status)?;
    if ctx.json_output {
        let results: Vec<RunResult> = runs.iter().map(RunResult::from).collect();
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if runs.is_empty() {
        println!("No {} runs.", status.as_str());
    } else {
        for record in &runs {
            println!("{}  {}  {}", record.run_id, record.flow_version_id, record.status.as_str());
        }
    }
    Ok(())
}

fn parse_status(raw: &str) -> Result<RunStatus> {
    let status = match raw.to_ascii_uppercase().as_str() {
        "RUNNING" => RunStatus::Running,
        "PAUSED" => RunStatus::Paused,
        "SUCCEEDED" => RunStatus::Succeeded,
        "FAILED" => RunStatus::Failed,
        "STOPPED" => RunStatus::Stopped,
        other => bail!("unknown run status: {}", other),
    };
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_case_insensitive() {
        assert_eq!(parse_status("paused").unwrap(), RunStatus::Paused);
        assert_eq!(parse_status("FAILED").unwrap(), RunStatus::Failed);
        assert!(parse_status("done").is_err());
    }
}
