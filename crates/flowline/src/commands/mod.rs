//! CLI command handlers.

pub mod pieces;
pub mod resume;
pub mod run;
pub mod status;
pub mod stop;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde_json::Value;

use flowline_config::FlowlineConfig;
use flowline_engine::{
    EngineConfig, FlowEngine, JobScheduler, MemoryStore, PieceCatalog, RunResult, RunStatus,
    SandboxConfig, SchedulerConfig, SqliteStore, WasmSandbox,
};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: FlowlineConfig,
    /// User config directory; default home for pieces, logs and the database.
    pub config_dir: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn pieces_dir(&self) -> PathBuf {
        self.config
            .sandbox()
            .pieces_dir
            .unwrap_or_else(|| self.config_dir.join("pieces"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.store().database.unwrap_or_else(|| {
            self.config
                .engine()
                .data_dir
                .unwrap_or_else(|| self.config_dir.clone())
                .join("flowline.db")
        })
    }

    pub fn catalog(&self) -> Result<PieceCatalog> {
        let dir = self.pieces_dir();
        PieceCatalog::load(&dir)
            .with_context(|| format!("Failed to open piece catalog at {}", dir.display()))
    }

    /// Build an engine over the configured sandbox, store and scheduler.
    pub fn engine(&self) -> Result<Arc<FlowEngine>> {
        let sandbox_section = self.config.sandbox();
        let sandbox = WasmSandbox::new(
            self.catalog()?,
            SandboxConfig {
                step_timeout: sandbox_section.step_timeout(),
                max_memory_bytes: sandbox_section.max_memory_bytes(),
                fuel_per_sec: sandbox_section.fuel_per_sec,
                ..Default::default()
            },
        )?;
        let scheduler = Arc::new(JobScheduler::new(SchedulerConfig {
            tick: self.config.scheduler().tick(),
        }));
        let engine_config = EngineConfig {
            inline_delay_threshold: self.config.engine().inline_delay_threshold(),
        };

        let engine = if self.config.store().in_memory {
            FlowEngine::with_store(
                engine_config,
                Arc::new(sandbox),
                Arc::new(MemoryStore::new()),
                scheduler,
            )
        } else {
            let path = self.database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteStore::open(&path)
                .with_context(|| format!("Failed to open run store {}", path.display()))?;
            FlowEngine::with_store(engine_config, Arc::new(sandbox), Arc::new(store), scheduler)
        };
        Ok(Arc::new(engine))
    }
}

/// Parse an optional JSON argument; absent means `default`.
pub fn parse_json_arg(name: &str, raw: Option<&str>, default: Value) -> Result<Value> {
    match raw {
        Some(text) => serde_json::from_str(text)
            .with_context(|| format!("--{name} is not valid JSON: {text}")),
        None => Ok(default),
    }
}

/// Print a run result and turn a failed run into an error exit.
pub fn report_run(result: &RunResult, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("Run {}: {}", result.run_id, result.status.as_str());
        for (name, step) in result.steps.iter() {
            println!("  {:<24} {:?}", name, step.status());
            if ctx.verbose
                && let Some(output) = step.output()
            {
                println!("    {}", output);
            }
        }
        if let Some(pause) = &result.pause_metadata {
            println!("Paused: {}", serde_json::to_string(pause)?);
        }
        if let Some(error) = &result.error {
            println!("Error: {}", error);
        }
    }

    if result.status == RunStatus::Failed {
        anyhow::bail!(
            "run {} failed: {}",
            result.run_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
