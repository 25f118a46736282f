//! Configuration types for Flowline.
//!
//! Every section is optional in the file. A section present in a later
//! layer replaces the whole section from an earlier layer.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Root configuration.
///
/// ```toml
/// [engine]
/// inline_delay_threshold_ms = 5000
///
/// [sandbox]
/// pieces_dir = "/var/lib/flowline/pieces"
/// step_timeout_secs = 30
///
/// [scheduler]
/// tick_ms = 50
///
/// [store]
/// database = "/var/lib/flowline/flowline.db"
///
/// [logging]
/// file = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlineConfig {
    /// Flow execution settings.
    pub engine: Option<EngineSection>,
    /// WASM sandbox limits and piece location.
    pub sandbox: Option<SandboxSection>,
    /// Job scheduler settings.
    pub scheduler: Option<SchedulerSection>,
    /// Run and flow persistence.
    pub store: Option<StoreSection>,
    /// Log output.
    pub logging: Option<LoggingSection>,
}

impl FlowlineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(&mut self, other: FlowlineConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.sandbox.is_some() {
            self.sandbox = other.sandbox;
        }
        if other.scheduler.is_some() {
            self.scheduler = other.scheduler;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if let Some(sandbox) = &self.sandbox {
            if sandbox.step_timeout_secs == 0 {
                return Err(invalid("sandbox.step_timeout_secs", "must be at least 1"));
            }
            if sandbox.max_memory_mb == 0 {
                return Err(invalid("sandbox.max_memory_mb", "must be at least 1"));
            }
        }
        if let Some(scheduler) = &self.scheduler
            && scheduler.tick_ms == 0
        {
            return Err(invalid("scheduler.tick_ms", "must be at least 1"));
        }
        Ok(())
    }

    // Section accessors that fall back to defaults when a section is absent.

    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    pub fn sandbox(&self) -> SandboxSection {
        self.sandbox.clone().unwrap_or_default()
    }

    pub fn scheduler(&self) -> SchedulerSection {
        self.scheduler.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreSection {
        self.store.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Delays at or under this are slept out in-process.
    pub inline_delay_threshold_ms: u64,
    /// Home for the run database. Defaults to the config dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            inline_delay_threshold_ms: 5_000,
            data_dir: None,
        }
    }
}

impl EngineSection {
    pub fn inline_delay_threshold(&self) -> Duration {
        Duration::from_millis(self.inline_delay_threshold_ms)
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Piece catalog directory. Defaults to `<config dir>/pieces`.
    pub pieces_dir: Option<PathBuf>,
    /// Wall-clock limit per piece invocation.
    pub step_timeout_secs: u64,
    /// Linear memory ceiling per guest.
    pub max_memory_mb: usize,
    /// Fuel granted per second of timeout.
    pub fuel_per_sec: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            pieces_dir: None,
            step_timeout_secs: 30,
            max_memory_mb: 128,
            fuel_per_sec: 33_000_000,
        }
    }
}

impl SandboxSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb * 1024 * 1024
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Run the scheduler loop in `worker` mode.
    pub enabled: bool,
    /// Queue check interval.
    pub tick_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 50,
        }
    }
}

impl SchedulerSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// `[store]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database path. Defaults to `<data_dir>/flowline.db`.
    pub database: Option<PathBuf>,
    /// Keep flows and runs in process memory only.
    pub in_memory: bool,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Write JSON logs to a daily rolling file.
    pub file: bool,
    /// Log directory. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: true,
            dir: None,
        }
    }
}
