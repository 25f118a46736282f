//! Flow and run persistence.
//!
//! The engine needs only two things from storage: an atomic read of a flow
//! version and an atomic write of a run's record. [`MemoryStore`] backs
//! tests and one-shot CLI runs; [`SqliteStore`] backs workers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::definition::FlowVersion;
use crate::error::{EngineError, Result};
use crate::pause::{Cursor, PauseMetadata};
use crate::state::ExecutionState;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Paused,
    Succeeded,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Stopped => "STOPPED",
        }
    }

    /// Whether the run can no longer change status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "PAUSED" => Ok(RunStatus::Paused),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            "STOPPED" => Ok(RunStatus::Stopped),
            other => Err(EngineError::Store(format!("Unknown run status '{other}'"))),
        }
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub flow_version_id: String,
    pub status: RunStatus,
    pub state: ExecutionState,
    /// Resume point; set while paused.
    pub cursor: Option<Cursor>,
    pub pause: Option<PauseMetadata>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<String>,
        flow_version_id: impl Into<String>,
        state: ExecutionState,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            flow_version_id: flow_version_id.into(),
            status: RunStatus::Running,
            state,
            cursor: None,
            pause: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read access to flow versions.
pub trait FlowStore: Send + Sync {
    fn save_flow_version(&self, flow: &FlowVersion) -> Result<()>;
    fn load_flow_version(&self, id: &str) -> Result<Option<FlowVersion>>;
}

/// Atomic persistence of run records.
pub trait RunStore: Send + Sync {
    fn save_run(&self, record: &RunRecord) -> Result<()>;
    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;
    fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<HashMap<String, FlowVersion>>,
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryStore {
    fn save_flow_version(&self, flow: &FlowVersion) -> Result<()> {
        self.flows.write().insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    fn load_flow_version(&self, id: &str) -> Result<Option<FlowVersion>> {
        Ok(self.flows.read().get(id).cloned())
    }
}

impl RunStore for MemoryStore {
    fn save_run(&self, record: &RunRecord) -> Result<()> {
        self.runs
            .write()
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flow_versions (
    id TEXT PRIMARY KEY,
    definition TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    flow_version_id TEXT NOT NULL,
    status TEXT NOT NULL,
    state TEXT NOT NULL,
    cursor TEXT,
    pause TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
";

/// SQLite-backed store with JSON columns.
///
/// Thread-safe via internal `Mutex<Connection>`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Store(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl FlowStore for SqliteStore {
    fn save_flow_version(&self, flow: &FlowVersion) -> Result<()> {
        let definition = serde_json::to_string(flow)?;
        self.conn.lock().execute(
            "INSERT INTO flow_versions (id, definition, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET definition = excluded.definition,
                                           updated_at = excluded.updated_at",
            params![flow.id, definition, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_flow_version(&self, id: &str) -> Result<Option<FlowVersion>> {
        let definition: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT definition FROM flow_versions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        definition
            .map(|d| serde_json::from_str(&d).map_err(EngineError::from))
            .transpose()
    }
}

/// Raw column values of a `runs` row, decoded outside the row callback.
struct RawRun {
    run_id: String,
    flow_version_id: String,
    status: String,
    state: String,
    cursor: Option<String>,
    pause: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

const RUN_COLUMNS: &str =
    "run_id, flow_version_id, status, state, cursor, pause, error, created_at, updated_at";

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        flow_version_id: row.get(1)?,
        status: row.get(2)?,
        state: row.get(3)?,
        cursor: row.get(4)?,
        pause: row.get(5)?,
        error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl RawRun {
    fn decode(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: self.status.parse()?,
            state: serde_json::from_str(&self.state)?,
            cursor: self
                .cursor
                .map(|c| serde_json::from_str(&c))
                .transpose()?,
            pause: self.pause.map(|p| serde_json::from_str(&p)).transpose()?,
            error: self.error,
            created_at: parse_dt(&self.created_at)?,
            updated_at: parse_dt(&self.updated_at)?,
            run_id: self.run_id,
            flow_version_id: self.flow_version_id,
        })
    }
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Store(format!("Invalid timestamp '{s}': {e}")))
}

impl RunStore for SqliteStore {
    fn save_run(&self, record: &RunRecord) -> Result<()> {
        let state = serde_json::to_string(&record.state)?;
        let cursor = record
            .cursor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let pause = record
            .pause
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.lock().execute(
            "INSERT INTO runs (run_id, flow_version_id, status, state, cursor, pause, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 state = excluded.state,
                 cursor = excluded.cursor,
                 pause = excluded.pause,
                 error = excluded.error,
                 updated_at = excluded.updated_at",
            params![
                record.run_id,
                record.flow_version_id,
                record.status.as_str(),
                state,
                cursor,
                pause,
                record.error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let raw = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(RawRun::decode).transpose()
    }

    fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY created_at"
            ))?;
            let iter = stmt.query_map(params![status.as_str()], row_to_raw)?;
            iter.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(RawRun::decode).collect()
    }
}
