//! Pause/resume controller.
//!
//! A step suspends its run by returning [`PauseMetadata`]. Short delays are
//! absorbed in-process by [`DelayPolicy`]; anything else is persisted with
//! the run's [`Cursor`] before control is yielded, and delay pauses are
//! handed to the scheduler as one-shot resume jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::scheduler::{JobData, JobScheduler, ScheduledJob};
use crate::state::Ancestor;
use crate::store::{RunRecord, RunStatus, RunStore};

/// Default upper bound for delays that are waited out in-process.
pub const DEFAULT_INLINE_DELAY_THRESHOLD: Duration = Duration::from_secs(5);

/// Why a run is suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseMetadata {
    /// Resume automatically at `resume_at`.
    Delay { resume_at: DateTime<Utc> },
    /// Resume when an external callback arrives.
    Webhook {},
    /// Resume when a human completes a task.
    ManualTask {},
}

impl PauseMetadata {
    pub fn delay_until(resume_at: DateTime<Utc>) -> Self {
        PauseMetadata::Delay { resume_at }
    }

    pub fn delay_for(delay: chrono::Duration) -> Self {
        PauseMetadata::Delay {
            resume_at: Utc::now() + delay,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PauseMetadata::Delay { .. } => "DELAY",
            PauseMetadata::Webhook {} => "WEBHOOK",
            PauseMetadata::ManualTask {} => "MANUAL_TASK",
        }
    }
}

/// Where a suspended run re-enters the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub step_name: String,
    #[serde(default)]
    pub ancestors: Vec<Ancestor>,
}

impl Cursor {
    pub fn new(step_name: impl Into<String>, ancestors: Vec<Ancestor>) -> Self {
        Self {
            step_name: step_name.into(),
            ancestors,
        }
    }
}

/// How a pause request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayDecision {
    /// Nothing to wait for; re-enter the step now.
    Immediate,
    /// Sleep in-process, then re-enter the step.
    WaitInline(Duration),
    /// Persist and yield; the run resumes from outside.
    Suspend,
}

/// Threshold policy deciding between inline waiting and suspension.
#[derive(Debug, Clone, Copy)]
pub struct DelayPolicy {
    inline_threshold: Duration,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INLINE_DELAY_THRESHOLD)
    }
}

impl DelayPolicy {
    pub fn new(inline_threshold: Duration) -> Self {
        Self { inline_threshold }
    }

    pub fn inline_threshold(&self) -> Duration {
        self.inline_threshold
    }

    /// Classify a delay given in milliseconds.
    pub fn decide_ms(&self, delay_ms: i64) -> DelayDecision {
        if delay_ms <= 0 {
            return DelayDecision::Immediate;
        }
        let delay = Duration::from_millis(delay_ms.unsigned_abs());
        if delay <= self.inline_threshold {
            DelayDecision::WaitInline(delay)
        } else {
            DelayDecision::Suspend
        }
    }

    /// Classify a pause request at `now`. Only delays can avoid suspension.
    pub fn decide(&self, metadata: &PauseMetadata, now: DateTime<Utc>) -> DelayDecision {
        match metadata {
            PauseMetadata::Delay { resume_at } => {
                self.decide_ms((*resume_at - now).num_milliseconds())
            }
            PauseMetadata::Webhook {} | PauseMetadata::ManualTask {} => DelayDecision::Suspend,
        }
    }
}

/// Scheduler job id used for a run's delayed resume.
pub fn resume_job_id(run_id: &str) -> String {
    format!("resume:{run_id}")
}

/// Fire time (epoch seconds) for a delayed resume.
///
/// Rounded up so the job never fires before `resume_at`.
pub fn resume_fire_at(resume_at: DateTime<Utc>) -> i64 {
    let secs = resume_at.timestamp();
    if resume_at.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Persists suspended runs and arranges for their resumption.
pub struct PauseController {
    policy: DelayPolicy,
    runs: Arc<dyn RunStore>,
    scheduler: Arc<JobScheduler>,
}

impl PauseController {
    pub fn new(policy: DelayPolicy, runs: Arc<dyn RunStore>, scheduler: Arc<JobScheduler>) -> Self {
        Self {
            policy,
            runs,
            scheduler,
        }
    }

    pub fn policy(&self) -> &DelayPolicy {
        &self.policy
    }

    /// Mark the run paused, persist it with its cursor, and schedule the
    /// resume job for delay pauses. The record is saved before the job is
    /// queued so a firing job always finds the paused state.
    pub fn suspend(
        &self,
        record: &mut RunRecord,
        metadata: PauseMetadata,
        cursor: Cursor,
    ) -> Result<()> {
        record.status = RunStatus::Paused;
        record.pause = Some(metadata.clone());
        record.cursor = Some(cursor);
        record.touch();
        self.runs.save_run(record)?;

        info!(
            run_id = %record.run_id,
            pause = metadata.kind(),
            "Run suspended"
        );

        if let PauseMetadata::Delay { resume_at } = metadata {
            let job = ScheduledJob::once(
                resume_job_id(&record.run_id),
                JobData::ResumeRun {
                    run_id: record.run_id.clone(),
                },
                resume_fire_at(resume_at),
            );
            self.scheduler.add(job)?;
        }
        Ok(())
    }

    /// Load a paused run for resumption and clear its pause metadata.
    ///
    /// The pending resume job is left queued; drop it with
    /// [`PauseController::drop_resume_job`] once the resume is committed.
    pub fn take_for_resume(&self, run_id: &str) -> Result<RunRecord> {
        let mut record = self
            .runs
            .load_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if record.status != RunStatus::Paused {
            return Err(EngineError::RunNotResumable {
                run_id: run_id.to_string(),
                status: record.status.to_string(),
            });
        }

        debug!(run_id = %run_id, pause = ?record.pause, "Clearing pause for resume");
        record.pause = None;
        record.status = RunStatus::Running;
        record.touch();
        Ok(record)
    }

    /// Remove a run's delayed resume job, if one is queued.
    pub fn drop_resume_job(&self, run_id: &str) -> bool {
        self.scheduler.remove(&resume_job_id(run_id))
    }

    /// Cancel a paused run: mark it stopped and drop its resume job.
    pub fn cancel(&self, run_id: &str) -> Result<RunRecord> {
        let mut record = self
            .runs
            .load_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if record.status != RunStatus::Paused {
            return Err(EngineError::RunNotResumable {
                run_id: run_id.to_string(),
                status: record.status.to_string(),
            });
        }

        self.scheduler.remove(&resume_job_id(run_id));
        record.status = RunStatus::Stopped;
        record.pause = None;
        record.touch();
        self.runs.save_run(&record)?;
        info!(run_id = %run_id, "Paused run cancelled");
        Ok(record)
    }
}
