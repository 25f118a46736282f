//! Trigger/delay job scheduler.
//!
//! An in-memory queue of [`ScheduledJob`]s ordered by fire time and polled
//! on a short fixed tick. Cron jobs are re-enqueued with their next fire
//! time in the same critical section that dequeues them, so a job can never
//! be fired and rescheduled from two ticks at once.
//!
//! Cron expressions accept the standard 5-field Unix form (minute hour
//! day-of-month month day-of-week) as well as the 6-field form with seconds.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};

/// Default polling tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Scheduler runtime configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the queue is checked for due jobs.
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK }
    }
}

/// Work carried by a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobData {
    /// Poll a trigger and start one run per returned event.
    PollTrigger { flow_version_id: String },
    /// Resume a delayed run.
    ResumeRun { run_id: String },
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub data: JobData,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub cron_timezone: Option<String>,
    /// Epoch seconds. `None` means due on the next tick.
    #[serde(default)]
    pub next_fire_at: Option<i64>,
}

impl ScheduledJob {
    /// A one-shot job due at `fire_at` (epoch seconds).
    pub fn once(id: impl Into<String>, data: JobData, fire_at: i64) -> Self {
        Self {
            id: id.into(),
            data,
            cron_expression: None,
            cron_timezone: None,
            next_fire_at: Some(fire_at),
        }
    }

    /// A one-shot job due on the next tick.
    pub fn immediate(id: impl Into<String>, data: JobData) -> Self {
        Self {
            id: id.into(),
            data,
            cron_expression: None,
            cron_timezone: None,
            next_fire_at: None,
        }
    }

    /// A recurring job. The fire time is computed when the job is added.
    pub fn cron(
        id: impl Into<String>,
        data: JobData,
        expression: impl Into<String>,
        timezone: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            cron_expression: Some(expression.into()),
            cron_timezone: timezone,
            next_fire_at: None,
        }
    }

    fn is_due(&self, now: i64) -> bool {
        self.next_fire_at.is_none_or(|at| at <= now)
    }
}

/// Callback invoked for each fired job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: ScheduledJob) -> Result<()>;
}

/// Explicitly constructed job scheduler.
pub struct JobScheduler {
    config: SchedulerConfig,
    /// Sorted by `next_fire_at`, unscheduled jobs first.
    queue: Mutex<Vec<ScheduledJob>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Enqueue a job, replacing any job with the same id.
    ///
    /// Cron jobs are enqueued with their next fire time in the job's
    /// timezone. A job whose schedule cannot be computed is dropped.
    pub fn add(&self, mut job: ScheduledJob) -> Result<()> {
        if let Some(expression) = job.cron_expression.as_deref() {
            match next_fire_after(expression, job.cron_timezone.as_deref(), Utc::now()) {
                Ok(at) => job.next_fire_at = Some(at),
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Dropping job with invalid schedule");
                    return Err(e);
                }
            }
        }

        info!(job_id = %job.id, next_fire_at = ?job.next_fire_at, "Job scheduled");
        let mut queue = self.queue.lock();
        queue.retain(|j| j.id != job.id);
        insert_sorted(&mut queue, job);
        Ok(())
    }

    /// Remove a job by id. Returns whether a job was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|j| j.id != id);
        let removed = queue.len() != before;
        if removed {
            info!(job_id = %id, "Job removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.queue.lock().iter().find(|j| j.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Dequeue every job due at `now` and re-enqueue recurring ones with
    /// their next fire time. Returns the fired jobs as they were when due.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let now_secs = now.timestamp();
        let mut queue = self.queue.lock();

        let split = queue.partition_point(|j| j.is_due(now_secs));
        let due: Vec<ScheduledJob> = queue.drain(..split).collect();

        for job in &due {
            let Some(expression) = job.cron_expression.as_deref() else {
                continue;
            };
            match next_fire_after(expression, job.cron_timezone.as_deref(), now) {
                Ok(at) => {
                    let mut next = job.clone();
                    next.next_fire_at = Some(at);
                    insert_sorted(&mut queue, next);
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Could not reschedule recurring job");
                }
            }
        }

        due
    }

    /// Fire every due job on its own task. Failures are logged per job.
    pub fn tick(&self, processor: &Arc<dyn JobProcessor>) -> Vec<JoinHandle<()>> {
        let due = self.take_due(Utc::now());
        due.into_iter()
            .map(|job| {
                let processor = Arc::clone(processor);
                debug!(job_id = %job.id, "Firing job");
                tokio::spawn(async move {
                    let id = job.id.clone();
                    if let Err(e) = processor.process(job).await {
                        error!(job_id = %id, error = %e, "Job processing failed");
                    }
                })
            })
            .collect()
    }

    /// Run the tick loop until `shutdown` flips to `true` or its sender drops.
    pub async fn run(
        self: Arc<Self>,
        processor: Arc<dyn JobProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "Scheduler started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick(&processor);
                }
            }
        }
    }
}

fn insert_sorted(queue: &mut Vec<ScheduledJob>, job: ScheduledJob) {
    let key = job.next_fire_at.unwrap_or(i64::MIN);
    let pos = queue.partition_point(|j| j.next_fire_at.unwrap_or(i64::MIN) <= key);
    queue.insert(pos, job);
}

// ---------------------------------------------------------------------------
// Cron helpers
// ---------------------------------------------------------------------------

/// Convert a 5-field Unix cron expression to the 6-field form with seconds.
fn normalize_cron_expr(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        expression.trim().to_string()
    }
}

/// Parse a cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron_expr(expression)).map_err(|e| {
        EngineError::SchedulerJob(format!("Invalid cron expression '{}': {}", expression, e))
    })
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::SchedulerJob(format!("Unknown timezone '{}'", name)))
}

/// Next fire time (epoch seconds) strictly after `after`, evaluated in
/// `timezone` (UTC when absent).
pub fn next_fire_after(
    expression: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
) -> Result<i64> {
    let schedule = parse_cron(expression)?;
    let tz = parse_timezone(timezone.unwrap_or("UTC"))?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|at| at.timestamp())
        .ok_or_else(|| {
            EngineError::SchedulerJob(format!("No upcoming time for cron '{}'", expression))
        })
}
