//! Flow engine: the run, resume, stop and trigger surfaces.
//!
//! `FlowEngine` owns the sandbox handle, the stores and the pause
//! controller, and is the scheduler's [`JobProcessor`]: resume jobs re-enter
//! paused runs and poll jobs start one run per trigger event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::definition::{FlowVersion, TriggerStrategy};
use crate::error::{EngineError, Result};
use crate::interpreter::{ChainOutcome, Interpreter};
use crate::pause::{
    DEFAULT_INLINE_DELAY_THRESHOLD, DelayPolicy, PauseController, PauseMetadata, resume_fire_at,
    resume_job_id,
};
use crate::protocol::{
    EngineOperationType, ExecutePropertyPayload, ExtractMetadataPayload, PieceOutput, PieceRef,
    PieceStatus, SandboxOperation, TriggerHookType, ValidateAuthPayload,
};
use crate::sandbox::Sandbox;
use crate::scheduler::{JobData, JobProcessor, JobScheduler, ScheduledJob};
use crate::state::{ExecutionState, StepOutput, StepScope};
use crate::store::{FlowStore, RunRecord, RunStatus, RunStore};
use crate::trigger::{TriggerHooks, TriggerRegistration, poll_job_id, webhook_id};

/// Configuration for the flow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delays up to this long are waited out in-process instead of
    /// suspending the run.
    pub inline_delay_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inline_delay_threshold: DEFAULT_INLINE_DELAY_THRESHOLD,
        }
    }
}

/// Result of executing or resuming a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: StepScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_metadata: Option<PauseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&RunRecord> for RunResult {
    fn from(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            status: record.status,
            steps: record.state.steps().clone(),
            pause_metadata: record.pause.clone(),
            error: record.error.clone(),
        }
    }
}

/// What a stop request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The run is executing; it stops at the next step boundary.
    Signalled,
    /// The run was paused; it is now `STOPPED` and its resume job removed.
    Cancelled,
}

/// Releases a run's ownership when dropped.
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<String, watch::Sender<bool>>>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.run_id);
    }
}

/// The flow execution engine.
pub struct FlowEngine {
    config: EngineConfig,
    sandbox: Arc<dyn Sandbox>,
    flows: Arc<dyn FlowStore>,
    runs: Arc<dyn RunStore>,
    scheduler: Arc<JobScheduler>,
    pauses: PauseController,
    hooks: TriggerHooks,
    /// Stop signals of runs currently owned by an interpreter.
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Enabled triggers by flow version id. Held across hook calls so
    /// enable/disable transitions are serialized.
    triggers: tokio::sync::Mutex<HashMap<String, TriggerRegistration>>,
}

impl FlowEngine {
    pub fn new(
        config: EngineConfig,
        sandbox: Arc<dyn Sandbox>,
        flows: Arc<dyn FlowStore>,
        runs: Arc<dyn RunStore>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        let pauses = PauseController::new(
            DelayPolicy::new(config.inline_delay_threshold),
            Arc::clone(&runs),
            Arc::clone(&scheduler),
        );
        let hooks = TriggerHooks::new(Arc::clone(&sandbox));
        Self {
            config,
            sandbox,
            flows,
            runs,
            scheduler,
            pauses,
            hooks,
            active: Mutex::new(HashMap::new()),
            triggers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Build an engine whose flow and run stores are the same backend.
    pub fn with_store<S>(
        config: EngineConfig,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<S>,
        scheduler: Arc<JobScheduler>,
    ) -> Self
    where
        S: FlowStore + RunStore + 'static,
    {
        let flows: Arc<dyn FlowStore> = store.clone();
        let runs: Arc<dyn RunStore> = store;
        Self::new(config, sandbox, flows, runs, scheduler)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Start a run of `flow`.
    ///
    /// `configs` must be a mapping or a list of `[key, value]` pairs; any
    /// other shape fails before a run record is created. The trigger payload
    /// becomes the trigger step's output.
    pub async fn execute_flow(
        &self,
        flow: &FlowVersion,
        configs: &Value,
        trigger_payload: Value,
    ) -> Result<RunResult> {
        flow.validate()?;

        let mut state = ExecutionState::new();
        state.insert_configs(configs)?;
        state.insert_step(StepOutput::simple(trigger_payload), &flow.trigger.name, &[])?;

        self.flows.save_flow_version(flow)?;

        let run_id = Uuid::new_v4().to_string();
        let record = RunRecord::new(&run_id, &flow.id, state.clone());
        self.runs.save_run(&record)?;
        info!(run_id = %run_id, flow = %flow.id, "Run started");

        let (_guard, stop) = self.claim(&run_id)?;
        let interpreter = Interpreter::new(
            &run_id,
            state,
            Arc::clone(&self.sandbox),
            *self.pauses.policy(),
            stop,
        );
        self.drive(flow, record, interpreter).await
    }

    /// Resume a paused run at its saved cursor.
    ///
    /// `payload` is handed to the paused step (approval data, webhook
    /// body); delay resumes pass `None`.
    pub async fn resume_flow(&self, run_id: &str, payload: Option<Value>) -> Result<RunResult> {
        let (_guard, stop) = self.claim(run_id)?;

        let mut record = self.pauses.take_for_resume(run_id)?;
        let cursor = record.cursor.take().ok_or_else(|| {
            EngineError::InvalidState(format!("paused run '{run_id}' has no cursor"))
        })?;
        let flow = self
            .flows
            .load_flow_version(&record.flow_version_id)?
            .ok_or_else(|| EngineError::FlowNotFound(record.flow_version_id.clone()))?;

        self.pauses.drop_resume_job(run_id);
        self.runs.save_run(&record)?;
        info!(run_id = %run_id, step = %cursor.step_name, "Run resumed");

        let interpreter = Interpreter::new(
            run_id,
            record.state.clone(),
            Arc::clone(&self.sandbox),
            *self.pauses.policy(),
            stop,
        )
        .with_resume(cursor, payload);
        self.drive(&flow, record, interpreter).await
    }

    /// Stop a run. Executing runs stop at the next step boundary; paused
    /// runs are cancelled.
    pub fn stop_run(&self, run_id: &str) -> Result<StopOutcome> {
        // Signal or claim under one lock so a resume cannot slip in between.
        let (_guard, _stop) = {
            let mut active = self.active.lock();
            if let Some(stop) = active.get(run_id) {
                stop.send_replace(true);
                info!(run_id = %run_id, "Stop signalled");
                return Ok(StopOutcome::Signalled);
            }
            self.claim_locked(&mut active, run_id)
        };

        self.pauses.cancel(run_id)?;
        info!(run_id = %run_id, "Paused run cancelled");
        Ok(StopOutcome::Cancelled)
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.runs
            .load_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        self.runs.list_runs_by_status(status)
    }

    /// Re-arm resume jobs for delay-paused runs found in the store.
    ///
    /// The job queue lives in memory, so a restarted worker calls this before
    /// starting its scheduler. Returns the number of jobs queued.
    pub fn recover_paused_runs(&self) -> Result<usize> {
        let mut queued = 0;
        for record in self.runs.list_runs_by_status(RunStatus::Paused)? {
            if let Some(PauseMetadata::Delay { resume_at }) = record.pause {
                self.scheduler.add(ScheduledJob::once(
                    resume_job_id(&record.run_id),
                    JobData::ResumeRun {
                        run_id: record.run_id.clone(),
                    },
                    resume_fire_at(resume_at),
                ))?;
                queued += 1;
            }
        }
        if queued > 0 {
            info!(count = queued, "Recovered delayed runs");
        }
        Ok(queued)
    }

    fn claim(&self, run_id: &str) -> Result<(ActiveRun<'_>, watch::Receiver<bool>)> {
        let mut active = self.active.lock();
        if active.contains_key(run_id) {
            return Err(EngineError::RunAlreadyActive(run_id.to_string()));
        }
        Ok(self.claim_locked(&mut active, run_id))
    }

    /// Register `run_id` as owned. The caller holds the `active` lock and
    /// has checked the run is not already owned.
    fn claim_locked(
        &self,
        active: &mut HashMap<String, watch::Sender<bool>>,
        run_id: &str,
    ) -> (ActiveRun<'_>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        active.insert(run_id.to_string(), tx);
        (
            ActiveRun {
                active: &self.active,
                run_id: run_id.to_string(),
            },
            rx,
        )
    }

    /// Run the interpreter and persist the run's paused or terminal state.
    async fn drive(
        &self,
        flow: &FlowVersion,
        mut record: RunRecord,
        mut interpreter: Interpreter,
    ) -> Result<RunResult> {
        let outcome = interpreter.run(flow).await;
        record.state = interpreter.into_state();
        record.cursor = None;
        record.pause = None;

        match outcome {
            Ok(ChainOutcome::Paused { metadata, cursor }) => {
                self.pauses.suspend(&mut record, metadata, cursor)?;
                return Ok(RunResult::from(&record));
            }
            Ok(ChainOutcome::Completed) => record.status = RunStatus::Succeeded,
            Ok(ChainOutcome::Stopped) => record.status = RunStatus::Stopped,
            Ok(ChainOutcome::Failed { step, message }) => {
                record.status = RunStatus::Failed;
                record.error = Some(format!("Step '{step}' failed: {message}"));
            }
            Err(e) => {
                record.status = RunStatus::Failed;
                record.error = Some(e.to_string());
                record.touch();
                self.runs.save_run(&record)?;
                error!(run_id = %record.run_id, error = %e, "Run aborted");
                return Err(e);
            }
        }

        record.touch();
        self.runs.save_run(&record)?;
        info!(run_id = %record.run_id, status = %record.status, "Run finished");
        Ok(RunResult::from(&record))
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Enable a flow's trigger. `ON_ENABLE` runs once per transition;
    /// enabling an already enabled trigger returns its registration.
    pub async fn enable_trigger(&self, flow: &FlowVersion) -> Result<TriggerRegistration> {
        flow.validate()?;
        let mut triggers = self.triggers.lock().await;
        if let Some(existing) = triggers.get(&flow.id) {
            debug!(flow = %flow.id, "Trigger already enabled");
            return Ok(existing.clone());
        }

        self.flows.save_flow_version(flow)?;

        let registration = match &flow.trigger.settings.strategy {
            TriggerStrategy::Manual => TriggerRegistration::Manual,
            TriggerStrategy::Webhook => {
                let id = webhook_id(&flow.id);
                self.hooks
                    .invoke(flow, TriggerHookType::OnEnable, None, Some(id.clone()))
                    .await?;
                TriggerRegistration::Webhook { webhook_id: id }
            }
            TriggerStrategy::Polling {
                cron_expression,
                timezone,
            } => {
                self.hooks
                    .invoke(flow, TriggerHookType::OnEnable, None, None)
                    .await?;
                let job_id = poll_job_id(&flow.id);
                self.scheduler.add(ScheduledJob::cron(
                    &job_id,
                    JobData::PollTrigger {
                        flow_version_id: flow.id.clone(),
                    },
                    cron_expression,
                    Some(timezone.clone()),
                ))?;
                let next_fire_at = self.scheduler.get(&job_id).and_then(|j| j.next_fire_at);
                TriggerRegistration::Polling {
                    job_id,
                    next_fire_at,
                }
            }
        };

        info!(flow = %flow.id, registration = ?registration, "Trigger enabled");
        triggers.insert(flow.id.clone(), registration.clone());
        Ok(registration)
    }

    /// Disable a flow's trigger. A trigger that is not enabled is a no-op.
    pub async fn disable_trigger(&self, flow: &FlowVersion) -> Result<()> {
        let mut triggers = self.triggers.lock().await;
        let Some(registration) = triggers.remove(&flow.id) else {
            debug!(flow = %flow.id, "Trigger not enabled");
            return Ok(());
        };

        match registration {
            TriggerRegistration::Manual => {}
            TriggerRegistration::Webhook { webhook_id } => {
                self.hooks
                    .invoke(flow, TriggerHookType::OnDisable, None, Some(webhook_id))
                    .await?;
            }
            TriggerRegistration::Polling { job_id, .. } => {
                self.scheduler.remove(&job_id);
                self.hooks
                    .invoke(flow, TriggerHookType::OnDisable, None, None)
                    .await?;
            }
        }

        info!(flow = %flow.id, "Trigger disabled");
        Ok(())
    }

    /// Whether a flow's trigger is currently enabled.
    pub async fn trigger_registration(&self, flow_version_id: &str) -> Option<TriggerRegistration> {
        self.triggers.lock().await.get(flow_version_id).cloned()
    }

    /// Deliver a webhook payload: the trigger's `RUN` hook turns it into
    /// events and each event starts a run.
    pub async fn deliver_webhook(
        &self,
        flow: &FlowVersion,
        payload: Value,
    ) -> Result<Vec<RunResult>> {
        if flow.trigger.settings.strategy != TriggerStrategy::Webhook {
            return Err(EngineError::InvalidFlow(format!(
                "flow '{}' does not have a webhook trigger",
                flow.id
            )));
        }
        let events = self
            .hooks
            .invoke(
                flow,
                TriggerHookType::Run,
                Some(payload),
                Some(webhook_id(&flow.id)),
            )
            .await?;
        self.start_runs(flow, events).await
    }

    /// Run the trigger's `TEST` hook and return its sample events.
    pub async fn test_trigger(&self, flow: &FlowVersion) -> Result<Vec<Value>> {
        self.hooks
            .invoke(flow, TriggerHookType::Test, None, None)
            .await
    }

    /// Poll a stored flow's trigger and start one run per event.
    pub async fn run(&self, flow_version_id: &str) -> Result<Vec<RunResult>> {
        let flow = self
            .flows
            .load_flow_version(flow_version_id)?
            .ok_or_else(|| EngineError::FlowNotFound(flow_version_id.to_string()))?;
        let events = self
            .hooks
            .invoke(&flow, TriggerHookType::Run, None, None)
            .await?;
        debug!(flow = %flow.id, events = events.len(), "Trigger polled");
        self.start_runs(&flow, events).await
    }

    /// Triggered runs start with empty configs. An event whose run cannot
    /// be started is logged and skipped; the rest still run.
    async fn start_runs(&self, flow: &FlowVersion, events: Vec<Value>) -> Result<Vec<RunResult>> {
        let configs = json!({});
        let total = events.len();
        let mut results = Vec::with_capacity(total);
        for (index, event) in events.into_iter().enumerate() {
            match self.execute_flow(flow, &configs, event).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(flow = %flow.id, event = index, total, error = %e, "Triggered run failed to start");
                }
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Piece operations
    // -----------------------------------------------------------------------

    pub async fn extract_piece_metadata(&self, piece: PieceRef) -> Result<Value> {
        self.dispatch(
            EngineOperationType::ExtractPieceMetadata,
            &ExtractMetadataPayload { piece },
        )
        .await
    }

    /// Compute dynamic options for one property of an action or trigger.
    pub async fn execute_property(
        &self,
        piece: PieceRef,
        action_or_trigger_name: &str,
        property_name: &str,
        input: Value,
    ) -> Result<Value> {
        self.dispatch(
            EngineOperationType::ExecuteProperty,
            &ExecutePropertyPayload {
                piece,
                action_or_trigger_name: action_or_trigger_name.to_string(),
                property_name: property_name.to_string(),
                input,
            },
        )
        .await
    }

    pub async fn validate_auth(&self, piece: PieceRef, auth: Value) -> Result<Value> {
        self.dispatch(
            EngineOperationType::ExecuteValidateAuth,
            &ValidateAuthPayload { piece, auth },
        )
        .await
    }

    async fn dispatch<P: Serialize + Sync>(
        &self,
        operation_type: EngineOperationType,
        payload: &P,
    ) -> Result<Value> {
        let operation = SandboxOperation::new(operation_type, payload)?;
        let target = operation
            .piece()
            .map(|p| p.to_string())
            .unwrap_or_default();
        let result = self.sandbox.execute(operation).await?.into_result()?;
        let output = PieceOutput::from_result(result)?;
        match output.status {
            PieceStatus::Ok => Ok(output.output.unwrap_or(Value::Null)),
            PieceStatus::Error => Err(EngineError::StepFailure {
                step: target,
                message: output
                    .error
                    .unwrap_or_else(|| "piece reported an error".to_string()),
            }),
            PieceStatus::Paused => Err(EngineError::StepFailure {
                step: target,
                message: format!("{operation_type:?} cannot pause"),
            }),
        }
    }
}

#[async_trait]
impl JobProcessor for FlowEngine {
    async fn process(&self, job: ScheduledJob) -> Result<()> {
        let ScheduledJob { id, data, .. } = job;
        match data {
            JobData::ResumeRun { run_id } => match self.resume_flow(&run_id, None).await {
                Ok(result) => {
                    debug!(job_id = %id, run_id = %run_id, status = %result.status, "Resume job done");
                    Ok(())
                }
                Err(EngineError::RunAlreadyActive(_)) => {
                    warn!(job_id = %id, run_id = %run_id, "Run still active, retrying resume");
                    self.scheduler.add(ScheduledJob::once(
                        id,
                        JobData::ResumeRun { run_id },
                        Utc::now().timestamp() + 1,
                    ))
                }
                Err(e) => Err(e),
            },
            JobData::PollTrigger { flow_version_id } => {
                let results = self.run(&flow_version_id).await?;
                debug!(job_id = %id, runs = results.len(), "Poll job done");
                Ok(())
            }
        }
    }
}
