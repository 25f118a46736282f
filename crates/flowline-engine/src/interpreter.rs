//! Step interpreter.
//!
//! Walks a flow graph depth-first for one run. Each action's input is
//! resolved against the [`ExecutionState`], the action is invoked (locally
//! for built-ins, otherwise through the [`Sandbox`]), and the result is
//! folded back into the state before advancing.
//!
//! Routers descend into the first matching branch and continue at their own
//! successor. Loops run their body once per item, strictly in order, with
//! `(loop, index)` pushed on the ancestor path.
//!
//! # Resume
//!
//! A resumed interpreter carries a [`Cursor`]. Until the cursor's step is
//! reached it runs in seek mode: nodes before the one containing the target
//! are skipped, routers descend into the branch holding the target without
//! re-evaluating conditions, and loops re-enter the saved iteration instead
//! of appending a new one. The target step is re-invoked with
//! [`ExecutionType::Resume`] and the resume payload.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::builtin::{self, BuiltinCall};
use crate::condition::branch_matches;
use crate::definition::{ActionKind, ActionNode, ActionSettings, FlowVersion, RouterBranch, chain_contains};
use crate::error::{EngineError, Result};
use crate::pause::{Cursor, DelayDecision, DelayPolicy, PauseMetadata};
use crate::protocol::{
    EngineOperationType, EngineResponseStatus, ExecuteActionPayload, ExecutionType, PieceOutput,
    PieceStatus, SandboxOperation,
};
use crate::sandbox::Sandbox;
use crate::state::{Ancestor, ExecutionState, StepOutput, StepStatus};

/// Boxed future used for the recursive chain walk.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Upper bound on in-process re-entries of one step (pauses that resolve
/// without suspension).
const MAX_INLINE_REENTRIES: usize = 64;

/// What a single step invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Paused(PauseMetadata),
}

/// How a chain (or a whole run) ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed,
    Paused {
        metadata: PauseMetadata,
        cursor: Cursor,
    },
    Failed {
        step: String,
        message: String,
    },
    Stopped,
}

struct ResumeTarget {
    cursor: Cursor,
    payload: Option<Value>,
}

/// Interprets one run. Owns the run's execution state.
pub struct Interpreter {
    run_id: String,
    state: ExecutionState,
    sandbox: Arc<dyn Sandbox>,
    policy: DelayPolicy,
    stop: watch::Receiver<bool>,
    resume: Option<ResumeTarget>,
}

impl Interpreter {
    pub fn new(
        run_id: impl Into<String>,
        state: ExecutionState,
        sandbox: Arc<dyn Sandbox>,
        policy: DelayPolicy,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            state,
            sandbox,
            policy,
            stop,
            resume: None,
        }
    }

    /// Continue from `cursor`, handing `payload` to the paused step.
    pub fn with_resume(mut self, cursor: Cursor, payload: Option<Value>) -> Self {
        self.resume = Some(ResumeTarget { cursor, payload });
        self
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn into_state(self) -> ExecutionState {
        self.state
    }

    /// Run the flow's action chain to completion, pause, failure or stop.
    pub async fn run(&mut self, flow: &FlowVersion) -> Result<ChainOutcome> {
        let Some(first) = flow.first_action() else {
            return Ok(ChainOutcome::Completed);
        };
        if let Some(target) = self.seek_target()
            && !chain_contains(first, &target)
        {
            return Err(EngineError::InvalidState(format!(
                "resume step '{target}' is not part of flow '{}'",
                flow.id
            )));
        }
        self.run_chain(first, Vec::new()).await
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Step name the interpreter is seeking, if resuming.
    fn seek_target(&self) -> Option<String> {
        self.resume.as_ref().map(|r| r.cursor.step_name.clone())
    }

    fn run_chain<'s, 'f: 's>(
        &'s mut self,
        first: &'f ActionNode,
        ancestors: Vec<Ancestor>,
    ) -> BoxFuture<'s, Result<ChainOutcome>> {
        Box::pin(async move {
            let mut node = Some(first);

            if let Some(target) = self.seek_target() {
                while let Some(current) = node {
                    if current.contains(&target) {
                        break;
                    }
                    node = current.next_action.as_deref();
                }
                if node.is_none() {
                    return Err(EngineError::InvalidState(format!(
                        "resume step '{target}' not found under '{}'",
                        first.name
                    )));
                }
            }

            while let Some(current) = node {
                if self.stop_requested() {
                    info!(run_id = %self.run_id, step = %current.name, "Stop requested, not advancing");
                    return Ok(ChainOutcome::Stopped);
                }

                let outcome = match &current.kind {
                    ActionKind::Action { settings } => {
                        self.run_action(current, settings, &ancestors).await?
                    }
                    ActionKind::Router { branches } => {
                        self.run_router(current, branches, &ancestors).await?
                    }
                    ActionKind::LoopOnItems {
                        items,
                        first_loop_action,
                    } => {
                        self.run_loop(current, items, first_loop_action.as_deref(), &ancestors)
                            .await?
                    }
                };

                if outcome != ChainOutcome::Completed {
                    return Ok(outcome);
                }
                node = current.next_action.as_deref();
            }

            Ok(ChainOutcome::Completed)
        })
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    async fn run_action(
        &mut self,
        node: &ActionNode,
        settings: &ActionSettings,
        ancestors: &[Ancestor],
    ) -> Result<ChainOutcome> {
        let (mut execution_type, mut resume_payload) = match self.resume.take() {
            Some(target) if target.cursor.step_name == node.name => {
                info!(run_id = %self.run_id, step = %node.name, "Resuming step");
                (ExecutionType::Resume, target.payload)
            }
            other => {
                self.resume = other;
                (ExecutionType::Begin, None)
            }
        };

        let input = self.state.resolve(&settings.input, ancestors);
        debug!(
            run_id = %self.run_id,
            step = %node.name,
            piece = %settings.piece_name,
            action = %settings.action_name,
            "Step started"
        );

        for _ in 0..MAX_INLINE_REENTRIES {
            let result = self
                .invoke_with_retries(node, settings, &input, execution_type, resume_payload.take())
                .await;

            match result {
                Ok(StepOutcome::Succeeded(output)) => {
                    info!(run_id = %self.run_id, step = %node.name, "Step succeeded");
                    self.record(node, ancestors, StepStatus::Succeeded, input, output, None)?;
                    return Ok(ChainOutcome::Completed);
                }
                Ok(StepOutcome::Paused(metadata)) => {
                    match self.policy.decide(&metadata, Utc::now()) {
                        DelayDecision::Immediate => {}
                        DelayDecision::WaitInline(wait) => {
                            debug!(run_id = %self.run_id, step = %node.name, wait = ?wait, "Waiting inline");
                            tokio::time::sleep(wait).await;
                        }
                        DelayDecision::Suspend => {
                            info!(
                                run_id = %self.run_id,
                                step = %node.name,
                                pause = metadata.kind(),
                                "Step requested pause"
                            );
                            self.record(node, ancestors, StepStatus::Paused, input, Value::Null, None)?;
                            return Ok(ChainOutcome::Paused {
                                metadata,
                                cursor: Cursor::new(&node.name, ancestors.to_vec()),
                            });
                        }
                    }
                    execution_type = ExecutionType::Resume;
                }
                Err(e) => return self.handle_failure(node, settings, ancestors, input, e),
            }
        }

        let message = format!("step re-entered {MAX_INLINE_REENTRIES} times without completing");
        self.handle_failure(
            node,
            settings,
            ancestors,
            input,
            EngineError::StepFailure {
                step: node.name.clone(),
                message,
            },
        )
    }

    fn handle_failure(
        &mut self,
        node: &ActionNode,
        settings: &ActionSettings,
        ancestors: &[Ancestor],
        input: Value,
        err: EngineError,
    ) -> Result<ChainOutcome> {
        let (output, message) = match &err {
            EngineError::SandboxFault { status, message } => (
                json!({"status": status.to_string(), "message": message}),
                message.clone(),
            ),
            EngineError::StepFailure { message, .. } => (
                json!({"status": "FAILED", "message": message}),
                message.clone(),
            ),
            other => (
                json!({"status": "FAILED", "message": other.to_string()}),
                other.to_string(),
            ),
        };

        if settings.continue_on_failure && err.is_step_recoverable() {
            warn!(
                run_id = %self.run_id,
                step = %node.name,
                error = %err,
                "Step failed, continuing"
            );
            self.record(node, ancestors, StepStatus::Failed, input, output, Some(message))?;
            return Ok(ChainOutcome::Completed);
        }

        warn!(run_id = %self.run_id, step = %node.name, error = %err, "Step failed");
        self.record(
            node,
            ancestors,
            StepStatus::Failed,
            input,
            output,
            Some(message.clone()),
        )?;
        Ok(ChainOutcome::Failed {
            step: node.name.clone(),
            message,
        })
    }

    async fn invoke_with_retries(
        &self,
        node: &ActionNode,
        settings: &ActionSettings,
        input: &Value,
        execution_type: ExecutionType,
        resume_payload: Option<Value>,
    ) -> Result<StepOutcome> {
        let mut attempt = 0;
        loop {
            let result = self
                .invoke(node, settings, input, execution_type, resume_payload.clone())
                .await;
            match result {
                Err(e) if e.is_step_recoverable() && attempt < settings.retry_attempts => {
                    attempt += 1;
                    warn!(
                        run_id = %self.run_id,
                        step = %node.name,
                        attempt,
                        error = %e,
                        "Retrying step"
                    );
                    if settings.retry_delay_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(settings.retry_delay_ms))
                            .await;
                    }
                }
                other => return other,
            }
        }
    }

    async fn invoke(
        &self,
        node: &ActionNode,
        settings: &ActionSettings,
        input: &Value,
        execution_type: ExecutionType,
        resume_payload: Option<Value>,
    ) -> Result<StepOutcome> {
        if builtin::is_builtin(&settings.piece_name) {
            return builtin::execute_builtin(&BuiltinCall {
                step_name: &node.name,
                piece_name: &settings.piece_name,
                action_name: &settings.action_name,
                input,
                execution_type,
                resume_payload: resume_payload.as_ref(),
                now: Utc::now(),
            });
        }

        let payload = ExecuteActionPayload {
            piece: settings.piece(),
            action_name: settings.action_name.clone(),
            input: input.clone(),
            run_id: self.run_id.clone(),
            step_name: node.name.clone(),
            execution_type,
            resume_payload,
        };
        let operation = SandboxOperation::new(EngineOperationType::ExecuteFlow, &payload)?;
        let result = self.sandbox.execute(operation).await?.into_result()?;
        let output = PieceOutput::from_result(result)?;

        match output.status {
            PieceStatus::Ok => Ok(StepOutcome::Succeeded(output.output.unwrap_or(Value::Null))),
            PieceStatus::Error => Err(EngineError::StepFailure {
                step: node.name.clone(),
                message: output
                    .error
                    .unwrap_or_else(|| "piece reported an error".to_string()),
            }),
            PieceStatus::Paused => match output.pause {
                Some(metadata) => Ok(StepOutcome::Paused(metadata)),
                None => Err(EngineError::SandboxFault {
                    status: EngineResponseStatus::InternalError,
                    message: "piece paused without pause metadata".into(),
                }),
            },
        }
    }

    fn record(
        &mut self,
        node: &ActionNode,
        ancestors: &[Ancestor],
        status: StepStatus,
        input: Value,
        output: Value,
        error_message: Option<String>,
    ) -> Result<()> {
        self.state.insert_step(
            StepOutput::Simple {
                status,
                input,
                output,
                error_message,
            },
            &node.name,
            ancestors,
        )
    }

    // -----------------------------------------------------------------------
    // Routers
    // -----------------------------------------------------------------------

    async fn run_router(
        &mut self,
        node: &ActionNode,
        branches: &[RouterBranch],
        ancestors: &[Ancestor],
    ) -> Result<ChainOutcome> {
        let chosen = match self.seek_target() {
            Some(target) => {
                let index = branches.iter().position(|b| {
                    b.first_action
                        .as_deref()
                        .is_some_and(|first| chain_contains(first, &target))
                });
                if index.is_none() {
                    return Err(EngineError::InvalidState(format!(
                        "resume step '{target}' not found in router '{}'",
                        node.name
                    )));
                }
                index
            }
            None => {
                let index = branches
                    .iter()
                    .position(|b| branch_matches(&b.conditions, &self.state, ancestors));
                let output = match index {
                    Some(i) => json!({"branch_index": i, "branch_name": branches[i].name}),
                    None => Value::Null,
                };
                debug!(run_id = %self.run_id, step = %node.name, branch = ?index, "Router evaluated");
                let input = json!({
                    "branches": branches.iter().map(|b| b.name.as_str()).collect::<Vec<_>>()
                });
                self.state.insert_step(
                    StepOutput::Simple {
                        status: StepStatus::Succeeded,
                        input,
                        output,
                        error_message: None,
                    },
                    &node.name,
                    ancestors,
                )?;
                index
            }
        };

        match chosen.and_then(|i| branches[i].first_action.as_deref()) {
            Some(first) => self.run_chain(first, ancestors.to_vec()).await,
            None => Ok(ChainOutcome::Completed),
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn run_loop(
        &mut self,
        node: &ActionNode,
        items_expression: &str,
        body: Option<&ActionNode>,
        ancestors: &[Ancestor],
    ) -> Result<ChainOutcome> {
        let resolved = self
            .state
            .resolve(&Value::String(items_expression.to_string()), ancestors);
        let items = match resolved {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                let message = format!("loop items must be a list, got {other}");
                self.state.insert_step(
                    StepOutput::Simple {
                        status: StepStatus::Failed,
                        input: json!({"items": other}),
                        output: json!({"status": "FAILED", "message": message}),
                        error_message: Some(message.clone()),
                    },
                    &node.name,
                    ancestors,
                )?;
                return Ok(ChainOutcome::Failed {
                    step: node.name.clone(),
                    message,
                });
            }
        };

        let resume_index = match self.seek_target() {
            Some(target) => {
                let index = self.resume.as_ref().and_then(|r| {
                    r.cursor
                        .ancestors
                        .iter()
                        .find(|a| a.step_name == node.name)
                        .map(|a| a.index)
                });
                match index {
                    Some(i) => Some(i),
                    None => {
                        return Err(EngineError::InvalidState(format!(
                            "cursor for '{target}' has no frame for loop '{}'",
                            node.name
                        )));
                    }
                }
            }
            None => None,
        };

        if !matches!(
            self.state.get_step(&node.name, ancestors),
            Some(StepOutput::Loop { .. })
        ) {
            self.state.insert_step(
                StepOutput::loop_shell(json!({"items": items})),
                &node.name,
                ancestors,
            )?;
        }
        self.set_loop_status(node, ancestors, StepStatus::Running);

        debug!(run_id = %self.run_id, step = %node.name, items = items.len(), "Loop started");

        let start = resume_index.unwrap_or(0);
        for (offset, item) in items.into_iter().enumerate().skip(start) {
            if self.stop_requested() {
                info!(run_id = %self.run_id, step = %node.name, "Stop requested inside loop");
                return Ok(ChainOutcome::Stopped);
            }

            let index = if resume_index == Some(offset) {
                self.state
                    .select_iteration(&node.name, ancestors, offset, item)?;
                offset
            } else {
                self.state.push_iteration(&node.name, ancestors, item)?
            };

            let Some(first) = body else { continue };

            let mut inner = ancestors.to_vec();
            inner.push(Ancestor::new(&node.name, index));
            let outcome = self.run_chain(first, inner).await?;

            match outcome {
                ChainOutcome::Completed => {}
                ChainOutcome::Paused { .. } => {
                    self.set_loop_status(node, ancestors, StepStatus::Paused);
                    return Ok(outcome);
                }
                ChainOutcome::Failed { .. } => {
                    self.set_loop_status(node, ancestors, StepStatus::Failed);
                    return Ok(outcome);
                }
                ChainOutcome::Stopped => return Ok(outcome),
            }
        }

        self.set_loop_status(node, ancestors, StepStatus::Succeeded);
        Ok(ChainOutcome::Completed)
    }

    fn set_loop_status(&mut self, node: &ActionNode, ancestors: &[Ancestor], status: StepStatus) {
        if let Some(step) = self.state.get_step_mut(&node.name, ancestors) {
            step.set_status(status);
        }
    }
}
