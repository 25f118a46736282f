//! Trigger lifecycle dispatch.
//!
//! Triggers expose four capabilities: enable, disable, run (poll or webhook
//! delivery) and test. Each maps to a [`TriggerHookType`] and is dispatched
//! through the [`Sandbox`], except for the local trigger pieces
//! (`webhook`, `schedule`) which need no guest code.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::catalog::sha256_hex;
use crate::definition::FlowVersion;
use crate::error::{EngineError, Result};
use crate::protocol::{
    EngineOperationType, PieceOutput, PieceStatus, SandboxOperation, TriggerHookPayload,
    TriggerHookType,
};
use crate::sandbox::Sandbox;

/// Local trigger that turns each delivered payload into one event.
pub const WEBHOOK_TRIGGER_PIECE: &str = "webhook";
/// Local trigger that emits one event per scheduler firing.
pub const SCHEDULE_TRIGGER_PIECE: &str = "schedule";

/// What enabling a trigger produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerRegistration {
    /// Manual trigger: nothing registered.
    Manual,
    /// Webhook trigger: callers deliver to this id.
    Webhook { webhook_id: String },
    /// Polling trigger: the scheduler job and its first fire time.
    Polling {
        job_id: String,
        next_fire_at: Option<i64>,
    },
}

/// Scheduler job id for a flow's polling trigger.
pub fn poll_job_id(flow_version_id: &str) -> String {
    format!("poll:{flow_version_id}")
}

/// Stable webhook id for a flow version.
pub fn webhook_id(flow_version_id: &str) -> String {
    let digest = sha256_hex(flow_version_id.as_bytes());
    format!("whk_{}", &digest[..16])
}

/// Dispatches trigger hooks for flow versions.
pub struct TriggerHooks {
    sandbox: Arc<dyn Sandbox>,
}

impl TriggerHooks {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    /// Run one hook and return the events it produced.
    ///
    /// `RUN` and `TEST` yield the hook's output as a list of events (a
    /// non-list output is a single event, `null` is none). Other hooks
    /// return an empty list.
    pub async fn invoke(
        &self,
        flow: &FlowVersion,
        hook_type: TriggerHookType,
        trigger_payload: Option<Value>,
        webhook_id: Option<String>,
    ) -> Result<Vec<Value>> {
        let settings = &flow.trigger.settings;
        debug!(
            flow = %flow.id,
            trigger = %flow.trigger.name,
            piece = %settings.piece_name,
            hook = ?hook_type,
            "Invoking trigger hook"
        );

        if let Some(events) = local_hook(&settings.piece_name, hook_type, trigger_payload.as_ref())
        {
            return Ok(events);
        }

        let payload = TriggerHookPayload {
            piece: settings.piece(),
            trigger_name: settings.trigger_name.clone(),
            hook_type,
            flow_version_id: flow.id.clone(),
            input: settings.input.clone(),
            trigger_payload,
            webhook_id,
        };
        let operation = SandboxOperation::new(EngineOperationType::ExecuteTriggerHook, &payload)?;
        let result = self.sandbox.execute(operation).await?.into_result()?;
        let output = PieceOutput::from_result(result)?;

        match output.status {
            PieceStatus::Ok => {}
            PieceStatus::Error => {
                let message = output
                    .error
                    .unwrap_or_else(|| "trigger reported an error".to_string());
                warn!(flow = %flow.id, hook = ?hook_type, error = %message, "Trigger hook failed");
                return Err(EngineError::StepFailure {
                    step: flow.trigger.name.clone(),
                    message,
                });
            }
            PieceStatus::Paused => {
                return Err(EngineError::StepFailure {
                    step: flow.trigger.name.clone(),
                    message: "triggers cannot pause".into(),
                });
            }
        }

        Ok(match hook_type {
            TriggerHookType::Run | TriggerHookType::Test => into_events(output.output),
            _ => Vec::new(),
        })
    }
}

fn into_events(output: Option<Value>) -> Vec<Value> {
    match output {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    }
}

fn local_hook(
    piece_name: &str,
    hook_type: TriggerHookType,
    trigger_payload: Option<&Value>,
) -> Option<Vec<Value>> {
    match (piece_name, hook_type) {
        (WEBHOOK_TRIGGER_PIECE, TriggerHookType::Run) => {
            Some(trigger_payload.cloned().into_iter().collect())
        }
        (SCHEDULE_TRIGGER_PIECE, TriggerHookType::Run | TriggerHookType::Test) => {
            Some(vec![json!({"fired_at": Utc::now().to_rfc3339()})])
        }
        (WEBHOOK_TRIGGER_PIECE | SCHEDULE_TRIGGER_PIECE, _) => Some(Vec::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EngineResponseStatus, SandboxResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingSandbox {
        hooks: Mutex<Vec<TriggerHookType>>,
        result: Value,
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        async fn execute(&self, operation: SandboxOperation) -> Result<SandboxResponse> {
            assert_eq!(
                operation.operation_type,
                EngineOperationType::ExecuteTriggerHook
            );
            let payload: TriggerHookPayload = serde_json::from_value(operation.payload)?;
            self.hooks.lock().push(payload.hook_type);
            if payload.trigger_name == "broken" {
                return Ok(SandboxResponse::fault(EngineResponseStatus::Timeout, "slow"));
            }
            Ok(SandboxResponse::ok(self.result.clone()))
        }
    }

    fn flow(piece: &str, trigger_name: &str) -> FlowVersion {
        serde_json::from_value(json!({
            "id": "fv-1",
            "trigger": {
                "name": "trigger",
                "settings": {"piece_name": piece, "piece_version": "1.0.0", "trigger_name": trigger_name}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_ids() {
        assert_eq!(poll_job_id("fv-1"), "poll:fv-1");
        let id = webhook_id("fv-1");
        assert!(id.starts_with("whk_"));
        assert_eq!(id.len(), 20);
        assert_eq!(id, webhook_id("fv-1"));
        assert_ne!(id, webhook_id("fv-2"));
    }

    #[tokio::test]
    async fn test_run_hook_returns_events() {
        let sandbox = Arc::new(RecordingSandbox {
            hooks: Mutex::new(Vec::new()),
            result: json!({"status": "ok", "output": [{"id": 1}, {"id": 2}]}),
        });
        let hooks = TriggerHooks::new(sandbox.clone());
        let events = hooks
            .invoke(&flow("rss", "new_item"), TriggerHookType::Run, None, None)
            .await
            .unwrap();
        assert_eq!(events, vec![json!({"id": 1}), json!({"id": 2})]);

        let none = hooks
            .invoke(&flow("rss", "new_item"), TriggerHookType::OnEnable, None, None)
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(
            *sandbox.hooks.lock(),
            vec![TriggerHookType::Run, TriggerHookType::OnEnable]
        );
    }

    #[tokio::test]
    async fn test_hook_fault_is_error() {
        let sandbox = Arc::new(RecordingSandbox {
            hooks: Mutex::new(Vec::new()),
            result: Value::Null,
        });
        let hooks = TriggerHooks::new(sandbox);
        match hooks
            .invoke(&flow("rss", "broken"), TriggerHookType::Run, None, None)
            .await
        {
            Err(EngineError::SandboxFault { status, .. }) => {
                assert_eq!(status, EngineResponseStatus::Timeout)
            }
            other => panic!("Expected SandboxFault, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_webhook_trigger_skips_sandbox() {
        let sandbox = Arc::new(RecordingSandbox {
            hooks: Mutex::new(Vec::new()),
            result: Value::Null,
        });
        let hooks = TriggerHooks::new(sandbox.clone());
        let f = flow("webhook", "catch");
        let payload = json!({"body": "hi"});
        let events = hooks
            .invoke(&f, TriggerHookType::Run, Some(payload.clone()), None)
            .await
            .unwrap();
        assert_eq!(events, vec![payload]);
        assert!(
            hooks
                .invoke(&f, TriggerHookType::OnEnable, None, None)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(sandbox.hooks.lock().is_empty());
    }
}
