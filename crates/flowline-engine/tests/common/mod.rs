//! Shared fixtures: a scripted in-process sandbox and flow builders.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use flowline_engine::protocol::{ExecuteActionPayload, TriggerHookPayload};
use flowline_engine::{
    EngineConfig, EngineOperationType, FlowEngine, FlowVersion, JobScheduler, MemoryStore, Result,
    Sandbox, SandboxOperation, SandboxResponse, SchedulerConfig,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

type Handler = dyn Fn(&SandboxOperation) -> SandboxResponse + Send + Sync;

/// Sandbox whose answers come from a closure. Every operation is recorded.
pub struct ScriptedSandbox {
    handler: Box<Handler>,
    calls: Mutex<Vec<SandboxOperation>>,
}

impl ScriptedSandbox {
    pub fn new(handler: impl Fn(&SandboxOperation) -> SandboxResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Echo sandbox: every action succeeds with its resolved input as output.
    pub fn echo() -> Arc<Self> {
        Self::new(|op| match action_payload(op) {
            Some(p) => ok(p.input),
            None => SandboxResponse::ok(json!({"status": "ok", "output": []})),
        })
    }

    pub fn calls(&self) -> Vec<SandboxOperation> {
        self.calls.lock().clone()
    }

    /// Decoded `EXECUTE_FLOW` payloads, in call order.
    pub fn action_calls(&self) -> Vec<ExecuteActionPayload> {
        self.calls.lock().iter().filter_map(action_payload).collect()
    }

    /// Decoded trigger hook payloads, in call order.
    pub fn hook_calls(&self) -> Vec<TriggerHookPayload> {
        self.calls
            .lock()
            .iter()
            .filter(|op| op.operation_type == EngineOperationType::ExecuteTriggerHook)
            .filter_map(|op| serde_json::from_value(op.payload.clone()).ok())
            .collect()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(&self, operation: SandboxOperation) -> Result<SandboxResponse> {
        let response = (self.handler)(&operation);
        self.calls.lock().push(operation);
        Ok(response)
    }
}

pub fn action_payload(op: &SandboxOperation) -> Option<ExecuteActionPayload> {
    if op.operation_type != EngineOperationType::ExecuteFlow {
        return None;
    }
    serde_json::from_value(op.payload.clone()).ok()
}

/// A healthy `ok` envelope.
pub fn ok(output: Value) -> SandboxResponse {
    SandboxResponse::ok(json!({"status": "ok", "output": output}))
}

pub fn engine_with(sandbox: Arc<ScriptedSandbox>) -> (Arc<FlowEngine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = FlowEngine::with_store(
        EngineConfig::default(),
        sandbox,
        store.clone(),
        Arc::new(JobScheduler::new(SchedulerConfig::default())),
    );
    (Arc::new(engine), store)
}

/// A piece action node.
pub fn action(name: &str, piece: &str, action_name: &str, input: Value) -> Value {
    json!({
        "name": name,
        "type": "ACTION",
        "settings": {
            "piece_name": piece,
            "piece_version": "1.0.0",
            "action_name": action_name,
            "input": input
        }
    })
}

/// Link nodes into a chain through `next_action`.
pub fn chain(nodes: Vec<Value>) -> Value {
    nodes
        .into_iter()
        .rev()
        .fold(Value::Null, |next, mut node| {
            if !next.is_null() {
                node["next_action"] = next;
            }
            node
        })
}

/// A manual-trigger flow whose first action is `first` (or none for `null`).
pub fn flow(id: &str, first: Value) -> FlowVersion {
    let mut trigger = json!({
        "name": "trigger",
        "settings": {"piece_name": "manual", "piece_version": "1.0.0", "trigger_name": "start"}
    });
    if !first.is_null() {
        trigger["next_action"] = first;
    }
    serde_json::from_value(json!({"id": id, "trigger": trigger})).unwrap()
}

/// A flow with a custom trigger strategy and trigger piece.
pub fn triggered_flow(id: &str, piece: &str, strategy: Value, first: Value) -> FlowVersion {
    let mut flow = flow(id, first);
    flow.trigger.settings.piece_name = piece.to_string();
    flow.trigger.settings.strategy = serde_json::from_value(strategy).unwrap();
    flow
}
