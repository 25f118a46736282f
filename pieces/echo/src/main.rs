//! Echo piece: reads a sandbox operation on stdin, writes a result envelope.
//!
//! Actions:
//! - `echo`: returns its input unchanged
//! - `fail`: reports a step failure with `input.message`
//! - `wait`: pauses for a webhook; on resume returns the resume payload
//!
//! Trigger `new_event`: `RUN` yields `input.events` (or the delivered
//! payload), `TEST` yields one sample event.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Read;

#[derive(Deserialize)]
struct Operation {
    #[serde(rename = "type")]
    operation_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
struct PieceOutput {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pause: Option<Value>,
}

impl PieceOutput {
    fn ok(output: Value) -> Self {
        Self {
            status: "ok".into(),
            output: Some(output),
            error: None,
            pause: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            output: None,
            error: Some(msg.into()),
            pause: None,
        }
    }

    fn paused(pause: Value) -> Self {
        Self {
            status: "paused".into(),
            output: None,
            error: None,
            pause: Some(pause),
        }
    }
}

/// Core processing logic, separated for testability.
fn process(input: &str) -> PieceOutput {
    let op: Operation = match serde_json::from_str(input) {
        Ok(op) => op,
        Err(e) => return PieceOutput::error(format!("Invalid operation JSON: {e}")),
    };
    let payload = &op.payload;

    match op.operation_type.as_str() {
        "EXECUTE_FLOW" => execute_action(payload),
        "EXECUTE_TRIGGER_HOOK" => execute_hook(payload),
        "EXTRACT_PIECE_METADATA" => PieceOutput::ok(json!({
            "name": "echo",
            "actions": ["echo", "fail", "wait"],
            "triggers": ["new_event"]
        })),
        "EXECUTE_PROPERTY" => PieceOutput::ok(json!({"options": []})),
        "EXECUTE_VALIDATE_AUTH" => {
            let valid = !matches!(payload.get("auth"), None | Some(Value::Null));
            PieceOutput::ok(json!({"valid": valid}))
        }
        other => PieceOutput::error(format!("Unsupported operation: {other}")),
    }
}

fn execute_action(payload: &Value) -> PieceOutput {
    let input = payload.get("input").cloned().unwrap_or(Value::Null);
    let resuming = payload.get("execution_type").and_then(Value::as_str) == Some("RESUME");

    match payload.get("action_name").and_then(Value::as_str) {
        Some("echo") => PieceOutput::ok(input),
        Some("fail") => PieceOutput::error(
            input
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("echo failure"),
        ),
        Some("wait") if resuming => {
            PieceOutput::ok(payload.get("resume_payload").cloned().unwrap_or(Value::Null))
        }
        Some("wait") => PieceOutput::paused(json!({"type": "WEBHOOK"})),
        Some(other) => PieceOutput::error(format!("Unknown action: {other}")),
        None => PieceOutput::error("Missing action_name"),
    }
}

fn execute_hook(payload: &Value) -> PieceOutput {
    match payload.get("hook_type").and_then(Value::as_str) {
        Some("RUN") => {
            let events = payload
                .get("input")
                .and_then(|i| i.get("events"))
                .cloned()
                .or_else(|| payload.get("trigger_payload").map(|p| json!([p])))
                .unwrap_or_else(|| json!([]));
            PieceOutput::ok(events)
        }
        Some("TEST") => PieceOutput::ok(json!([{"sample": true}])),
        Some(_) => PieceOutput::ok(Value::Null),
        None => PieceOutput::error("Missing hook_type"),
    }
}

fn main() {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprint!("Failed to read stdin: {e}");
        std::process::exit(1);
    }

    match serde_json::to_string(&process(&input)) {
        Ok(json) => print!("{json}"),
        Err(_) => print!(r#"{{"status":"error","error":"serialization failed"}}"#),
    }
}
