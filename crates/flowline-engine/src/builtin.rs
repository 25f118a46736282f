//! Built-in actions executed in-process.
//!
//! | piece      | action              | behaviour                                   |
//! |------------|---------------------|---------------------------------------------|
//! | `delay`    | `delay_for`         | pause for `delay_in_ms` / `delay_seconds`   |
//! | `delay`    | `delay_until`       | pause until `resume_at` (RFC 3339)          |
//! | `approval` | `wait_for_approval` | manual task; resume payload becomes output  |
//! | `webhook`  | `wait_for_callback` | webhook; callback payload becomes output    |

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::{EngineError, Result};
use crate::interpreter::StepOutcome;
use crate::pause::PauseMetadata;
use crate::protocol::ExecutionType;

pub const DELAY_PIECE: &str = "delay";
pub const APPROVAL_PIECE: &str = "approval";
pub const WEBHOOK_PIECE: &str = "webhook";

/// Whether `piece_name` is handled locally instead of through the sandbox.
pub fn is_builtin(piece_name: &str) -> bool {
    matches!(piece_name, DELAY_PIECE | APPROVAL_PIECE | WEBHOOK_PIECE)
}

/// Invocation context for a built-in action.
pub struct BuiltinCall<'a> {
    pub step_name: &'a str,
    pub piece_name: &'a str,
    pub action_name: &'a str,
    pub input: &'a Value,
    pub execution_type: ExecutionType,
    pub resume_payload: Option<&'a Value>,
    pub now: DateTime<Utc>,
}

/// Run a built-in action.
pub fn execute_builtin(call: &BuiltinCall<'_>) -> Result<StepOutcome> {
    match (call.piece_name, call.action_name) {
        (DELAY_PIECE, "delay_for") => delay_for(call),
        (DELAY_PIECE, "delay_until") => delay_until(call),
        (APPROVAL_PIECE, "wait_for_approval") => wait(call, PauseMetadata::ManualTask {}),
        (WEBHOOK_PIECE, "wait_for_callback") => wait(call, PauseMetadata::Webhook {}),
        (piece, action) => Err(failure(
            call,
            format!("Unknown built-in action '{piece}/{action}'"),
        )),
    }
}

fn delay_for(call: &BuiltinCall<'_>) -> Result<StepOutcome> {
    if call.execution_type == ExecutionType::Resume {
        return Ok(StepOutcome::Succeeded(json!({"success": true})));
    }

    let delay_ms = match (
        call.input.get("delay_in_ms").and_then(as_i64),
        call.input.get("delay_seconds").and_then(as_i64),
    ) {
        (Some(ms), _) => ms,
        (None, Some(secs)) => secs
            .checked_mul(1000)
            .ok_or_else(|| failure(call, "delay out of range".into()))?,
        (None, None) => {
            return Err(failure(
                call,
                "delay_for requires 'delay_in_ms' or 'delay_seconds'".into(),
            ));
        }
    };

    let resume_at = chrono::TimeDelta::try_milliseconds(delay_ms)
        .and_then(|delta| call.now.checked_add_signed(delta))
        .ok_or_else(|| failure(call, "delay out of range".into()))?;
    Ok(StepOutcome::Paused(PauseMetadata::delay_until(resume_at)))
}

fn delay_until(call: &BuiltinCall<'_>) -> Result<StepOutcome> {
    if call.execution_type == ExecutionType::Resume {
        return Ok(StepOutcome::Succeeded(json!({"success": true})));
    }

    let raw = call
        .input
        .get("resume_at")
        .and_then(Value::as_str)
        .ok_or_else(|| failure(call, "delay_until requires 'resume_at'".into()))?;
    let resume_at = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| failure(call, format!("Invalid resume_at '{raw}': {e}")))?
        .with_timezone(&Utc);

    Ok(StepOutcome::Paused(PauseMetadata::delay_until(resume_at)))
}

fn wait(call: &BuiltinCall<'_>, pause: PauseMetadata) -> Result<StepOutcome> {
    match call.execution_type {
        ExecutionType::Begin => Ok(StepOutcome::Paused(pause)),
        ExecutionType::Resume => Ok(StepOutcome::Succeeded(
            call.resume_payload.cloned().unwrap_or(Value::Null),
        )),
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn failure(call: &BuiltinCall<'_>, message: String) -> EngineError {
    EngineError::StepFailure {
        step: call.step_name.to_string(),
        message,
    }
}
