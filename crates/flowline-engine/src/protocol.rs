//! Sandbox operation protocol.
//!
//! Every piece action and trigger hook runs in an isolated worker that
//! receives a [`SandboxOperation`] on stdin and answers with a JSON result on
//! stdout. The engine wraps the worker's answer in a [`SandboxResponse`]
//! whose `status` classifies worker health (`OK`, `TIMEOUT`, `MEMORY_ISSUE`,
//! `INTERNAL_ERROR`). A healthy worker may still report a step failure or a
//! pause request through the [`PieceOutput`] envelope inside `result`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::pause::PauseMetadata;

/// The kind of work the sandboxed worker is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineOperationType {
    ExtractPieceMetadata,
    ExecuteFlow,
    ExecuteProperty,
    ExecuteTriggerHook,
    ExecuteValidateAuth,
}

/// Health of a sandbox invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineResponseStatus {
    Ok,
    InternalError,
    Timeout,
    MemoryIssue,
}

impl fmt::Display for EngineResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineResponseStatus::Ok => "OK",
            EngineResponseStatus::InternalError => "INTERNAL_ERROR",
            EngineResponseStatus::Timeout => "TIMEOUT",
            EngineResponseStatus::MemoryIssue => "MEMORY_ISSUE",
        };
        f.write_str(s)
    }
}

/// Which lifecycle function of a trigger to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerHookType {
    OnEnable,
    OnDisable,
    Handshake,
    Renew,
    Run,
    Test,
}

/// Whether a step is entered for the first time or re-entered after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    #[default]
    Begin,
    Resume,
}

/// Request envelope written to the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOperation {
    #[serde(rename = "type")]
    pub operation_type: EngineOperationType,
    pub payload: Value,
}

impl SandboxOperation {
    /// Build an operation from any serializable payload.
    pub fn new<P: Serialize>(operation_type: EngineOperationType, payload: &P) -> Result<Self> {
        Ok(Self {
            operation_type,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// The piece this operation targets, if the payload names one.
    pub fn piece(&self) -> Option<PieceRef> {
        serde_json::from_value(self.payload.get("piece")?.clone()).ok()
    }
}

/// Response envelope produced by the sandbox for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub status: EngineResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Diagnostic text for non-OK statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SandboxResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            status: EngineResponseStatus::Ok,
            result: Some(result),
            message: None,
        }
    }

    pub fn fault(status: EngineResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            result: None,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == EngineResponseStatus::Ok
    }

    /// Convert a non-OK response into a [`EngineError::SandboxFault`] and an
    /// OK response into its result value (`null` when absent).
    pub fn into_result(self) -> Result<Value> {
        if self.is_ok() {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(EngineError::SandboxFault {
            status: self.status,
            message: self
                .message
                .unwrap_or_else(|| "worker reported no detail".to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Name and exact version of a piece module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRef {
    pub name: String,
    pub version: String,
}

impl PieceRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PieceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Payload for `EXECUTE_FLOW`: run one piece action of a flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteActionPayload {
    pub piece: PieceRef,
    pub action_name: String,
    pub input: Value,
    pub run_id: String,
    pub step_name: String,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
}

/// Payload for `EXECUTE_TRIGGER_HOOK`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerHookPayload {
    pub piece: PieceRef,
    pub trigger_name: String,
    pub hook_type: TriggerHookType,
    pub flow_version_id: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
}

/// Payload for `EXECUTE_PROPERTY`: compute dynamic options for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePropertyPayload {
    pub piece: PieceRef,
    pub action_or_trigger_name: String,
    pub property_name: String,
    pub input: Value,
}

/// Payload for `EXECUTE_VALIDATE_AUTH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateAuthPayload {
    pub piece: PieceRef,
    pub auth: Value,
}

/// Payload for `EXTRACT_PIECE_METADATA`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractMetadataPayload {
    pub piece: PieceRef,
}

// ---------------------------------------------------------------------------
// Piece result envelope
// ---------------------------------------------------------------------------

/// Outcome reported by a healthy worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceStatus {
    Ok,
    Error,
    Paused,
}

/// Result envelope a piece writes to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceOutput {
    pub status: PieceStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pause: Option<PauseMetadata>,
}

impl PieceOutput {
    /// Decode a sandbox `result` value into the envelope.
    ///
    /// A malformed envelope is a guest fault (`INTERNAL_ERROR`).
    pub fn from_result(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::SandboxFault {
            status: EngineResponseStatus::InternalError,
            message: format!("Piece produced an invalid result envelope: {e}"),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == PieceStatus::Ok
    }
}
