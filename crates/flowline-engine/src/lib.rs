//! Flow execution engine for Flowline.
//!
//! Runs versioned flow graphs (a trigger followed by a chain of actions,
//! routers and loops), invoking piece code through an isolated WASM sandbox.
//! Runs can suspend on delays, webhooks or manual tasks and resume later
//! from the exact step that paused.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  FlowEngine                                             │
//! │  - execute / resume / stop runs                         │
//! │  - enable / disable triggers, webhook delivery          │
//! │  - JobProcessor for the scheduler                       │
//! ├──────────────────┬──────────────────┬───────────────────┤
//! │  Interpreter     │  PauseController │  JobScheduler     │
//! │  ExecutionState  │  RunStore        │  cron + resumes   │
//! ├──────────────────┴──────────────────┴───────────────────┤
//! │  Sandbox (WasmSandbox over PieceCatalog)                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod builtin;
pub mod catalog;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod pause;
pub mod protocol;
pub mod sandbox;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod trigger;

pub use catalog::{CatalogEntry, PieceCatalog};
pub use condition::{BranchCondition, ConditionOperator};
pub use context::ContextResolver;
pub use definition::{
    ActionKind, ActionNode, ActionSettings, FlowVersion, RouterBranch, TriggerNode,
    TriggerSettings, TriggerStrategy,
};
pub use engine::{EngineConfig, FlowEngine, RunResult, StopOutcome};
pub use error::{EngineError, Result};
pub use interpreter::{ChainOutcome, Interpreter, StepOutcome};
pub use pause::{Cursor, DelayDecision, DelayPolicy, PauseController, PauseMetadata};
pub use protocol::{
    EngineOperationType, EngineResponseStatus, ExecutionType, PieceOutput, PieceRef, PieceStatus,
    SandboxOperation, SandboxResponse, TriggerHookType,
};
pub use sandbox::{Sandbox, SandboxConfig, WasmSandbox};
pub use scheduler::{JobData, JobProcessor, JobScheduler, ScheduledJob, SchedulerConfig};
pub use state::{Ancestor, ExecutionState, StepOutput, StepScope, StepStatus};
pub use store::{FlowStore, MemoryStore, RunRecord, RunStatus, RunStore, SqliteStore};
pub use trigger::{TriggerHooks, TriggerRegistration};
