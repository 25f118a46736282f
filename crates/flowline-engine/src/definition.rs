//! Flow graph model.
//!
//! A [`FlowVersion`] is a trigger followed by a singly-linked chain of
//! action nodes. An action node is a plain piece step, a router holding
//! ordered conditioned sub-chains, or a loop holding one sub-chain executed
//! per item. Flow versions are read-only to the engine.
//!
//! # Example TOML
//!
//! ```toml
//! id = "fv-digest"
//! display_name = "Daily digest"
//!
//! [trigger]
//! name = "trigger"
//! [trigger.settings]
//! piece_name = "schedule"
//! piece_version = "0.1.0"
//! trigger_name = "every_day"
//! strategy = { type = "POLLING", cron_expression = "0 9 * * *", timezone = "Europe/Paris" }
//!
//! [trigger.next_action]
//! name = "each_item"
//! type = "LOOP_ON_ITEMS"
//! items = "{{trigger.items}}"
//!
//! [trigger.next_action.first_loop_action]
//! name = "notify"
//! type = "ACTION"
//! [trigger.next_action.first_loop_action.settings]
//! piece_name = "slack"
//! piece_version = "0.3.1"
//! action_name = "send_message"
//! input = { text = "{{each_item.item.title}}" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::BranchCondition;
use crate::error::{EngineError, Result};
use crate::protocol::PieceRef;
use crate::scheduler::{parse_cron, parse_timezone};

/// An immutable, versioned flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    /// Unique flow version id.
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    pub trigger: TriggerNode,
}

/// The entry node of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerNode {
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    pub settings: TriggerSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<Box<ActionNode>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub piece_name: String,
    pub piece_version: String,
    pub trigger_name: String,

    /// Trigger input (templated against `configs`).
    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub strategy: TriggerStrategy,
}

impl TriggerSettings {
    pub fn piece(&self) -> PieceRef {
        PieceRef::new(&self.piece_name, &self.piece_version)
    }
}

/// How a trigger produces events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStrategy {
    /// Started explicitly; no hooks and no job.
    #[default]
    Manual,
    /// External callbacks deliver events.
    Webhook,
    /// The engine polls the trigger on a cron schedule.
    Polling {
        cron_expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A node in an action chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Step name, unique within the flow.
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(flatten)]
    pub kind: ActionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<Box<ActionNode>>,
}

/// What an action node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// A single piece (or built-in) action.
    Action { settings: ActionSettings },
    /// Ordered conditioned sub-chains; first match wins.
    Router { branches: Vec<RouterBranch> },
    /// One sub-chain executed per item, sequentially.
    LoopOnItems {
        /// Template expression producing the iterable.
        items: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_loop_action: Option<Box<ActionNode>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSettings {
    pub piece_name: String,
    pub piece_version: String,
    pub action_name: String,

    /// Input expression map.
    #[serde(default)]
    pub input: Value,

    /// Record faults as this step's output and keep going.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Extra attempts after a fault or step failure.
    #[serde(default)]
    pub retry_attempts: u32,

    /// Delay between attempts in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: u64,
}

impl ActionSettings {
    pub fn piece(&self) -> PieceRef {
        PieceRef::new(&self.piece_name, &self.piece_version)
    }
}

/// One branch of a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterBranch {
    #[serde(default)]
    pub name: String,

    /// OR-of-AND groups. Empty means the branch always matches.
    #[serde(default)]
    pub conditions: Vec<Vec<BranchCondition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_action: Option<Box<ActionNode>>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl FlowVersion {
    /// Parse a flow version from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidFlow(format!("JSON parse error: {}", e)))
    }

    /// Parse a flow version from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| EngineError::InvalidFlow(format!("TOML parse error: {}", e)))
    }

    /// Load a flow version from a `.json` or `.toml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidFlow(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            other => Err(EngineError::InvalidFlow(format!(
                "Unsupported flow file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph queries
// ---------------------------------------------------------------------------

impl FlowVersion {
    /// First action after the trigger.
    pub fn first_action(&self) -> Option<&ActionNode> {
        self.trigger.next_action.as_deref()
    }

    /// Find an action node anywhere in the graph.
    pub fn find_action(&self, name: &str) -> Option<&ActionNode> {
        self.first_action().and_then(|a| a.find(name))
    }

    /// All step names in depth-first order, trigger first.
    pub fn step_names(&self) -> Vec<&str> {
        let mut names = vec![self.trigger.name.as_str()];
        if let Some(first) = self.first_action() {
            first.collect_names(&mut names);
        }
        names
    }
}

impl ActionNode {
    /// Iterate this node and its successors along the chain.
    pub fn chain(&self) -> ChainIter<'_> {
        ChainIter { next: Some(self) }
    }

    /// Whether `name` is this node or lives in one of its sub-chains.
    ///
    /// Successors along the chain are not searched.
    pub fn contains(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        match &self.kind {
            ActionKind::Action { .. } => false,
            ActionKind::Router { branches } => branches.iter().any(|b| {
                b.first_action
                    .as_deref()
                    .is_some_and(|first| chain_contains(first, name))
            }),
            ActionKind::LoopOnItems {
                first_loop_action, ..
            } => first_loop_action
                .as_deref()
                .is_some_and(|first| chain_contains(first, name)),
        }
    }

    /// Find `name` in this chain or any nested sub-chain.
    pub fn find(&self, name: &str) -> Option<&ActionNode> {
        for node in self.chain() {
            if node.name == name {
                return Some(node);
            }
            let nested = match &node.kind {
                ActionKind::Action { .. } => None,
                ActionKind::Router { branches } => branches
                    .iter()
                    .filter_map(|b| b.first_action.as_deref())
                    .find_map(|first| first.find(name)),
                ActionKind::LoopOnItems {
                    first_loop_action, ..
                } => first_loop_action.as_deref().and_then(|f| f.find(name)),
            };
            if nested.is_some() {
                return nested;
            }
        }
        None
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        for node in self.chain() {
            names.push(node.name.as_str());
            match &node.kind {
                ActionKind::Action { .. } => {}
                ActionKind::Router { branches } => {
                    for first in branches.iter().filter_map(|b| b.first_action.as_deref()) {
                        first.collect_names(names);
                    }
                }
                ActionKind::LoopOnItems {
                    first_loop_action, ..
                } => {
                    if let Some(first) = first_loop_action.as_deref() {
                        first.collect_names(names);
                    }
                }
            }
        }
    }
}

/// Whether any node along a chain (or inside it) is named `name`.
pub fn chain_contains(first: &ActionNode, name: &str) -> bool {
    first.chain().any(|node| node.contains(name))
}

/// Iterator over a singly-linked action chain.
pub struct ChainIter<'a> {
    next: Option<&'a ActionNode>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a ActionNode;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next_action.as_deref();
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl FlowVersion {
    /// Validate the flow graph.
    ///
    /// Checks:
    /// - Non-empty id and step names
    /// - Step names unique across the whole graph
    /// - Piece and action names present on every action
    /// - Loops carry an items expression
    /// - Polling triggers have a parseable cron expression and timezone
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidFlow(
                "Flow version id cannot be empty".into(),
            ));
        }

        let trigger = &self.trigger.settings;
        if trigger.piece_name.is_empty() || trigger.trigger_name.is_empty() {
            return Err(EngineError::InvalidFlow(
                "Trigger must name a piece and a trigger".into(),
            ));
        }
        if let TriggerStrategy::Polling {
            cron_expression,
            timezone,
        } = &trigger.strategy
        {
            parse_cron(cron_expression)
                .map_err(|e| EngineError::InvalidFlow(format!("Trigger schedule: {e}")))?;
            parse_timezone(timezone)
                .map_err(|e| EngineError::InvalidFlow(format!("Trigger schedule: {e}")))?;
        }

        let mut seen = HashSet::new();
        for name in self.step_names() {
            if name.is_empty() {
                return Err(EngineError::InvalidFlow("Step name cannot be empty".into()));
            }
            if !seen.insert(name) {
                return Err(EngineError::InvalidFlow(format!(
                    "Duplicate step name: {}",
                    name
                )));
            }
        }

        if let Some(first) = self.first_action() {
            validate_chain(first)?;
        }
        Ok(())
    }
}

fn validate_chain(first: &ActionNode) -> Result<()> {
    for node in first.chain() {
        match &node.kind {
            ActionKind::Action { settings } => {
                if settings.piece_name.is_empty() || settings.action_name.is_empty() {
                    return Err(EngineError::InvalidFlow(format!(
                        "Step '{}' must name a piece and an action",
                        node.name
                    )));
                }
            }
            ActionKind::Router { branches } => {
                for first in branches.iter().filter_map(|b| b.first_action.as_deref()) {
                    validate_chain(first)?;
                }
            }
            ActionKind::LoopOnItems {
                items,
                first_loop_action,
            } => {
                if items.trim().is_empty() {
                    return Err(EngineError::InvalidFlow(format!(
                        "Loop '{}' has no items expression",
                        node.name
                    )));
                }
                if let Some(first) = first_loop_action.as_deref() {
                    validate_chain(first)?;
                }
            }
        }
    }
    Ok(())
}
