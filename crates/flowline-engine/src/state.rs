//! Per-run execution state.
//!
//! Two namespaces: `configs` (flow-level constants seeded once) and `steps`
//! (outputs keyed by step name). Steps that run inside a loop are stored in
//! that loop's iteration maps, addressed by an ancestor path of
//! `(loop step name, iteration index)` frames.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ContextResolver;
use crate::error::{EngineError, Result};

/// Outputs of the steps in one scope (top level or one loop iteration).
pub type StepScope = BTreeMap<String, StepOutput>;

/// Status recorded alongside a step's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
}

/// Recorded result of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutput {
    Simple {
        status: StepStatus,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Loop {
        status: StepStatus,
        #[serde(default)]
        input: Value,
        /// Item of the iteration currently (or last) executed.
        #[serde(default)]
        item: Value,
        #[serde(default)]
        index: usize,
        #[serde(default)]
        iterations: Vec<StepScope>,
    },
}

impl StepOutput {
    /// A succeeded step with the given output and no recorded input.
    pub fn simple(output: Value) -> Self {
        StepOutput::Simple {
            status: StepStatus::Succeeded,
            input: Value::Null,
            output,
            error_message: None,
        }
    }

    /// An empty loop shell, registered before the loop body runs.
    pub fn loop_shell(input: Value) -> Self {
        StepOutput::Loop {
            status: StepStatus::Running,
            input,
            item: Value::Null,
            index: 0,
            iterations: Vec::new(),
        }
    }

    pub fn status(&self) -> StepStatus {
        match self {
            StepOutput::Simple { status, .. } | StepOutput::Loop { status, .. } => *status,
        }
    }

    pub fn set_status(&mut self, new_status: StepStatus) {
        match self {
            StepOutput::Simple { status, .. } | StepOutput::Loop { status, .. } => {
                *status = new_status
            }
        }
    }

    /// The output value of a simple step; `None` for loops.
    pub fn output(&self) -> Option<&Value> {
        match self {
            StepOutput::Simple { output, .. } => Some(output),
            StepOutput::Loop { .. } => None,
        }
    }

    /// The iteration maps of a loop step; `None` for simple steps.
    pub fn iterations(&self) -> Option<&[StepScope]> {
        match self {
            StepOutput::Loop { iterations, .. } => Some(iterations),
            StepOutput::Simple { .. } => None,
        }
    }

    /// The value templates see when they reference this step by name.
    fn template_value(&self) -> Value {
        match self {
            StepOutput::Simple { output, .. } => output.clone(),
            StepOutput::Loop {
                item,
                index,
                iterations,
                ..
            } => serde_json::json!({
                "item": item,
                "index": index,
                "iterations": iterations
                    .iter()
                    .map(scope_to_value)
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

fn scope_to_value(scope: &StepScope) -> Value {
    Value::Object(
        scope
            .iter()
            .map(|(name, step)| (name.clone(), step.template_value()))
            .collect(),
    )
}

/// One frame of an ancestor path: the enclosing loop and its iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestor {
    pub step_name: String,
    pub index: usize,
}

impl Ancestor {
    pub fn new(step_name: impl Into<String>, index: usize) -> Self {
        Self {
            step_name: step_name.into(),
            index,
        }
    }
}

/// Mutable per-run store of configs and step outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    configs: Map<String, Value>,
    #[serde(default)]
    steps: StepScope,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configs(&self) -> &Map<String, Value> {
        &self.configs
    }

    /// Top-level step outputs.
    pub fn steps(&self) -> &StepScope {
        &self.steps
    }

    /// Seed configs from a mapping or from a list of `[key, value]` pairs.
    ///
    /// Any other shape is rejected without modifying the state.
    pub fn insert_configs(&mut self, source: &Value) -> Result<()> {
        match source {
            Value::Object(map) => {
                for (key, value) in map {
                    self.configs.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            Value::Array(items) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_array().map(Vec::as_slice) {
                        Some([Value::String(key), value]) => pairs.push((key.clone(), value.clone())),
                        _ => {
                            return Err(EngineError::InvalidConfigsInput(format!(
                                "expected a [key, value] pair, got {item}"
                            )));
                        }
                    }
                }
                self.configs.extend(pairs);
                Ok(())
            }
            other => Err(EngineError::InvalidConfigsInput(format!(
                "expected a mapping or a list of pairs, got {other}"
            ))),
        }
    }

    /// Write `output` under `step_name` in the scope addressed by `ancestors`.
    ///
    /// Missing loop entries and iteration maps along the path are created.
    /// An existing entry with the same name in the target scope is replaced.
    pub fn insert_step(
        &mut self,
        output: StepOutput,
        step_name: &str,
        ancestors: &[Ancestor],
    ) -> Result<()> {
        let scope = self.scope_mut(ancestors)?;
        scope.insert(step_name.to_string(), output);
        Ok(())
    }

    /// Look up a step output in the scope addressed by `ancestors`.
    pub fn get_step(&self, step_name: &str, ancestors: &[Ancestor]) -> Option<&StepOutput> {
        let mut scope = &self.steps;
        for frame in ancestors {
            scope = scope
                .get(&frame.step_name)?
                .iterations()?
                .get(frame.index)?;
        }
        scope.get(step_name)
    }

    /// Mutable access to a step output in the scope addressed by `ancestors`.
    pub fn get_step_mut(
        &mut self,
        step_name: &str,
        ancestors: &[Ancestor],
    ) -> Option<&mut StepOutput> {
        let mut scope = &mut self.steps;
        for frame in ancestors {
            scope = match scope.get_mut(&frame.step_name)? {
                StepOutput::Loop { iterations, .. } => iterations.get_mut(frame.index)?,
                StepOutput::Simple { .. } => return None,
            };
        }
        scope.get_mut(step_name)
    }

    /// Append a fresh iteration to a loop and mark it current.
    ///
    /// Returns the index of the new iteration.
    pub fn push_iteration(
        &mut self,
        loop_name: &str,
        ancestors: &[Ancestor],
        item: Value,
    ) -> Result<usize> {
        match self.get_step_mut(loop_name, ancestors) {
            Some(StepOutput::Loop {
                iterations,
                item: current,
                index,
                ..
            }) => {
                iterations.push(StepScope::new());
                *current = item;
                *index = iterations.len() - 1;
                Ok(*index)
            }
            Some(StepOutput::Simple { .. }) => Err(EngineError::InvalidState(format!(
                "step '{loop_name}' is not a loop"
            ))),
            None => Err(EngineError::InvalidState(format!(
                "loop '{loop_name}' has not been registered"
            ))),
        }
    }

    /// Point a loop's current item/index at an existing iteration.
    pub fn select_iteration(
        &mut self,
        loop_name: &str,
        ancestors: &[Ancestor],
        position: usize,
        item: Value,
    ) -> Result<()> {
        match self.get_step_mut(loop_name, ancestors) {
            Some(StepOutput::Loop {
                iterations,
                item: current,
                index,
                ..
            }) => {
                while iterations.len() <= position {
                    iterations.push(StepScope::new());
                }
                *current = item;
                *index = position;
                Ok(())
            }
            _ => Err(EngineError::InvalidState(format!(
                "loop '{loop_name}' has not been registered"
            ))),
        }
    }

    /// Template data visible to a step running at `ancestors`.
    ///
    /// Top-level steps are overlaid with each enclosing iteration's steps,
    /// outermost first, so inner scopes shadow outer ones.
    pub fn visible_data(&self, ancestors: &[Ancestor]) -> HashMap<String, Value> {
        let mut data: HashMap<String, Value> = self
            .steps
            .iter()
            .map(|(name, step)| (name.clone(), step.template_value()))
            .collect();

        let mut scope = &self.steps;
        for frame in ancestors {
            let Some(iteration) = scope
                .get(&frame.step_name)
                .and_then(StepOutput::iterations)
                .and_then(|its| its.get(frame.index))
            else {
                break;
            };
            for (name, step) in iteration {
                data.insert(name.clone(), step.template_value());
            }
            scope = iteration;
        }

        data.insert("configs".to_string(), Value::Object(self.configs.clone()));
        data
    }

    /// Resolve a templated value against configs and the visible steps.
    ///
    /// Unknown references resolve to `null` (or empty text inside a larger
    /// string) instead of failing.
    pub fn resolve(&self, expression: &Value, ancestors: &[Ancestor]) -> Value {
        let data = self.visible_data(ancestors);
        ContextResolver::new(&data).resolve_value(expression)
    }

    fn scope_mut(&mut self, ancestors: &[Ancestor]) -> Result<&mut StepScope> {
        let mut scope = &mut self.steps;
        for frame in ancestors {
            let entry = scope
                .entry(frame.step_name.clone())
                .or_insert_with(|| StepOutput::loop_shell(Value::Null));
            scope = match entry {
                StepOutput::Loop { iterations, .. } => {
                    while iterations.len() <= frame.index {
                        iterations.push(StepScope::new());
                    }
                    &mut iterations[frame.index]
                }
                StepOutput::Simple { .. } => {
                    return Err(EngineError::InvalidState(format!(
                        "ancestor '{}' is not a loop",
                        frame.step_name
                    )));
                }
            };
        }
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_loop(name: &str) -> ExecutionState {
        let mut state = ExecutionState::new();
        state
            .insert_step(StepOutput::loop_shell(json!([])), name, &[])
            .unwrap();
        state
    }

    #[test]
    fn test_insert_configs_mapping() {
        let mut state = ExecutionState::new();
        state
            .insert_configs(&json!({"foo": "bar", "num": 1}))
            .unwrap();
        assert_eq!(state.configs()["foo"], json!("bar"));
        assert_eq!(state.configs()["num"], json!(1));
        assert_eq!(state.configs().len(), 2);
    }

    #[test]
    fn test_insert_configs_pairs() {
        let mut state = ExecutionState::new();
        state
            .insert_configs(&json!([["foo", "bar"], ["num", 1]]))
            .unwrap();
        assert_eq!(state.configs()["foo"], json!("bar"));
        assert_eq!(state.configs()["num"], json!(1));
    }

    #[test]
    fn test_insert_configs_rejects_scalar_array() {
        let mut state = ExecutionState::new();
        let err = state.insert_configs(&json!([1, "test"])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfigsInput(_)));
        assert!(state.configs().is_empty());
    }

    #[test]
    fn test_insert_configs_rejects_partial_pairs() {
        let mut state = ExecutionState::new();
        let err = state
            .insert_configs(&json!([["ok", 1], ["missing_value"]]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfigsInput(_)));
        // Nothing from the valid prefix is applied
        assert!(state.configs().is_empty());
    }

    #[test]
    fn test_insert_configs_rejects_scalars() {
        let mut state = ExecutionState::new();
        assert!(state.insert_configs(&json!("text")).is_err());
        assert!(state.insert_configs(&json!(42)).is_err());
        assert!(state.insert_configs(&Value::Null).is_err());
    }

    #[test]
    fn test_insert_step_top_level() {
        let mut state = ExecutionState::new();
        state
            .insert_step(StepOutput::simple(json!("test")), "trigger", &[])
            .unwrap();
        assert_eq!(state.steps()["trigger"].output(), Some(&json!("test")));
    }

    #[test]
    fn test_insert_step_inside_loop_iteration() {
        let mut state = with_loop("loop");
        state.push_iteration("loop", &[], json!(1)).unwrap();
        state
            .insert_step(
                StepOutput::simple(json!("test")),
                "code",
                &[Ancestor::new("loop", 0)],
            )
            .unwrap();

        let iterations = state.steps()["loop"].iterations().unwrap();
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0]["code"].output(), Some(&json!("test")));
        // Loop entry itself is still a loop
        assert!(matches!(state.steps()["loop"], StepOutput::Loop { .. }));
        assert!(!state.steps().contains_key("code"));
    }

    #[test]
    fn test_insert_step_creates_missing_path() {
        let mut state = ExecutionState::new();
        let path = [Ancestor::new("outer", 1), Ancestor::new("inner", 0)];
        state
            .insert_step(StepOutput::simple(json!(5)), "leaf", &path)
            .unwrap();

        let outer = state.steps()["outer"].iterations().unwrap();
        assert_eq!(outer.len(), 2);
        assert!(outer[0].is_empty());
        let inner = outer[1]["inner"].iterations().unwrap();
        assert_eq!(inner[0]["leaf"].output(), Some(&json!(5)));
        assert_eq!(state.get_step("leaf", &path).unwrap().output(), Some(&json!(5)));
    }

    #[test]
    fn test_insert_step_overwrites() {
        let mut state = with_loop("loop");
        let path = [Ancestor::new("loop", 0)];
        state
            .insert_step(StepOutput::simple(json!("first")), "code", &path)
            .unwrap();
        state
            .insert_step(StepOutput::simple(json!("second")), "code", &path)
            .unwrap();

        let iterations = state.steps()["loop"].iterations().unwrap();
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].len(), 1);
        assert_eq!(iterations[0]["code"].output(), Some(&json!("second")));
    }

    #[test]
    fn test_insert_step_under_simple_ancestor_fails() {
        let mut state = ExecutionState::new();
        state
            .insert_step(StepOutput::simple(json!(1)), "not_loop", &[])
            .unwrap();
        let err = state
            .insert_step(
                StepOutput::simple(json!(2)),
                "child",
                &[Ancestor::new("not_loop", 0)],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[test]
    fn test_push_iteration_sets_item_and_index() {
        let mut state = with_loop("loop");
        assert_eq!(state.push_iteration("loop", &[], json!("a")).unwrap(), 0);
        assert_eq!(state.push_iteration("loop", &[], json!("b")).unwrap(), 1);
        match &state.steps()["loop"] {
            StepOutput::Loop {
                item,
                index,
                iterations,
                ..
            } => {
                assert_eq!(item, &json!("b"));
                assert_eq!(*index, 1);
                assert_eq!(iterations.len(), 2);
            }
            other => panic!("Expected loop, got: {other:?}"),
        }
    }

    #[test]
    fn test_push_iteration_unregistered_loop() {
        let mut state = ExecutionState::new();
        assert!(state.push_iteration("ghost", &[], json!(1)).is_err());
    }

    #[test]
    fn test_visible_data_inner_scope_shadows() {
        let mut state = with_loop("loop");
        state
            .insert_step(StepOutput::simple(json!("outer")), "shared", &[])
            .unwrap();
        state.push_iteration("loop", &[], json!(10)).unwrap();
        let path = [Ancestor::new("loop", 0)];
        state
            .insert_step(StepOutput::simple(json!("inner")), "shared", &path)
            .unwrap();

        let top = state.visible_data(&[]);
        assert_eq!(top["shared"], json!("outer"));

        let inside = state.visible_data(&path);
        assert_eq!(inside["shared"], json!("inner"));
        assert_eq!(inside["loop"]["item"], json!(10));
        assert_eq!(inside["loop"]["index"], json!(0));
    }

    #[test]
    fn test_resolve_configs_and_steps() {
        let mut state = ExecutionState::new();
        state.insert_configs(&json!({"channel": "#ops"})).unwrap();
        state
            .insert_step(StepOutput::simple(json!({"body": {"n": 3}})), "trigger", &[])
            .unwrap();

        let resolved = state.resolve(
            &json!({"to": "{{configs.channel}}", "n": "{{trigger.body.n}}"}),
            &[],
        );
        assert_eq!(resolved, json!({"to": "#ops", "n": 3}));
    }

    #[test]
    fn test_resolve_unknown_reference_is_null() {
        let state = ExecutionState::new();
        assert_eq!(state.resolve(&json!("{{missing.value}}"), &[]), Value::Null);
        assert_eq!(
            state.resolve(&json!("value=[{{missing}}]"), &[]),
            json!("value=[]")
        );
    }

    #[test]
    fn test_state_serde_roundtrip_keeps_shape() {
        let mut state = with_loop("loop");
        state.push_iteration("loop", &[], json!(1)).unwrap();
        state
            .insert_step(
                StepOutput::simple(json!("x")),
                "code",
                &[Ancestor::new("loop", 0)],
            )
            .unwrap();
        let wire = serde_json::to_value(&state).unwrap();
        assert_eq!(wire["steps"]["loop"]["type"], "LOOP");
        assert_eq!(wire["steps"]["loop"]["iterations"][0]["code"]["type"], "SIMPLE");
        let back: ExecutionState = serde_json::from_value(wire).unwrap();
        assert_eq!(back, state);
    }
}
