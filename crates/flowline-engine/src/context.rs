//! Template resolver for step inputs.
//!
//! Resolves `{{expression}}` templates in step inputs, router operands and
//! loop item sources against the run's visible data.
//!
//! # Template Syntax
//!
//! - `{{configs.key}}` - flow-level constants
//! - `{{step_name}}` - full output of a completed step
//! - `{{step_name.field}}` - nested field access via dot notation
//! - `{{step_name.items[0].name}}` - array index access
//! - `{{loop_name.item}}` / `{{loop_name.index}}` - current loop iteration
//!
//! A reference that does not resolve is not an error: it becomes `null` when
//! it is the whole string and empty text when embedded in a larger string.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Resolves `{{expression}}` templates against a context data map.
pub struct ContextResolver<'a> {
    data: &'a HashMap<String, Value>,
}

impl<'a> ContextResolver<'a> {
    /// Create a resolver backed by a context data map.
    ///
    /// Keys are top-level identifiers (`configs` and step names).
    pub fn new(data: &'a HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Resolve all `{{...}}` templates in a JSON value tree.
    ///
    /// - Strings: template expressions are replaced inline
    /// - Objects/Arrays: recursively resolved
    /// - Other types: returned unchanged
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            Value::Array(arr) => Value::Array(arr.iter().map(|v| self.resolve_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Resolve all `{{...}}` templates in a string.
    ///
    /// If the entire string is a single expression the result keeps the
    /// referenced JSON type. Mixed text is stringified and concatenated.
    pub fn resolve_string(&self, s: &str) -> Value {
        let expressions = parse_template_expressions(s);

        if expressions.is_empty() {
            return Value::String(s.to_string());
        }

        if expressions.len() == 1 && expressions[0].full_match == s {
            return self.lookup(&expressions[0].path).unwrap_or(Value::Null);
        }

        let mut result = s.to_string();
        for expr in &expressions {
            let replacement = match self.lookup(&expr.path) {
                Some(resolved) => value_to_string(&resolved),
                None => String::new(),
            };
            result = result.replace(&expr.full_match, &replacement);
        }

        Value::String(result)
    }

    /// Resolve a single dot-separated path, failing on unknown references.
    pub fn resolve_expression(&self, path: &str) -> Result<Value> {
        let segments = parse_path_segments(path);

        let Some(root) = segments.first() else {
            return Err(EngineError::UnresolvedReference(
                "empty template expression".into(),
            ));
        };

        let root_value = self.data.get(root.name.as_str()).ok_or_else(|| {
            EngineError::UnresolvedReference(format!(
                "'{{{{{}}}}}': unknown key '{}'",
                path, root.name
            ))
        })?;
        let mut current = match root.index {
            Some(i) => root_value.get(i).ok_or_else(|| {
                EngineError::UnresolvedReference(format!(
                    "'{{{{{}}}}}': cannot resolve segment '{}'",
                    path, root
                ))
            })?,
            None => root_value,
        };

        for segment in &segments[1..] {
            current = navigate_segment(current, segment).ok_or_else(|| {
                EngineError::UnresolvedReference(format!(
                    "'{{{{{}}}}}': cannot resolve segment '{}'",
                    path, segment
                ))
            })?;
        }

        Ok(current.clone())
    }

    fn lookup(&self, path: &str) -> Option<Value> {
        match self.resolve_expression(path) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Template reference left unresolved");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Template expression parsing
// ---------------------------------------------------------------------------

/// A parsed `{{expression}}` occurrence in a string.
#[derive(Debug)]
struct TemplateExpression {
    /// The full match including braces, e.g. `"{{step.field}}"`.
    full_match: String,
    /// The inner path, e.g. `"step.field"`.
    path: String,
}

/// Find all `{{...}}` expressions in a string.
fn parse_template_expressions(s: &str) -> Vec<TemplateExpression> {
    let mut results = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("{{") {
        if let Some(end) = remaining[start..].find("}}") {
            let full_end = start + end + 2;
            let full_match = &remaining[start..full_end];
            let inner = remaining[start + 2..start + end].trim();

            if !inner.is_empty() {
                results.push(TemplateExpression {
                    full_match: full_match.to_string(),
                    path: inner.to_string(),
                });
            }

            remaining = &remaining[full_end..];
        } else {
            break; // Unclosed `{{`
        }
    }

    results
}

/// Whether a string contains at least one template expression.
pub fn is_template(s: &str) -> bool {
    !parse_template_expressions(s).is_empty()
}

// ---------------------------------------------------------------------------
// Path navigation
// ---------------------------------------------------------------------------

/// A segment of a dot-separated path, optionally with an array index.
#[derive(Debug)]
struct PathSegment {
    name: String,
    index: Option<usize>,
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parse a dot-separated path into segments, handling array indices.
///
/// `"step.items[0].name"` → `[("step", None), ("items", Some(0)), ("name", None)]`
fn parse_path_segments(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .map(|part| {
            if let Some(bracket_start) = part.find('[')
                && let Some(bracket_end) = part.find(']')
            {
                let name = part[..bracket_start].to_string();
                let idx_str = &part[bracket_start + 1..bracket_end];
                let index = idx_str.parse::<usize>().ok();
                return PathSegment { name, index };
            }
            PathSegment {
                name: part.to_string(),
                index: None,
            }
        })
        .collect()
}

/// Navigate one segment of a path through a JSON value.
fn navigate_segment<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    let field = if segment.name.is_empty() {
        value
    } else {
        value.get(&segment.name)?
    };

    match segment.index {
        Some(i) => field.get(i),
        None => Some(field),
    }
}

/// Convert a JSON value to its string representation for interpolation.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> HashMap<String, Value> {
        let mut ctx = HashMap::new();
        ctx.insert(
            "configs".to_string(),
            json!({
                "text": "Hello world",
                "count": 42,
                "tags": ["rust", "wasm"]
            }),
        );
        ctx.insert(
            "extract".to_string(),
            json!({
                "entities": [
                    {"name": "Alice", "type": "person"},
                    {"name": "Acme", "type": "org"}
                ],
                "summary": "A greeting"
            }),
        );
        ctx.insert("rows".to_string(), json!([10, 20, 30]));
        ctx
    }

    #[test]
    fn test_simple_field_access() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(
            resolver.resolve_expression("configs.text").unwrap(),
            json!("Hello world")
        );
    }

    #[test]
    fn test_array_index_access() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let result = resolver
            .resolve_expression("extract.entities[1].type")
            .unwrap();
        assert_eq!(result, json!("org"));
    }

    #[test]
    fn test_root_index_access() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(resolver.resolve_expression("rows[2]").unwrap(), json!(30));
    }

    #[test]
    fn test_whole_expression_preserves_type() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(resolver.resolve_string("{{configs.count}}"), json!(42));
        assert_eq!(
            resolver.resolve_string("{{configs.tags}}"),
            json!(["rust", "wasm"])
        );
    }

    #[test]
    fn test_mixed_text_and_templates() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let result = resolver.resolve_string(
            "{{extract.entities[0].name}} works at {{extract.entities[1].name}} ({{configs.count}})",
        );
        assert_eq!(result, json!("Alice works at Acme (42)"));
    }

    #[test]
    fn test_no_templates() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(
            resolver.resolve_string("no templates here"),
            json!("no templates here")
        );
    }

    #[test]
    fn test_missing_root_key_error() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let err = resolver
            .resolve_expression("nonexistent.field")
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference(_)));
        assert!(err.to_string().contains("unknown key 'nonexistent'"));
    }

    #[test]
    fn test_missing_nested_field_error() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let err = resolver.resolve_expression("extract.entities[99].name").unwrap_err();
        assert!(err.to_string().contains("cannot resolve segment"));
    }

    #[test]
    fn test_unresolved_whole_expression_is_null() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(resolver.resolve_string("{{ghost.value}}"), Value::Null);
    }

    #[test]
    fn test_unresolved_in_mixed_text_is_empty() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(
            resolver.resolve_string("a-{{ghost}}-b"),
            json!("a--b")
        );
    }

    #[test]
    fn test_resolved_null_in_mixed_text() {
        let mut ctx = HashMap::new();
        ctx.insert("data".to_string(), json!({"missing": null}));
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(
            resolver.resolve_string("Value: {{data.missing}}"),
            json!("Value: null")
        );
    }

    #[test]
    fn test_resolve_value_tree() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let params = json!({
            "prompt": "Summarize: {{configs.text}}",
            "count": "{{configs.count}}",
            "list": ["{{extract.summary}}", 1, true],
            "nested": {"inner": "{{extract.entities[0]}}"}
        });
        let result = resolver.resolve_value(&params);
        assert_eq!(result["prompt"], json!("Summarize: Hello world"));
        assert_eq!(result["count"], json!(42));
        assert_eq!(result["list"], json!(["A greeting", 1, true]));
        assert_eq!(
            result["nested"]["inner"],
            json!({"name": "Alice", "type": "person"})
        );
    }

    #[test]
    fn test_object_in_mixed_string_serialized() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        let result = resolver.resolve_string("Data: {{extract}}");
        let s = result.as_str().unwrap();
        assert!(s.starts_with("Data: {"));
        assert!(s.contains("\"summary\":\"A greeting\""));
    }

    #[test]
    fn test_whitespace_and_unclosed() {
        let ctx = test_context();
        let resolver = ContextResolver::new(&ctx);
        assert_eq!(resolver.resolve_string("{{ configs.text }}"), json!("Hello world"));
        assert_eq!(
            resolver.resolve_string("open {{ but no close"),
            json!("open {{ but no close")
        );
    }

    #[test]
    fn test_is_template() {
        assert!(is_template("{{a}}"));
        assert!(is_template("x {{a.b}} y"));
        assert!(!is_template("plain"));
        assert!(!is_template("{{ }}"));
    }
}
