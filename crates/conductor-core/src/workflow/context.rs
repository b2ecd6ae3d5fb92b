//! Per-run execution context with variable tracking and template resolution.
//!
//! `ExecutionContext` is the mutable state owned by exactly one in-flight
//! run: the resolved inputs, the output variables written by completed
//! steps, and the index of the step being executed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state that flows through a single workflow run.
///
/// Template placeholders (`{{ name }}`, `{{ inputs.x }}`, `{{ variables.x.y }}`,
/// `{{ steps.<id>.output }}`) resolve against this state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Resolved run inputs.
    pub inputs: Map<String, Value>,
    /// Output variables, keyed by each step's `output` name.
    pub variables: Map<String, Value>,
    /// Raw outputs keyed by step ID.
    pub step_outputs: Map<String, Value>,
    pub current_step_index: usize,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, workflow_id: impl Into<String>, inputs: Map<String, Value>) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            inputs,
            variables: Map::new(),
            step_outputs: Map::new(),
            current_step_index: 0,
        }
    }

    /// Record the output of a completed step.
    ///
    /// Stored under the step ID and, when given, under the output variable
    /// name. Outputs over `MAX_STEP_OUTPUT_SIZE` are replaced by a marker.
    pub fn record_output(&mut self, step_id: &str, variable: Option<&str>, output: Value) {
        let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        let output = if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                run_id = %self.run_id,
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
            })
        } else {
            output
        };

        if let Some(name) = variable {
            self.variables.insert(name.to_string(), output.clone());
        }
        self.step_outputs.insert(step_id.to_string(), output);
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Look up a dotted path.
    ///
    /// `inputs.`, `variables.` and `steps.` select a namespace explicitly.
    /// A bare path is looked up in variables first, then inputs.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        let mut segments = path.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        match head {
            "inputs" if !rest.is_empty() => walk_map(&self.inputs, &rest),
            "variables" if !rest.is_empty() => walk_map(&self.variables, &rest),
            "steps" if !rest.is_empty() => {
                let output = self.step_outputs.get(rest[0])?;
                match rest.get(1) {
                    Some(&"output") => walk(output, &rest[2..]),
                    None => Some(output),
                    Some(_) => None,
                }
            }
            _ => {
                let mut all = vec![head];
                all.extend(rest);
                walk_map(&self.variables, &all).or_else(|| walk_map(&self.inputs, &all))
            }
        }
    }

    /// Resolve every `{{ path }}` placeholder in `template`.
    ///
    /// Unresolved placeholders are left as-is.
    pub fn resolve_string(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let expr = &after[..end];
                    match self.lookup(expr) {
                        Some(value) => out.push_str(&value_to_string(value)),
                        None => {
                            out.push_str("{{");
                            out.push_str(expr);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Resolve placeholders inside any JSON value, recursing into arrays
    /// and objects.
    ///
    /// A string consisting of exactly one placeholder is replaced by the
    /// referenced value itself, keeping its JSON type.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(path) = single_placeholder(s) {
                    if let Some(found) = self.lookup(path) {
                        return found.clone();
                    }
                }
                Value::String(self.resolve_string(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(self.resolve_map(map)),
            other => other.clone(),
        }
    }

    /// Resolve a step's `inputs` map.
    pub fn resolve_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    /// Serialize the context for checkpointing.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from a JSON snapshot.
    pub fn from_json(value: Value) -> Result<Self, WorkflowError> {
        serde_json::from_value(value)
            .map_err(|e| WorkflowError::ParseError(format!("failed to restore context: {e}")))
    }

    /// Build the object conditions are evaluated against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "inputs": { ... },
    ///   "variables": { ... },
    ///   "steps": { "<step_id>": { "output": <value> } },
    ///   "<input or variable name>": <value>
    /// }
    /// ```
    /// Variables shadow inputs of the same name at the top level.
    pub fn to_expression_context(&self) -> Value {
        let mut root = Map::new();
        for (k, v) in &self.inputs {
            root.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.variables {
            root.insert(k.clone(), v.clone());
        }

        let mut steps = Map::new();
        for (id, output) in &self.step_outputs {
            steps.insert(id.clone(), json!({ "output": output }));
        }

        root.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        root.insert("variables".to_string(), Value::Object(self.variables.clone()));
        root.insert("steps".to_string(), Value::Object(steps));
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn walk_map<'a>(map: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    walk(map.get(*first)?, rest)
}

fn walk<'a>(mut value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// `Some(path)` when `s` is exactly `{{ path }}` (surrounding whitespace allowed).
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Convert a JSON value to a display string for template resolution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
