//! JEXL expression evaluator for step `condition` clauses.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of string/collection
//! transforms. Conditions are evaluated conservatively: an expression that
//! references a variable the run has not produced is false, as is any
//! expression that fails to evaluate.
//!
//! Inputs and outputs are always passed as context objects, never
//! interpolated into expression strings.

use serde_json::{json, Value};

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Identifiers that are part of the expression language, not references.
const KEYWORDS: &[&str] = &["true", "false", "null", "in"];

/// Namespace roots that always resolve.
const NAMESPACES: &[&str] = &["inputs", "variables", "steps"];

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms pre-registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match args.first() {
                    Some(Value::String(s)) => needle.as_str().is_some_and(|n| s.contains(n)),
                    Some(Value::Array(items)) => items.contains(&needle),
                    Some(Value::Object(map)) => {
                        needle.as_str().is_some_and(|k| map.contains_key(k))
                    }
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    /// Decide whether a step's condition holds for this run.
    ///
    /// False when any referenced variable is unresolved or evaluation fails.
    pub fn condition_holds(&self, expression: &str, ctx: &ExecutionContext) -> bool {
        let missing = unresolved_references(expression, ctx);
        if !missing.is_empty() {
            tracing::debug!(
                run_id = %ctx.run_id,
                expression,
                missing = ?missing,
                "condition references unresolved variables, treating as false"
            );
            return false;
        }

        match self.evaluate_bool(expression, &ctx.to_expression_context()) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    expression,
                    error = %e,
                    "condition failed to evaluate, treating as false"
                );
                false
            }
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Reference scanning
// ---------------------------------------------------------------------------

/// Dotted identifier paths referenced by `expression`.
///
/// Skips string literals, numbers, keywords and transform names.
pub fn referenced_paths(expression: &str) -> Vec<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut paths = Vec::new();
    let mut i = 0;
    // Last significant (non-whitespace) character outside literals.
    let mut prev: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            prev = Some(c);
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            prev = Some('0');
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
            {
                i += 1;
            }
            let path: String = chars[start..i].iter().collect();
            let path = path.trim_end_matches('.').to_string();
            // Transform names follow '|'; members of a bracketed access follow '.'.
            let is_member = matches!(prev, Some('|') | Some('.'));
            if !is_member && !KEYWORDS.contains(&path.as_str()) {
                paths.push(path);
            }
            prev = Some('a');
        } else {
            if !c.is_whitespace() {
                prev = Some(c);
            }
            i += 1;
        }
    }

    paths
}

/// Referenced paths that do not resolve in `ctx`.
pub fn unresolved_references(expression: &str, ctx: &ExecutionContext) -> Vec<String> {
    referenced_paths(expression)
        .into_iter()
        .filter(|path| !NAMESPACES.contains(&path.as_str()) && ctx.lookup(path).is_none())
        .collect()
}

/// JavaScript-like truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    fn run_context() -> ExecutionContext {
        let inputs = json!({ "env": "prod", "notify": true })
            .as_object()
            .cloned()
            .unwrap();
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), "deploy", inputs);
        ctx.record_output(
            "review",
            Some("review"),
            json!({ "approved": true, "comments": ["lgtm", "ship it"] }),
        );
        ctx
    }

    // -------------------------------------------------------------------
    // Raw evaluation
    // -------------------------------------------------------------------

    #[test]
    fn test_dot_notation_bool() {
        let ctx = json!({ "event": { "user": { "name": "Alice" } } });
        assert!(evaluator()
            .evaluate_bool("event.user.name == 'Alice'", &ctx)
            .unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let ctx = json!({ "a": true, "b": false });
        let eval = evaluator();
        assert!(!eval.evaluate_bool("a && b", &ctx).unwrap());
        assert!(eval.evaluate_bool("a || b", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({ "name": "  Hello World  ", "items": ["a", "b", "c", "d"] });
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("name|trim|lower", &ctx).unwrap(),
            json!("hello world")
        );
        assert!(eval.evaluate_bool("items|length > 3", &ctx).unwrap());
        assert!(eval.evaluate_bool("items|contains('b')", &ctx).unwrap());
        assert!(eval.evaluate_bool("name|trim|startsWith('Hello')", &ctx).unwrap());
    }

    #[test]
    fn test_in_operator_array() {
        let ctx = json!({ "roles": ["admin", "user"] });
        assert!(evaluator().evaluate_bool("'admin' in roles", &ctx).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        let err = evaluator().evaluate_bool("true", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    // -------------------------------------------------------------------
    // Reference scanning
    // -------------------------------------------------------------------

    #[test]
    fn test_referenced_paths_skips_literals_and_transforms() {
        let paths = referenced_paths("review.approved == true && env|lower == 'prod.eu' && 2.5 > count");
        assert_eq!(paths, vec!["review.approved", "env", "count"]);
    }

    #[test]
    fn test_unresolved_references() {
        let ctx = run_context();
        assert!(unresolved_references("review.approved", &ctx).is_empty());
        assert!(unresolved_references("steps['review'].output.approved", &ctx).is_empty());
        assert_eq!(
            unresolved_references("deploy.status == 'ok'", &ctx),
            vec!["deploy.status"]
        );
    }

    // -------------------------------------------------------------------
    // Step conditions
    // -------------------------------------------------------------------

    #[test]
    fn test_condition_true_and_false() {
        let ctx = run_context();
        let eval = evaluator();
        assert!(eval.condition_holds("review.approved == true", &ctx));
        assert!(eval.condition_holds("inputs.env == 'prod' && notify", &ctx));
        assert!(!eval.condition_holds("env == 'staging'", &ctx));
        assert!(eval.condition_holds("review.comments|length == 2", &ctx));
    }

    #[test]
    fn test_unresolved_variable_is_false() {
        let ctx = run_context();
        let eval = evaluator();
        assert!(!eval.condition_holds("missing == null", &ctx));
        assert!(!eval.condition_holds("!missing", &ctx));
    }

    #[test]
    fn test_eval_error_is_false() {
        let ctx = run_context();
        assert!(!evaluator().condition_holds("review.approved ==", &ctx));
    }
}
