//! Workflow definition parsing, validation, and input resolution.
//!
//! The engine consumes already-parsed `Workflow` values through the
//! `WorkflowParser` contract. `YamlWorkflowParser` is the built-in
//! implementation used by the scheduler to load `workflow_path` files.

use std::collections::HashSet;
use std::path::Path;

use conductor_types::workflow::Workflow;
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised before a run starts.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A required input was not provided and has no default.
    #[error("missing required input '{0}'")]
    MissingInput(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parser contract
// ---------------------------------------------------------------------------

/// Turns workflow text into a validated `Workflow`.
pub trait WorkflowParser: Send + Sync {
    /// Parse and validate. Fails on malformed definitions.
    fn parse(&self, text: &str) -> Result<Workflow, WorkflowError>;
}

/// Read a workflow file without blocking the runtime, then parse it.
pub async fn load_workflow(
    parser: &dyn WorkflowParser,
    path: &Path,
) -> Result<Workflow, WorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    parser.parse(&content)
}

/// Serde-driven YAML parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlWorkflowParser;

impl WorkflowParser for YamlWorkflowParser {
    fn parse(&self, text: &str) -> Result<Workflow, WorkflowError> {
        parse_workflow_yaml(text)
    }
}

/// Parse a YAML string into a validated `Workflow`.
///
/// Fills `id` from `name` when omitted and runs `validate_workflow`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    let mut workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    if workflow.id.is_empty() {
        workflow.id = workflow.name.clone();
    }
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Serialize a `Workflow` to a YAML string.
pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `Workflow`.
///
/// Checks:
/// - Name is non-empty
/// - At least one step exists
/// - All step IDs are non-empty and unique
/// - Output variable names are non-empty
/// - Input names are unique
/// - Timeouts are > 0 when set
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if workflow.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if let Some(output) = &step.output {
            if output.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has an empty output variable name",
                    step.id
                )));
            }
        }
        if step.timeout_ms == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    let mut seen_inputs = HashSet::new();
    for input in &workflow.inputs {
        if !seen_inputs.insert(input.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate input: '{}'",
                input.name
            )));
        }
    }

    if workflow.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Merge provided run inputs with declared defaults.
///
/// Undeclared inputs pass through unchanged. A required input that is
/// neither provided nor defaulted fails with `MissingInput`.
pub fn resolve_inputs(
    workflow: &Workflow,
    provided: &Value,
) -> Result<Map<String, Value>, WorkflowError> {
    let mut inputs = match provided {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(WorkflowError::ValidationError(format!(
                "run inputs must be an object, got {other}"
            )));
        }
    };

    for spec in &workflow.inputs {
        if inputs.contains_key(&spec.name) {
            continue;
        }
        match &spec.default {
            Some(default) => {
                inputs.insert(spec.name.clone(), default.clone());
            }
            None if spec.required => {
                return Err(WorkflowError::MissingInput(spec.name.clone()));
            }
            None => {}
        }
    }

    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
