//! Workflow definition types for Conductor.
//!
//! A `Workflow` is the static, parser-owned description of a multi-step run:
//! its declared inputs, triggers, and the ordered list of `WorkflowStep`s.
//! The engine treats it as read-only. Step actions are parsed once into the
//! `StepAction` tagged union so dispatch never re-inspects action strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A declarative workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable workflow identifier. Defaults to `name` when omitted.
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared run inputs.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Trigger configurations.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Ordered list of steps. Executed sequentially.
    pub steps: Vec<WorkflowStep>,
    /// Workflow-wide error handling, used by steps that do not override it.
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Whole-run timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    /// Effective error handling for the step at `index`.
    pub fn error_handling_for(&self, step: &WorkflowStep) -> ErrorHandling {
        step.error_handling.unwrap_or(self.error_handling)
    }
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a workflow can be triggered.
///
/// Webhook and file-watch triggers live outside the runtime and call the
/// engine directly; only manual and cron triggers are declared here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Manually triggered.
    Manual {},
    /// Cron schedule trigger.
    Cron {
        /// 5-field cron expression or a supported alias ("@daily", "every 5 minutes").
        schedule: String,
        /// Optional timezone ("UTC", "local", or a fixed offset like "+05:30").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within the workflow.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// What to dispatch: `tool.op` or `agent.op`.
    pub action: StepAction,
    /// Templated inputs. Strings may contain `{{ variable }}` placeholders.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    /// Variable name that receives the step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Boolean expression; the step is skipped when it evaluates to false.
    #[serde(default, alias = "conditions", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step-level override of the workflow error handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    /// Retry policy. No retries when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Cross-agent failover policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverConfig>,
    /// Agent selection hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentHints>,
    /// Per-dispatch timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Compensation registered when this step succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
}

impl WorkflowStep {
    /// Display name, falling back to the step ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Parsed step action.
///
/// Serialized as the original `tool.op` / `agent.op` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepAction {
    /// Call operation `op` on tool `tool`.
    ToolCall { tool: String, op: String },
    /// Ask an agent (selected by the router) to perform `op`.
    AgentTask { op: String },
}

/// Prefix that marks an action as an agent task.
pub const AGENT_ACTION_PREFIX: &str = "agent";

impl StepAction {
    /// Operation name for either variant.
    pub fn op(&self) -> &str {
        match self {
            StepAction::ToolCall { op, .. } | StepAction::AgentTask { op } => op,
        }
    }

    pub fn is_agent_task(&self) -> bool {
        matches!(self, StepAction::AgentTask { .. })
    }
}

/// Error returned when an action string is not `<target>.<op>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid action '{0}': expected '<tool>.<op>' or 'agent.<op>'")]
pub struct ActionParseError(pub String);

impl FromStr for StepAction {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (target, op) = trimmed
            .split_once('.')
            .ok_or_else(|| ActionParseError(s.to_string()))?;

        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        };
        if !valid(target) || !valid(op) || target.contains('.') {
            return Err(ActionParseError(s.to_string()));
        }

        if target == AGENT_ACTION_PREFIX {
            Ok(StepAction::AgentTask { op: op.to_string() })
        } else {
            Ok(StepAction::ToolCall {
                tool: target.to_string(),
                op: op.to_string(),
            })
        }
    }
}

impl TryFrom<String> for StepAction {
    type Error = ActionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StepAction> for String {
    fn from(action: StepAction) -> Self {
        action.to_string()
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::ToolCall { tool, op } => write!(f, "{tool}.{op}"),
            StepAction::AgentTask { op } => write!(f, "{AGENT_ACTION_PREFIX}.{op}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What to do when a step ends in `Failed` after retries and failover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Mark the step failed and proceed with the next one.
    #[serde(alias = "CONTINUE")]
    Continue,
    /// Abort remaining steps.
    #[default]
    #[serde(alias = "STOP")]
    Stop,
    /// Abort remaining steps and compensate completed ones.
    #[serde(alias = "ROLLBACK")]
    Rollback,
}

/// Retry policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied to the delay for each subsequent retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Failover policy for a step whose agent failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of replacement agents to try.
    #[serde(default = "default_max_failovers")]
    pub max_failovers: u32,
    /// Explicit replacement order. When empty the router picks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_agents: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_failovers() -> u32 {
    1
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failovers: default_max_failovers(),
            fallback_agents: Vec::new(),
        }
    }
}

/// Agent selection hints attached to a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentHints {
    /// Agent to use when it is capable and within budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,
    /// Capabilities the agent must advertise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Compensation a step registers on success.
///
/// `params` string values are templated against the run variables, which
/// include the step's own output once it completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensationSpec {
    /// Resource kind, used to pick the compensation handler ("file", "git", ...).
    pub resource: String,
    /// Compensating operation ("delete", "restore", "revert", ...).
    pub op: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tool_action() {
        let action: StepAction = "jira.create_issue".parse().unwrap();
        assert_eq!(
            action,
            StepAction::ToolCall {
                tool: "jira".to_string(),
                op: "create_issue".to_string()
            }
        );
        assert_eq!(action.to_string(), "jira.create_issue");
    }

    #[test]
    fn parse_agent_action() {
        let action: StepAction = "agent.code_review".parse().unwrap();
        assert_eq!(
            action,
            StepAction::AgentTask {
                op: "code_review".to_string()
            }
        );
        assert!(action.is_agent_task());
        assert_eq!(action.op(), "code_review");
    }

    #[test]
    fn parse_invalid_actions() {
        assert!("noop".parse::<StepAction>().is_err());
        assert!(".op".parse::<StepAction>().is_err());
        assert!("tool.".parse::<StepAction>().is_err());
        assert!("my tool.run".parse::<StepAction>().is_err());
    }

    #[test]
    fn step_deserializes_from_yaml() {
        let yaml = r#"
id: open-ticket
action: jira.create_issue
inputs:
  title: "Deploy {{ service }}"
output: ticket
conditions: "inputs.notify == true"
error_handling: ROLLBACK
retry:
  max_retries: 2
"#;
        let step: WorkflowStep = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.id, "open-ticket");
        assert_eq!(step.output.as_deref(), Some("ticket"));
        assert_eq!(step.condition.as_deref(), Some("inputs.notify == true"));
        assert_eq!(step.error_handling, Some(ErrorHandling::Rollback));
        let retry = step.retry.unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.delay_ms, 1_000);
    }

    #[test]
    fn step_with_bad_action_fails_to_deserialize() {
        let yaml = "id: x\naction: nodot\n";
        let result: Result<WorkflowStep, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn workflow_defaults() {
        let yaml = r#"
name: nightly-report
steps:
  - id: gather
    action: agent.summarize
"#;
        let wf: Workflow = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.version, "1.0.0");
        assert_eq!(wf.error_handling, ErrorHandling::Stop);
        assert!(wf.triggers.is_empty());
        assert_eq!(wf.error_handling_for(&wf.steps[0]), ErrorHandling::Stop);
    }

    #[test]
    fn cron_trigger_round_trips() {
        let trigger = TriggerConfig::Cron {
            schedule: "*/5 * * * *".to_string(),
            timezone: Some("+02:00".to_string()),
        };
        let json = serde_json::to_string(&trigger).unwrap();
        assert!(json.contains("\"type\":\"cron\""));
        let back: TriggerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trigger);
    }
}
