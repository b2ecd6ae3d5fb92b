//! Run-time execution types for Conductor.
//!
//! `ExecutionRecord` is the persistent descriptor of one run and
//! `StepCheckpoint` the append-only record of each step's terminal outcome.
//! `WorkflowResult` is what callers of the engine get back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::FailoverEvent;
use crate::rollback::RollbackReport;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again without an explicit resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `resume` may pick this run back up.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an individual step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Failed,
    Completed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Failed => "failed",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Persistent records
// ---------------------------------------------------------------------------

/// Persistent run descriptor. One per `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Index of the step currently executing (or the next one to run).
    pub current_step: usize,
    /// What started the run ("manual", "cron", ...).
    pub trigger: String,
    pub inputs: Value,
    /// Output variables produced so far, keyed by variable name.
    pub outputs: Value,
    pub error: Option<String>,
    /// Run this one was resumed from, when it was forked on resume.
    pub resumed_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// A fresh pending record.
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        trigger: impl Into<String>,
        inputs: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            trigger: trigger.into(),
            inputs,
            outputs: Value::Object(Default::default()),
            error: None,
            resumed_from: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Append-only record of a step's terminal outcome, keyed by `(run_id, step_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub run_id: Uuid,
    pub step_index: usize,
    pub step_id: String,
    pub status: StepStatus,
    /// Agent that ran the step, for agent tasks.
    pub agent: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What an agent adapter returns for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Cost charged for the call, counted against the budget.
    #[serde(default)]
    pub cost: f64,
}

impl AgentStepResult {
    pub fn completed(output: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            error: None,
            cost: 0.0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Outcome of one step within a `WorkflowResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_index: usize,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub agent: Option<String>,
    pub duration_ms: u64,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub step_results: Vec<StepResult>,
    /// Output variables at the end of the run.
    pub outputs: Value,
    /// Present when a rollback ran.
    pub rollback: Option<RollbackReport>,
    #[serde(default)]
    pub failovers: Vec<FailoverEvent>,
}

impl WorkflowResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}

/// Per-run options passed to `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Caller-chosen run id. A v7 UUID is generated when absent.
    pub run_id: Option<Uuid>,
    pub trigger: String,
    /// User checked against the permission hook, if any.
    pub user: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            trigger: "manual".to_string(),
            user: None,
        }
    }
}

impl ExecutionOptions {
    pub fn with_trigger(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            ..Self::default()
        }
    }
}

/// Aggregate run counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub paused: u64,
    /// `completed / (completed + failed) * 100`, 0 when nothing finished.
    pub success_rate: f64,
}

impl ExecutionStats {
    /// Build stats from per-status counts.
    pub fn from_counts(counts: impl IntoIterator<Item = (ExecutionStatus, u64)>) -> Self {
        let mut stats = Self::default();
        for (status, n) in counts {
            stats.total += n;
            match status {
                ExecutionStatus::Pending => stats.pending += n,
                ExecutionStatus::Running => stats.running += n,
                ExecutionStatus::Completed => stats.completed += n,
                ExecutionStatus::Failed => stats.failed += n,
                ExecutionStatus::Cancelled => stats.cancelled += n,
                ExecutionStatus::Paused => stats.paused += n,
            }
        }
        let finished = stats.completed + stats.failed;
        stats.success_rate = if finished == 0 {
            0.0
        } else {
            stats.completed as f64 / finished as f64 * 100.0
        };
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(ExecutionStatus::Cancelled).unwrap();
        assert_eq!(json, "cancelled");
        let back: StepStatus = serde_json::from_value(serde_json::json!("retrying")).unwrap();
        assert_eq!(back, StepStatus::Retrying);
    }

    #[test]
    fn terminal_and_resumable() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Paused.is_resumable());
        assert!(ExecutionStatus::Failed.is_resumable());
        assert!(!ExecutionStatus::Completed.is_resumable());
    }

    #[test]
    fn success_rate_ignores_unfinished_runs() {
        let stats = ExecutionStats::from_counts([
            (ExecutionStatus::Completed, 3),
            (ExecutionStatus::Failed, 1),
            (ExecutionStatus::Running, 1),
        ]);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.success_rate, 75.0);
    }

    #[test]
    fn success_rate_zero_without_finished_runs() {
        let stats = ExecutionStats::from_counts([(ExecutionStatus::Running, 2)]);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn new_record_is_pending() {
        let record = ExecutionRecord::new(
            Uuid::now_v7(),
            "deploy",
            "Deploy",
            "manual",
            serde_json::json!({"env": "prod"}),
        );
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.current_step, 0);
        assert!(record.outputs.as_object().unwrap().is_empty());
    }
}
