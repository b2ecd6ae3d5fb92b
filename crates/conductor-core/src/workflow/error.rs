//! Step-level and run-level error types.
//!
//! `StepError` is caught by the engine and folded into a failed
//! `StepResult`; `EngineError` terminates the run.

use conductor_types::error::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

use super::checkpoint::StoreError;
use super::definition::WorkflowError;

/// Why a single dispatch of a step failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// The tool or agent reported a failure.
    #[error("step execution failed: {0}")]
    Execution(String),

    /// The dispatch did not finish within the step timeout.
    #[error("step timed out after {0} ms")]
    Timeout(u64),

    /// The agent's circuit breaker is open.
    #[error("circuit open for agent '{0}'")]
    CircuitOpen(String),

    /// Selecting an agent would exceed the configured budget.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The permission hook rejected the action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No tool registered under this name, or the tool rejected the op.
    #[error("unknown tool or operation: {0}")]
    UnknownTarget(String),

    /// No agent can serve the step.
    #[error("no agent available: {0}")]
    NoAgent(String),

    /// The run was cancelled while the step was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the retry policy applies to this failure.
    ///
    /// Only execution errors and timeouts are retried. An open circuit goes
    /// straight to failover.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Execution(_) | StepError::Timeout(_))
    }

    /// Whether failover to a different agent may help.
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            StepError::Execution(_) | StepError::Timeout(_) | StepError::CircuitOpen(_)
        )
    }
}

/// Faults that terminate a run instead of failing a single step.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} cannot be resumed from status '{status}'")]
    NotResumable { run_id: Uuid, status: String },

    #[error("run {run_id} belongs to workflow '{expected}', not '{actual}'")]
    WorkflowMismatch {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("run {0} is already active")]
    AlreadyRunning(Uuid),
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        EngineError::Repository(e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunNotFound(run_id) => EngineError::RunNotFound(run_id),
            other => EngineError::Repository(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(StepError::Execution("boom".into()).is_retryable());
        assert!(StepError::Timeout(100).is_retryable());
        assert!(!StepError::CircuitOpen("a".into()).is_retryable());
        assert!(!StepError::BudgetExceeded("run".into()).is_retryable());
        assert!(!StepError::PermissionDenied("deploy".into()).is_retryable());
        assert!(!StepError::UnknownTarget("x.y".into()).is_retryable());
    }

    #[test]
    fn test_failover_taxonomy() {
        assert!(StepError::CircuitOpen("a".into()).allows_failover());
        assert!(!StepError::PermissionDenied("x".into()).allows_failover());
        assert!(!StepError::Cancelled.allows_failover());
    }

    #[test]
    fn test_engine_error_from_repository() {
        let err: EngineError = RepositoryError::NotFound.into();
        assert_eq!(err.to_string(), "repository error: entity not found");
    }
}
