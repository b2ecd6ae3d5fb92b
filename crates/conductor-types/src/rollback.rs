//! Compensation (rollback) types for Conductor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A reversible action registered by a successful step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub run_id: Uuid,
    pub step_id: String,
    pub step_index: usize,
    /// Resource kind, selects the compensation handler.
    pub resource: String,
    pub compensating_op: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
}

/// Overall outcome of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    /// Every compensation ran (or there was nothing to compensate).
    Succeeded,
    /// At least one compensation failed. Full reversal is not guaranteed.
    Partial,
}

/// A compensation that raised an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step_id: String,
    pub error: String,
}

/// Result of `rollback(run_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub run_id: Uuid,
    pub status: RollbackStatus,
    /// Step ids whose compensation succeeded, in execution order.
    pub compensated: Vec<String>,
    pub failures: Vec<CompensationFailure>,
}

impl RollbackReport {
    /// A report for a run with nothing to undo.
    pub fn empty(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: RollbackStatus::Succeeded,
            compensated: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.status == RollbackStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_format() {
        assert_eq!(
            serde_json::to_value(RollbackStatus::Partial).unwrap(),
            "PARTIAL"
        );
    }

    #[test]
    fn empty_report_succeeds() {
        let report = RollbackReport::empty(Uuid::now_v7());
        assert_eq!(report.status, RollbackStatus::Succeeded);
        assert!(!report.is_partial());
        assert!(report.compensated.is_empty());
    }
}
