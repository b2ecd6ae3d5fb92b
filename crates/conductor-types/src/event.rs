//! Event types for the Conductor engine event bus.
//!
//! `EngineEvent` is broadcast at run and step lifecycle boundaries.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rollback::RollbackStatus;

/// Events emitted while executing workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // -- Run lifecycle --
    /// A run has started.
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
        trigger: String,
    },

    /// Every non-skipped step completed.
    RunCompleted {
        run_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// The run ended in `Failed`.
    RunFailed {
        run_id: Uuid,
        workflow_id: String,
        error: String,
    },

    /// The run was cancelled externally.
    RunCancelled { run_id: Uuid, workflow_id: String },

    // -- Step lifecycle --
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_index: usize,
        agent: Option<String>,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
        retry_count: u32,
    },

    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },

    /// A step's condition evaluated false.
    StepSkipped { run_id: Uuid, step_id: String },

    /// A failed attempt will be retried after `delay_ms`.
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    // -- Recovery --
    /// A step moved to a replacement agent.
    Failover {
        run_id: Uuid,
        step_id: String,
        from_agent: String,
        to_agent: String,
        reason: String,
    },

    /// Compensation for a run finished.
    RollbackCompleted {
        run_id: Uuid,
        status: RollbackStatus,
        compensated: usize,
        failed: usize,
    },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::RunCancelled { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::StepRetrying { run_id, .. }
            | EngineEvent::Failover { run_id, .. }
            | EngineEvent::RollbackCompleted { run_id, .. } => *run_id,
        }
    }

    /// Whether the audit hook should record this event.
    ///
    /// Audited: run start/stop, step failure, failover and rollback.
    pub fn is_audited(&self) -> bool {
        !matches!(
            self,
            EngineEvent::StepStarted { .. }
                | EngineEvent::StepCompleted { .. }
                | EngineEvent::StepSkipped { .. }
                | EngineEvent::StepRetrying { .. }
        )
    }
}
