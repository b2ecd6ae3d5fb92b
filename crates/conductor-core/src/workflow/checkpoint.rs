//! Durable state store for run records and step checkpoints.
//!
//! Wraps `ExecutionRepository` with the rules the engine relies on:
//! checkpoints are append-only with strictly increasing `step_index`, and
//! the resume point of a run is the first step without a completed
//! checkpoint.

use chrono::{Duration, Utc};
use conductor_types::execution::{
    ExecutionRecord, ExecutionStats, ExecutionStatus, StepCheckpoint, StepStatus,
};
use uuid::Uuid;

use crate::repository::execution::ExecutionRepository;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Crash-safe persistence for workflow runs.
///
/// Generic over `R: ExecutionRepository` so it works with any storage backend
/// (SQLite, in-memory). Callers serialize writes per run_id; the engine does
/// so by running each run's steps sequentially.
pub struct StateStore<R: ExecutionRepository> {
    repo: R,
}

impl<R: ExecutionRepository> StateStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Execution records
    // -----------------------------------------------------------------------

    /// Persist a new run. Fails with `Conflict` if the run_id exists.
    pub async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.repo.create_execution(record).await.map_err(StoreError::from_repo)?;
        tracing::debug!(
            run_id = %record.run_id,
            workflow_id = %record.workflow_id,
            "created execution record"
        );
        Ok(())
    }

    /// Full-record upsert. Bumps `updated_at`.
    pub async fn update_execution(&self, record: &mut ExecutionRecord) -> Result<(), StoreError> {
        record.updated_at = Utc::now();
        self.repo.update_execution(record).await.map_err(StoreError::from_repo)?;
        tracing::debug!(
            run_id = %record.run_id,
            status = %record.status,
            current_step = record.current_step,
            "updated execution record"
        );
        Ok(())
    }

    pub async fn get_execution(&self, run_id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        self.repo.get_execution(&run_id).await.map_err(StoreError::from_repo)
    }

    /// Like `get_execution` but a missing run is an error.
    pub async fn require_execution(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.get_execution(run_id)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))
    }

    /// Newest first.
    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.repo
            .list_executions(status, limit)
            .await
            .map_err(StoreError::from_repo)
    }

    /// Runs left in `Running` by a crashed process.
    pub async fn list_crashed_executions(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.repo
            .list_crashed_executions()
            .await
            .map_err(StoreError::from_repo)
    }

    pub async fn delete_execution(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let deleted = self
            .repo
            .delete_execution(&run_id)
            .await
            .map_err(StoreError::from_repo)?;
        tracing::debug!(run_id = %run_id, deleted, "deleted execution record");
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Step checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint.
    ///
    /// Rejects an index that is not greater than the last one written for
    /// the run.
    pub async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), StoreError> {
        if let Some(last) = self.get_last_checkpoint(checkpoint.run_id).await? {
            if checkpoint.step_index <= last.step_index {
                return Err(StoreError::Conflict(format!(
                    "checkpoint index {} for run {} is not after last index {}",
                    checkpoint.step_index, checkpoint.run_id, last.step_index
                )));
            }
        }

        self.repo
            .save_checkpoint(checkpoint)
            .await
            .map_err(StoreError::from_repo)?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            step_id = %checkpoint.step_id,
            step_index = checkpoint.step_index,
            status = checkpoint.status.as_str(),
            "checkpointed step"
        );
        Ok(())
    }

    /// Checkpoints ordered by step_index.
    pub async fn get_checkpoints(&self, run_id: Uuid) -> Result<Vec<StepCheckpoint>, StoreError> {
        self.repo
            .get_checkpoints(&run_id)
            .await
            .map_err(StoreError::from_repo)
    }

    pub async fn get_last_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<StepCheckpoint>, StoreError> {
        self.repo
            .get_last_checkpoint(&run_id)
            .await
            .map_err(StoreError::from_repo)
    }

    /// Smallest step_index without a completed checkpoint (first gap).
    pub async fn get_resume_point(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let checkpoints = self.get_checkpoints(run_id).await?;
        Ok(resume_point(&checkpoints))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete completed/failed runs finished more than `days` ago.
    pub async fn cleanup_old_records(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let deleted = self
            .repo
            .cleanup_before(cutoff)
            .await
            .map_err(StoreError::from_repo)?;
        tracing::info!(days, deleted, "cleaned up old execution records");
        Ok(deleted)
    }

    pub async fn get_stats(&self, workflow_id: Option<&str>) -> Result<ExecutionStats, StoreError> {
        self.repo
            .get_stats(workflow_id)
            .await
            .map_err(StoreError::from_repo)
    }
}

/// First index, counting from 0, that has no completed checkpoint.
pub fn resume_point(checkpoints: &[StepCheckpoint]) -> usize {
    let mut expected = 0;
    for cp in checkpoints {
        if cp.step_index != expected || cp.status != StepStatus::Completed {
            break;
        }
        expected += 1;
    }
    expected
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying repository operation failed.
    #[error("state store repository error: {0}")]
    Repository(String),

    /// Uniqueness or ordering rule violated.
    #[error("state store conflict: {0}")]
    Conflict(String),

    #[error("execution not found: {0}")]
    RunNotFound(Uuid),
}

impl StoreError {
    fn from_repo(e: conductor_types::error::RepositoryError) -> Self {
        match e {
            conductor_types::error::RepositoryError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::Repository(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryExecutionRepository;
    use serde_json::json;

    fn store() -> StateStore<InMemoryExecutionRepository> {
        StateStore::new(InMemoryExecutionRepository::new())
    }

    fn record(status: ExecutionStatus) -> ExecutionRecord {
        let mut r = ExecutionRecord::new(Uuid::now_v7(), "wf", "wf", "manual", json!({"a": 1}));
        r.status = status;
        r
    }

    fn checkpoint(run_id: Uuid, step_index: usize, status: StepStatus) -> StepCheckpoint {
        StepCheckpoint {
            run_id,
            step_index,
            step_id: format!("s{step_index}"),
            status,
            agent: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            output: Some(json!({"i": step_index})),
            error: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_resume_point_is_first_gap() {
        let store = store();
        let r = record(ExecutionStatus::Running);
        store.create_execution(&r).await.unwrap();
        store.save_checkpoint(&checkpoint(r.run_id, 0, StepStatus::Completed)).await.unwrap();
        store.save_checkpoint(&checkpoint(r.run_id, 1, StepStatus::Completed)).await.unwrap();
        store.save_checkpoint(&checkpoint(r.run_id, 2, StepStatus::Failed)).await.unwrap();

        assert_eq!(store.get_resume_point(r.run_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resume_point_without_checkpoints_is_zero() {
        let store = store();
        let r = record(ExecutionStatus::Running);
        store.create_execution(&r).await.unwrap();
        assert_eq!(store.get_resume_point(r.run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_checkpoint_rejects_non_increasing_index() {
        let store = store();
        let r = record(ExecutionStatus::Running);
        store.create_execution(&r).await.unwrap();
        store.save_checkpoint(&checkpoint(r.run_id, 3, StepStatus::Completed)).await.unwrap();

        let err = store
            .save_checkpoint(&checkpoint(r.run_id, 2, StepStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store
            .save_checkpoint(&checkpoint(r.run_id, 3, StepStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_run_is_conflict() {
        let store = store();
        let r = record(ExecutionStatus::Pending);
        store.create_execution(&r).await.unwrap();
        assert!(matches!(
            store.create_execution(&r).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at() {
        let store = store();
        let mut r = record(ExecutionStatus::Pending);
        store.create_execution(&r).await.unwrap();
        let before = r.updated_at;
        r.status = ExecutionStatus::Running;
        store.update_execution(&mut r).await.unwrap();
        let loaded = store.require_execution(r.run_id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(loaded.updated_at >= before);
        assert_eq!(loaded.inputs, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_stats_success_rate() {
        let store = store();
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Running,
        ] {
            store.create_execution(&record(status)).await.unwrap();
        }
        let stats = store.get_stats(None).await.unwrap();
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.running, 1);
    }

    #[tokio::test]
    async fn test_require_missing_run() {
        let err = store().require_execution(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[test]
    fn test_resume_point_skipped_step_is_a_gap() {
        let run_id = Uuid::nil();
        let cps = vec![
            checkpoint(run_id, 0, StepStatus::Completed),
            checkpoint(run_id, 1, StepStatus::Skipped),
            checkpoint(run_id, 2, StepStatus::Completed),
        ];
        assert_eq!(resume_point(&cps), 1);
    }
}
