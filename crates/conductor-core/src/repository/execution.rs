//! Execution repository trait definition.
//!
//! Defines the storage interface for run records and step checkpoints.
//! The infrastructure layer (conductor-infra) implements this trait with
//! SQLite persistence; `InMemoryExecutionRepository` is the ephemeral one.

use chrono::{DateTime, Utc};
use conductor_types::error::RepositoryError;
use conductor_types::execution::{ExecutionRecord, ExecutionStats, ExecutionStatus, StepCheckpoint};
use uuid::Uuid;

/// Repository trait for run persistence.
///
/// Covers two entity families:
/// - **Executions:** one `ExecutionRecord` per `run_id`.
/// - **Checkpoints:** append-only `StepCheckpoint`s keyed by `(run_id, step_index)`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new record. Fails with `Conflict` if the run_id exists.
    fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full-record upsert, last writer wins.
    fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// Newest first, optionally filtered by status.
    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Runs left in `Running` status (crash recovery).
    fn list_crashed_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Delete one run and its checkpoints. Returns `true` if it existed.
    fn delete_execution(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Insert a checkpoint. Fails with `Conflict` if `(run_id, step_index)` exists.
    fn save_checkpoint(
        &self,
        checkpoint: &StepCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All checkpoints of a run, ordered by step_index.
    fn get_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepCheckpoint>, RepositoryError>> + Send;

    /// Checkpoint with the highest step_index.
    fn get_last_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepCheckpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete completed/failed runs whose completed_at is before `cutoff`,
    /// with their checkpoints. Returns the number of runs deleted.
    fn cleanup_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Counts by status, optionally for one workflow.
    fn get_stats(
        &self,
        workflow_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ExecutionStats, RepositoryError>> + Send;
}
