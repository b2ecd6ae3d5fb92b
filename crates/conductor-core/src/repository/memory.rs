//! In-memory `ExecutionRepository` for tests and ephemeral deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_types::error::RepositoryError;
use conductor_types::execution::{ExecutionRecord, ExecutionStats, ExecutionStatus, StepCheckpoint};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::execution::ExecutionRepository;

#[derive(Debug, Default)]
struct Inner {
    executions: HashMap<Uuid, ExecutionRecord>,
    checkpoints: HashMap<Uuid, BTreeMap<usize, StepCheckpoint>>,
}

/// Process-local store. Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionRepository {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(&record.run_id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                record.run_id
            )));
        }
        inner.executions.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.executions.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, run_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.inner.read().await.executions.get(run_id).cloned())
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut records: Vec<ExecutionRecord> = inner
            .executions
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        // v7 run ids sort by creation time.
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn list_crashed_executions(&self) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        self.list_executions(Some(ExecutionStatus::Running), u32::MAX).await
    }

    async fn delete_execution(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.checkpoints.remove(run_id);
        Ok(inner.executions.remove(run_id).is_some())
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        if !inner.executions.contains_key(&checkpoint.run_id) {
            return Err(RepositoryError::NotFound);
        }
        let steps = inner.checkpoints.entry(checkpoint.run_id).or_default();
        if steps.contains_key(&checkpoint.step_index) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} for run {} already exists",
                checkpoint.step_index, checkpoint.run_id
            )));
        }
        steps.insert(checkpoint.step_index, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoints(&self, run_id: &Uuid) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_last_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<StepCheckpoint>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(run_id)
            .and_then(|steps| steps.values().next_back().cloned()))
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|r| {
                matches!(r.status, ExecutionStatus::Completed | ExecutionStatus::Failed)
                    && r.completed_at.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.run_id)
            .collect();
        for run_id in &expired {
            inner.executions.remove(run_id);
            inner.checkpoints.remove(run_id);
        }
        Ok(expired.len() as u64)
    }

    async fn get_stats(&self, workflow_id: Option<&str>) -> Result<ExecutionStats, RepositoryError> {
        let inner = self.inner.read().await;
        let counts = inner
            .executions
            .values()
            .filter(|r| workflow_id.is_none_or(|id| r.workflow_id == id))
            .map(|r| (r.status, 1));
        Ok(ExecutionStats::from_counts(counts))
    }
}
