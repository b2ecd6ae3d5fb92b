//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `conductor-core` using sqlx with
//! split read/write pools. Run inputs, outputs and step outputs are stored as
//! JSON text. Timestamps are fixed-width RFC 3339 in UTC, so text comparison
//! orders them correctly.

use chrono::{DateTime, SecondsFormat, Utc};
use conductor_core::repository::execution::ExecutionRepository;
use conductor_types::error::RepositoryError;
use conductor_types::execution::{
    ExecutionRecord, ExecutionStats, ExecutionStatus, StepCheckpoint, StepStatus,
};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const EXECUTION_COLUMNS: &str = "run_id, workflow_id, workflow_name, status, current_step, \
     trigger_type, inputs, outputs, error, resumed_from, created_at, started_at, updated_at, completed_at";

const CHECKPOINT_COLUMNS: &str =
    "run_id, step_index, step_id, status, agent, started_at, completed_at, output, error, retry_count";

struct ExecutionRow {
    run_id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    current_step: i64,
    trigger_type: String,
    inputs: String,
    outputs: String,
    error: Option<String>,
    resumed_from: Option<String>,
    created_at: String,
    started_at: Option<String>,
    updated_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            trigger_type: row.try_get("trigger_type")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            error: row.try_get("error")?,
            resumed_from: row.try_get("resumed_from")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        Ok(ExecutionRecord {
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status: parse_execution_status(&self.status)?,
            current_step: self.current_step.max(0) as usize,
            trigger: self.trigger_type,
            inputs: parse_json(&self.inputs, "inputs")?,
            outputs: parse_json(&self.outputs, "outputs")?,
            error: self.error,
            resumed_from: self.resumed_from.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct CheckpointRow {
    run_id: String,
    step_index: i64,
    step_id: String,
    status: String,
    agent: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    output: Option<String>,
    error: Option<String>,
    retry_count: i64,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_index: row.try_get("step_index")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            agent: row.try_get("agent")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
        })
    }

    fn into_checkpoint(self) -> Result<StepCheckpoint, RepositoryError> {
        let status: StepStatus = serde_json::from_value(Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid step status: {}", self.status)))?;

        Ok(StepCheckpoint {
            run_id: parse_uuid(&self.run_id)?,
            step_index: self.step_index.max(0) as usize,
            step_id: self.step_id,
            status,
            agent: self.agent,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            error: self.error,
            retry_count: self.retry_count.max(0) as u32,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_execution_status(s: &str) -> Result<ExecutionStatus, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {s}")))
}

/// Map insert failures: unique violations become `Conflict`, foreign key
/// violations `NotFound`.
fn map_insert_error(e: sqlx::Error, what: String) -> RepositoryError {
    match e.as_database_error() {
        Some(db) if db.is_unique_violation() => RepositoryError::Conflict(format!("{what} already exists")),
        Some(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        _ => RepositoryError::Query(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (run_id, workflow_id, workflow_name, status, current_step, trigger_type,
                inputs, outputs, error, resumed_from, created_at, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.workflow_name)
        .bind(record.status.as_str())
        .bind(record.current_step as i64)
        .bind(&record.trigger)
        .bind(to_json(&record.inputs)?)
        .bind(to_json(&record.outputs)?)
        .bind(&record.error)
        .bind(record.resumed_from.map(|id| id.to_string()))
        .bind(format_datetime(&record.created_at))
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(format_datetime(&record.updated_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_insert_error(e, format!("execution {}", record.run_id)))?;

        Ok(())
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO executions
               (run_id, workflow_id, workflow_name, status, current_step, trigger_type,
                inputs, outputs, error, resumed_from, created_at, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 workflow_id = excluded.workflow_id,
                 workflow_name = excluded.workflow_name,
                 status = excluded.status,
                 current_step = excluded.current_step,
                 trigger_type = excluded.trigger_type,
                 inputs = excluded.inputs,
                 outputs = excluded.outputs,
                 error = excluded.error,
                 resumed_from = excluded.resumed_from,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.workflow_id)
        .bind(&record.workflow_name)
        .bind(record.status.as_str())
        .bind(record.current_step as i64)
        .bind(&record.trigger)
        .bind(to_json(&record.inputs)?)
        .bind(to_json(&record.outputs)?)
        .bind(&record.error)
        .bind(record.resumed_from.map(|id| id.to_string()))
        .bind(format_datetime(&record.created_at))
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(format_datetime(&record.updated_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_execution(&self, run_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE run_id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE status = ? \
                     ORDER BY created_at DESC, run_id DESC LIMIT ?"
                ))
                .bind(s.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     ORDER BY created_at DESC, run_id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn list_crashed_executions(&self) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        self.list_executions(Some(ExecutionStatus::Running), u32::MAX).await
    }

    async fn delete_execution(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM executions WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        let output = checkpoint.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_checkpoints
               (run_id, step_index, step_id, status, agent, started_at, completed_at,
                output, error, retry_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(checkpoint.step_index as i64)
        .bind(&checkpoint.step_id)
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.agent)
        .bind(format_datetime(&checkpoint.started_at))
        .bind(checkpoint.completed_at.as_ref().map(format_datetime))
        .bind(&output)
        .bind(&checkpoint.error)
        .bind(i64::from(checkpoint.retry_count))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            map_insert_error(
                e,
                format!("checkpoint {} for run {}", checkpoint.step_index, checkpoint.run_id),
            )
        })?;

        Ok(())
    }

    async fn get_checkpoints(&self, run_id: &Uuid) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM step_checkpoints WHERE run_id = ? ORDER BY step_index ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn get_last_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<StepCheckpoint>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM step_checkpoints WHERE run_id = ? \
             ORDER BY step_index DESC LIMIT 1"
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        // Checkpoints go with their run via ON DELETE CASCADE.
        let result = sqlx::query(
            r#"DELETE FROM executions
               WHERE status IN ('completed', 'failed')
                 AND completed_at IS NOT NULL
                 AND completed_at < ?"#,
        )
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get_stats(&self, workflow_id: Option<&str>) -> Result<ExecutionStats, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(
                    "SELECT status, COUNT(*) AS n FROM executions WHERE workflow_id = ? GROUP BY status",
                )
                .bind(id)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT status, COUNT(*) AS n FROM executions GROUP BY status")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            counts.push((parse_execution_status(&status)?, n.max(0) as u64));
        }
        Ok(ExecutionStats::from_counts(counts))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use conductor_core::workflow::checkpoint::StateStore;
    use serde_json::json;

    async fn test_repo() -> (SqliteExecutionRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteExecutionRepository::new(pool), dir)
    }

    fn record(workflow_id: &str, status: ExecutionStatus) -> ExecutionRecord {
        let mut r = ExecutionRecord::new(
            Uuid::now_v7(),
            workflow_id,
            workflow_id,
            "manual",
            json!({ "repo": "conductor" }),
        );
        r.status = status;
        r
    }

    fn checkpoint(run_id: Uuid, step_index: usize, status: StepStatus) -> StepCheckpoint {
        StepCheckpoint {
            run_id,
            step_index,
            step_id: format!("step-{step_index}"),
            status,
            agent: (step_index % 2 == 1).then(|| "fast".to_string()),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            output: Some(json!({ "n": step_index })),
            error: None,
            retry_count: step_index as u32,
        }
    }

    // -------------------------------------------------------------------
    // Executions
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_execution_round_trip() {
        let (repo, _dir) = test_repo().await;
        let mut r = record("deploy", ExecutionStatus::Running);
        r.started_at = Some(Utc::now());
        r.resumed_from = Some(Uuid::now_v7());
        repo.create_execution(&r).await.unwrap();

        let loaded = repo.get_execution(&r.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "deploy");
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.inputs, json!({ "repo": "conductor" }));
        assert_eq!(loaded.resumed_from, r.resumed_from);
        assert_eq!(
            loaded.started_at.map(|t| t.timestamp_micros()),
            r.started_at.map(|t| t.timestamp_micros())
        );

        let err = repo.create_execution(&r).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_execution_overwrites() {
        let (repo, _dir) = test_repo().await;
        let mut r = record("deploy", ExecutionStatus::Running);
        repo.create_execution(&r).await.unwrap();

        r.status = ExecutionStatus::Failed;
        r.error = Some("step 'build' failed".to_string());
        r.outputs = json!({ "build": { "ok": false } });
        r.current_step = 2;
        r.completed_at = Some(Utc::now());
        repo.update_execution(&r).await.unwrap();

        let loaded = repo.get_execution(&r.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("step 'build' failed"));
        assert_eq!(loaded.outputs["build"]["ok"], false);
        assert_eq!(loaded.current_step, 2);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_executions_filters_and_limits() {
        let (repo, _dir) = test_repo().await;
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
        ] {
            repo.create_execution(&record("wf", status)).await.unwrap();
        }

        assert_eq!(repo.list_executions(None, 10).await.unwrap().len(), 4);
        assert_eq!(repo.list_executions(None, 2).await.unwrap().len(), 2);
        assert_eq!(repo.list_crashed_executions().await.unwrap().len(), 2);

        let all = repo.list_executions(None, 10).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_delete_execution_cascades() {
        let (repo, _dir) = test_repo().await;
        let r = record("wf", ExecutionStatus::Completed);
        repo.create_execution(&r).await.unwrap();
        repo.save_checkpoint(&checkpoint(r.run_id, 0, StepStatus::Completed))
            .await
            .unwrap();

        assert!(repo.delete_execution(&r.run_id).await.unwrap());
        assert!(!repo.delete_execution(&r.run_id).await.unwrap());
        assert!(repo.get_checkpoints(&r.run_id).await.unwrap().is_empty());
    }

    // -------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_checkpoints_ordered_and_unique() {
        let (repo, _dir) = test_repo().await;
        let r = record("wf", ExecutionStatus::Running);
        repo.create_execution(&r).await.unwrap();

        for i in [0, 2, 1] {
            repo.save_checkpoint(&checkpoint(r.run_id, i, StepStatus::Completed))
                .await
                .unwrap();
        }

        let all = repo.get_checkpoints(&r.run_id).await.unwrap();
        let indices: Vec<usize> = all.iter().map(|c| c.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(all[1].agent.as_deref(), Some("fast"));
        assert_eq!(all[2].output, Some(json!({ "n": 2 })));
        assert_eq!(all[2].retry_count, 2);

        let last = repo.get_last_checkpoint(&r.run_id).await.unwrap().unwrap();
        assert_eq!(last.step_index, 2);

        let err = repo
            .save_checkpoint(&checkpoint(r.run_id, 1, StepStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_for_unknown_run_is_not_found() {
        let (repo, _dir) = test_repo().await;
        let err = repo
            .save_checkpoint(&checkpoint(Uuid::now_v7(), 0, StepStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_resume_point_through_state_store() {
        let (repo, _dir) = test_repo().await;
        let store = StateStore::new(repo);
        let r = record("wf", ExecutionStatus::Running);
        store.create_execution(&r).await.unwrap();

        store
            .save_checkpoint(&checkpoint(r.run_id, 0, StepStatus::Completed))
            .await
            .unwrap();
        store
            .save_checkpoint(&checkpoint(r.run_id, 1, StepStatus::Completed))
            .await
            .unwrap();
        store
            .save_checkpoint(&checkpoint(r.run_id, 2, StepStatus::Failed))
            .await
            .unwrap();

        assert_eq!(store.get_resume_point(r.run_id).await.unwrap(), 2);
    }

    // -------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_cleanup_deletes_only_old_finished_runs() {
        let (repo, _dir) = test_repo().await;

        let mut old = record("wf", ExecutionStatus::Completed);
        old.completed_at = Some(Utc::now() - Duration::days(39));
        let mut recent = record("wf", ExecutionStatus::Failed);
        recent.completed_at = Some(Utc::now() - Duration::days(5));
        let running = record("wf", ExecutionStatus::Running);

        for r in [&old, &recent, &running] {
            repo.create_execution(r).await.unwrap();
        }
        repo.save_checkpoint(&checkpoint(old.run_id, 0, StepStatus::Completed))
            .await
            .unwrap();

        let deleted = repo
            .cleanup_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(repo.get_execution(&old.run_id).await.unwrap().is_none());
        assert!(repo.get_checkpoints(&old.run_id).await.unwrap().is_empty());
        assert!(repo.get_execution(&recent.run_id).await.unwrap().is_some());
        assert!(repo.get_execution(&running.run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_by_workflow() {
        let (repo, _dir) = test_repo().await;
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            repo.create_execution(&record("deploy", status)).await.unwrap();
        }
        repo.create_execution(&record("other", ExecutionStatus::Running))
            .await
            .unwrap();

        let stats = repo.get_stats(Some("deploy")).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);

        let all = repo.get_stats(None).await.unwrap();
        assert_eq!(all.total, 5);
        assert_eq!(all.running, 1);
    }
}
