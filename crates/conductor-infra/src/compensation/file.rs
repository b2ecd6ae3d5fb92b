//! File compensation: undo file creation or overwrite.
//!
//! Ops:
//! - `delete { path }` removes a file the step created. Already gone is fine.
//! - `restore { path, content }` writes the captured content back.
//! - `restore { path, backup_path }` copies a backup over the file.

use conductor_core::rollback::{CompensationHandler, RollbackError};
use conductor_types::rollback::RollbackAction;

use super::required_param;

#[derive(Debug, Clone, Copy, Default)]
pub struct FileCompensationHandler;

impl CompensationHandler for FileCompensationHandler {
    fn kind(&self) -> &str {
        "file"
    }

    async fn compensate(&self, action: &RollbackAction) -> Result<(), RollbackError> {
        let path = required_param(action, "path")?;

        match action.compensating_op.as_str() {
            "delete" => match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    tracing::info!(run_id = %action.run_id, step_id = %action.step_id, path, "deleted file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path, "file already absent");
                    Ok(())
                }
                Err(e) => Err(RollbackError::Io(format!("delete {path}: {e}"))),
            },
            "restore" => {
                if let Some(content) = action.params.get("content").and_then(|v| v.as_str()) {
                    tokio::fs::write(path, content)
                        .await
                        .map_err(|e| RollbackError::Io(format!("restore {path}: {e}")))?;
                } else if let Some(backup) = action.params.get("backup_path").and_then(|v| v.as_str()) {
                    tokio::fs::copy(backup, path)
                        .await
                        .map_err(|e| RollbackError::Io(format!("restore {path} from {backup}: {e}")))?;
                } else {
                    return Err(RollbackError::MissingParam {
                        op: "restore".to_string(),
                        param: "content or backup_path".to_string(),
                    });
                }
                tracing::info!(run_id = %action.run_id, step_id = %action.step_id, path, "restored file");
                Ok(())
            }
            other => Err(RollbackError::UnsupportedOp {
                resource: "file".to_string(),
                op: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map, Value};
    use uuid::Uuid;

    fn action(op: &str, params: Value) -> RollbackAction {
        let params: Map<String, Value> = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        RollbackAction {
            run_id: Uuid::now_v7(),
            step_id: "write-report".to_string(),
            step_index: 0,
            resource: "file".to_string(),
            compensating_op: op.to_string(),
            params,
            registered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delete_removes_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        tokio::fs::write(&path, "draft").await.unwrap();

        let a = action("delete", json!({ "path": path.to_str().unwrap() }));
        FileCompensationHandler.compensate(&a).await.unwrap();
        assert!(!path.exists());

        // Second delete is a no-op.
        FileCompensationHandler.compensate(&a).await.unwrap();
    }

    #[tokio::test]
    async fn restore_from_content_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let backup = dir.path().join("config.yaml.bak");
        tokio::fs::write(&path, "overwritten").await.unwrap();
        tokio::fs::write(&backup, "from backup").await.unwrap();

        let a = action(
            "restore",
            json!({ "path": path.to_str().unwrap(), "content": "original" }),
        );
        FileCompensationHandler.compensate(&a).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "original");

        let a = action(
            "restore",
            json!({ "path": path.to_str().unwrap(), "backup_path": backup.to_str().unwrap() }),
        );
        FileCompensationHandler.compensate(&a).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "from backup");
    }

    #[tokio::test]
    async fn missing_params_and_unknown_ops_fail() {
        let err = FileCompensationHandler
            .compensate(&action("delete", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::MissingParam { .. }));

        let err = FileCompensationHandler
            .compensate(&action("restore", json!({ "path": "/tmp/x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::MissingParam { .. }));

        let err = FileCompensationHandler
            .compensate(&action("chmod", json!({ "path": "/tmp/x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::UnsupportedOp { .. }));
    }
}
