//! Git compensation: revert a commit a step made.
//!
//! Op `revert { repo, commit }` runs `git revert --no-edit <commit>` inside
//! `repo`. A non-zero exit fails the compensation with git's stderr.

use std::time::Duration;

use conductor_core::rollback::{CompensationHandler, RollbackError};
use conductor_types::rollback::RollbackAction;

use super::required_param;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct GitCompensationHandler;

impl CompensationHandler for GitCompensationHandler {
    fn kind(&self) -> &str {
        "git"
    }

    async fn compensate(&self, action: &RollbackAction) -> Result<(), RollbackError> {
        if action.compensating_op != "revert" {
            return Err(RollbackError::UnsupportedOp {
                resource: "git".to_string(),
                op: action.compensating_op.clone(),
            });
        }
        let repo = required_param(action, "repo")?;
        let commit = required_param(action, "commit")?;
        if commit.starts_with('-') {
            return Err(RollbackError::Failed(format!("invalid commit '{commit}'")));
        }

        let child = tokio::process::Command::new("git")
            .args(["revert", "--no-edit", commit])
            .current_dir(repo)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RollbackError::Io(format!("failed to spawn git: {e}")))?;

        let output = tokio::time::timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| RollbackError::Failed("git revert timed out".to_string()))?
            .map_err(|e| RollbackError::Io(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RollbackError::Failed(format!(
                "git revert {commit} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!(run_id = %action.run_id, step_id = %action.step_id, repo, commit, "reverted commit");
        Ok(())
    }
}
