//! Concrete compensation handlers for the rollback registry.
//!
//! - `file` -- deletes created files and restores overwritten ones
//! - `git` -- reverts commits made by a step

pub mod file;
pub mod git;

pub use file::FileCompensationHandler;
pub use git::GitCompensationHandler;

use conductor_core::rollback::{RollbackError, RollbackRegistry};
use conductor_types::rollback::RollbackAction;

/// Registry with the file and git handlers installed.
pub fn default_rollback_registry() -> RollbackRegistry {
    RollbackRegistry::new()
        .with_handler(FileCompensationHandler)
        .with_handler(GitCompensationHandler)
}

/// Required string parameter of a compensation.
fn required_param<'a>(action: &'a RollbackAction, name: &str) -> Result<&'a str, RollbackError> {
    action
        .params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RollbackError::MissingParam {
            op: action.compensating_op.clone(),
            param: name.to_string(),
        })
}
