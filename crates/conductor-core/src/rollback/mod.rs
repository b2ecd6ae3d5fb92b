//! Saga-style compensation.
//!
//! Successful steps append `RollbackAction`s to their run's log; on a
//! rollback the `RollbackRegistry` undoes them newest-first through
//! pluggable `CompensationHandler`s, keyed by resource kind.

pub mod handler;
pub mod registry;

pub use handler::{BoxCompensationHandler, CompensationHandler, LogOnlyHandler};
pub use registry::RollbackRegistry;

/// A single compensation failed. Recorded in the report, never fatal to the
/// rollback as a whole.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RollbackError {
    #[error("handler '{resource}' does not support op '{op}'")]
    UnsupportedOp { resource: String, op: String },

    #[error("compensation '{op}' is missing parameter '{param}'")]
    MissingParam { op: String, param: String },

    #[error("compensation failed: {0}")]
    Failed(String),

    #[error("compensation io error: {0}")]
    Io(String),
}
