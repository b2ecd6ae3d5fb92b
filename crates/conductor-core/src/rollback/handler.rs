//! Compensation handler trait and its object-safe wrapper.
//!
//! `CompensationHandler` uses RPITIT, so it cannot be a trait object
//! directly. `CompensationHandlerDyn` boxes the future and is blanket
//! implemented for every handler; `BoxCompensationHandler` wraps it for the
//! registry's runtime map.

use std::future::Future;
use std::pin::Pin;

use conductor_types::rollback::RollbackAction;

use super::RollbackError;

/// Undoes one kind of side effect (files, commits, tickets...).
pub trait CompensationHandler: Send + Sync {
    /// Resource kind this handler serves, matched against `RollbackAction::resource`.
    fn kind(&self) -> &str;

    fn compensate(
        &self,
        action: &RollbackAction,
    ) -> impl Future<Output = Result<(), RollbackError>> + Send;
}

/// Object-safe version of [`CompensationHandler`] with boxed futures.
pub trait CompensationHandlerDyn: Send + Sync {
    fn kind(&self) -> &str;

    fn compensate_boxed<'a>(
        &'a self,
        action: &'a RollbackAction,
    ) -> Pin<Box<dyn Future<Output = Result<(), RollbackError>> + Send + 'a>>;
}

impl<T: CompensationHandler> CompensationHandlerDyn for T {
    fn kind(&self) -> &str {
        CompensationHandler::kind(self)
    }

    fn compensate_boxed<'a>(
        &'a self,
        action: &'a RollbackAction,
    ) -> Pin<Box<dyn Future<Output = Result<(), RollbackError>> + Send + 'a>> {
        Box::pin(self.compensate(action))
    }
}

/// Type-erased compensation handler.
pub struct BoxCompensationHandler {
    inner: Box<dyn CompensationHandlerDyn>,
}

impl BoxCompensationHandler {
    pub fn new<T: CompensationHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn kind(&self) -> &str {
        self.inner.kind()
    }

    pub async fn compensate(&self, action: &RollbackAction) -> Result<(), RollbackError> {
        self.inner.compensate_boxed(action).await
    }
}

impl std::fmt::Debug for BoxCompensationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCompensationHandler")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Default handler: records the compensation in the log and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyHandler;

impl CompensationHandler for LogOnlyHandler {
    fn kind(&self) -> &str {
        "log"
    }

    async fn compensate(&self, action: &RollbackAction) -> Result<(), RollbackError> {
        tracing::info!(
            run_id = %action.run_id,
            step_id = %action.step_id,
            resource = %action.resource,
            op = %action.compensating_op,
            "compensation (log only)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn boxed_log_handler_succeeds() {
        let handler = BoxCompensationHandler::new(LogOnlyHandler);
        assert_eq!(handler.kind(), "log");

        let action = RollbackAction {
            run_id: Uuid::now_v7(),
            step_id: "create-ticket".to_string(),
            step_index: 0,
            resource: "jira".to_string(),
            compensating_op: "close".to_string(),
            params: Default::default(),
            registered_at: Utc::now(),
        };
        assert!(handler.compensate(&action).await.is_ok());
    }
}
