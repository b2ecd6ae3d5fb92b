//! Per-run compensation log and reverse-order execution.

use std::collections::HashMap;

use conductor_types::rollback::{
    CompensationFailure, RollbackAction, RollbackReport, RollbackStatus,
};
use dashmap::DashMap;
use uuid::Uuid;

use super::handler::{BoxCompensationHandler, CompensationHandler, LogOnlyHandler};

/// Holds every in-flight run's reversible actions and the handlers that undo
/// them. Shared by all runs; each run only touches its own entry.
#[derive(Debug)]
pub struct RollbackRegistry {
    log: DashMap<Uuid, Vec<RollbackAction>>,
    handlers: HashMap<String, BoxCompensationHandler>,
    fallback: BoxCompensationHandler,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self {
            log: DashMap::new(),
            handlers: HashMap::new(),
            fallback: BoxCompensationHandler::new(LogOnlyHandler),
        }
    }

    /// Add a handler for its `kind()`. A later handler for the same kind
    /// replaces the earlier one.
    pub fn with_handler<H: CompensationHandler + 'static>(mut self, handler: H) -> Self {
        let boxed = BoxCompensationHandler::new(handler);
        self.handlers.insert(boxed.kind().to_string(), boxed);
        self
    }

    pub fn handler_kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Append an action to its run's log.
    pub fn register(&self, action: RollbackAction) {
        tracing::debug!(
            run_id = %action.run_id,
            step_id = %action.step_id,
            resource = %action.resource,
            op = %action.compensating_op,
            "registered compensation"
        );
        self.log.entry(action.run_id).or_default().push(action);
    }

    /// Registered actions for a run, in registration order.
    pub fn actions(&self, run_id: Uuid) -> Vec<RollbackAction> {
        self.log
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Drop a run's log without compensating (run finished cleanly or was
    /// cancelled).
    pub fn discard(&self, run_id: Uuid) {
        self.log.remove(&run_id);
    }

    /// Undo a run's actions newest-first.
    ///
    /// Best-effort: a failed compensation is recorded and the remaining ones
    /// still run. The run's log is drained, so a second call reports
    /// `Succeeded` with nothing compensated.
    pub async fn rollback(&self, run_id: Uuid) -> RollbackReport {
        let actions = match self.log.remove(&run_id) {
            Some((_, actions)) if !actions.is_empty() => actions,
            _ => {
                tracing::debug!(run_id = %run_id, "nothing to roll back");
                return RollbackReport::empty(run_id);
            }
        };

        tracing::info!(run_id = %run_id, actions = actions.len(), "rolling back run");

        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        for action in actions.iter().rev() {
            let handler = self
                .handlers
                .get(&action.resource)
                .unwrap_or(&self.fallback);

            match handler.compensate(action).await {
                Ok(()) => compensated.push(action.step_id.clone()),
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %action.step_id,
                        resource = %action.resource,
                        error = %e,
                        "compensation failed"
                    );
                    failures.push(CompensationFailure {
                        step_id: action.step_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let status = if failures.is_empty() {
            RollbackStatus::Succeeded
        } else {
            tracing::warn!(
                run_id = %run_id,
                failed = failures.len(),
                "rollback partial; full reversal not guaranteed"
            );
            RollbackStatus::Partial
        };

        RollbackReport {
            run_id,
            status,
            compensated,
            failures,
        }
    }
}

impl Default for RollbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::RollbackError;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    /// Records the step ids it compensates; fails for `fail_on`.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl CompensationHandler for Recorder {
        fn kind(&self) -> &str {
            "test"
        }

        async fn compensate(&self, action: &RollbackAction) -> Result<(), RollbackError> {
            self.seen.lock().unwrap().push(action.step_id.clone());
            if self.fail_on == Some(action.step_id.as_str()) {
                return Err(RollbackError::Failed("boom".to_string()));
            }
            Ok(())
        }
    }

    fn action(run_id: Uuid, step_id: &str, index: usize, resource: &str) -> RollbackAction {
        RollbackAction {
            run_id,
            step_id: step_id.to_string(),
            step_index: index,
            resource: resource.to_string(),
            compensating_op: "undo".to_string(),
            params: Default::default(),
            registered_at: Utc::now(),
        }
    }

    fn registry(fail_on: Option<&'static str>) -> (RollbackRegistry, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = RollbackRegistry::new().with_handler(Recorder {
            seen: seen.clone(),
            fail_on,
        });
        (registry, seen)
    }

    #[tokio::test]
    async fn compensates_in_reverse_registration_order() {
        let (registry, seen) = registry(None);
        let run_id = Uuid::now_v7();
        registry.register(action(run_id, "A", 0, "test"));
        registry.register(action(run_id, "B", 1, "test"));
        registry.register(action(run_id, "C", 2, "test"));

        let report = registry.rollback(run_id).await;

        assert_eq!(*seen.lock().unwrap(), vec!["C", "B", "A"]);
        assert_eq!(report.status, RollbackStatus::Succeeded);
        assert_eq!(report.compensated, vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn failure_is_partial_and_does_not_stop_the_rest() {
        let (registry, seen) = registry(Some("B"));
        let run_id = Uuid::now_v7();
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            registry.register(action(run_id, id, i, "test"));
        }

        let report = registry.rollback(run_id).await;

        assert_eq!(*seen.lock().unwrap(), vec!["C", "B", "A"]);
        assert!(report.is_partial());
        assert_eq!(report.compensated, vec!["C", "A"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step_id, "B");
    }

    #[tokio::test]
    async fn rollback_drains_the_log() {
        let (registry, seen) = registry(None);
        let run_id = Uuid::now_v7();
        registry.register(action(run_id, "A", 0, "test"));

        registry.rollback(run_id).await;
        let second = registry.rollback(run_id).await;

        assert_eq!(second.status, RollbackStatus::Succeeded);
        assert!(second.compensated.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(registry.actions(run_id).is_empty());
    }

    #[tokio::test]
    async fn unknown_resource_falls_back_to_log_only() {
        let (registry, seen) = registry(None);
        let run_id = Uuid::now_v7();
        registry.register(action(run_id, "notify", 0, "slack"));

        let report = registry.rollback(run_id).await;

        assert_eq!(report.status, RollbackStatus::Succeeded);
        assert_eq!(report.compensated, vec!["notify"]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_are_isolated() {
        let (registry, seen) = registry(None);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        registry.register(action(a, "a1", 0, "test"));
        registry.register(action(b, "b1", 0, "test"));

        registry.discard(b);
        registry.rollback(a).await;

        assert_eq!(*seen.lock().unwrap(), vec!["a1"]);
        assert!(registry.actions(b).is_empty());
    }
}
