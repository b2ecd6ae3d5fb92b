//! Optional engine hooks: audit sink and permission checks.
//!
//! Both are plain object-safe traits held as `Arc<dyn ..>`. An engine built
//! without them skips auditing and authorization entirely.

use std::collections::{HashMap, HashSet};

use conductor_types::event::EngineEvent;

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Receives run start/stop, step failure, failover and rollback events.
///
/// Called inline on the run's task, so implementations should hand off
/// anything slow.
pub trait AuditHook: Send + Sync {
    fn record(&self, event: &EngineEvent);
}

/// Audit hook that writes each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditHook;

impl AuditHook for TracingAuditHook {
    fn record(&self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::info!(target: "conductor::audit", run_id = %event.run_id(), event = %json, "audit"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit event"),
        }
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Error returned when a user may not perform an action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("permission denied: user '{user}' may not perform '{action}'")]
pub struct PermissionDenied {
    pub user: String,
    pub action: String,
}

/// Checked before every dispatch when the run carries a user.
///
/// `action` is the step's action string (`tool.op` or `agent.op`).
pub trait PermissionChecker: Send + Sync {
    fn require_permission(&self, user: &str, action: &str) -> Result<(), PermissionDenied>;
}

/// Static allow-list: each user maps to action patterns. A pattern is an
/// exact action, `tool.*`, or `*`.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.grants
            .entry(user.into())
            .or_default()
            .insert(pattern.into());
        self
    }

    fn allows(&self, user: &str, action: &str) -> bool {
        let Some(patterns) = self.grants.get(user) else {
            return false;
        };
        if patterns.contains("*") || patterns.contains(action) {
            return true;
        }
        action
            .split_once('.')
            .is_some_and(|(target, _)| patterns.contains(&format!("{target}.*")))
    }
}

impl PermissionChecker for StaticPermissions {
    fn require_permission(&self, user: &str, action: &str) -> Result<(), PermissionDenied> {
        if self.allows(user, action) {
            Ok(())
        } else {
            Err(PermissionDenied {
                user: user.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_wildcard_and_target_patterns() {
        let perms = StaticPermissions::new()
            .grant("alice", "*")
            .grant("bob", "github.*")
            .grant("bob", "agent.summarize");

        assert!(perms.require_permission("alice", "jira.delete").is_ok());
        assert!(perms.require_permission("bob", "github.merge").is_ok());
        assert!(perms.require_permission("bob", "agent.summarize").is_ok());

        let err = perms.require_permission("bob", "jira.create").unwrap_err();
        assert_eq!(err.action, "jira.create");
        assert!(perms.require_permission("carol", "github.merge").is_err());
    }
}
