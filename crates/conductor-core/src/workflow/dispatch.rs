//! Dispatch targets: tools and agent adapters.
//!
//! `Tool` and `AgentAdapter` are the contracts external integrations
//! implement. Both use RPITIT, so each has an object-safe `*Dyn` twin with
//! boxed futures, blanket-implemented for every implementor, and a `Box*`
//! wrapper used by the runtime registries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conductor_types::execution::AgentStepResult;
use conductor_types::workflow::WorkflowStep;
use serde_json::{Map, Value};

use super::context::ExecutionContext;
use super::error::StepError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a tool or adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The target does not implement the requested operation.
    #[error("'{target}' has no operation '{op}'")]
    UnknownOp { target: String, op: String },

    /// The call ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl From<DispatchError> for StepError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::UnknownOp { target, op } => {
                StepError::UnknownTarget(format!("{target}.{op}"))
            }
            DispatchError::Failed(msg) => StepError::Execution(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

/// A side-effecting integration (ticketing, chat, VCS...).
///
/// A tool's JSON output may carry a `rollback` array of
/// `{ "resource", "op", "params" }` objects; the engine registers each as a
/// compensation for the step.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Run `op`. Unknown ops fail with `DispatchError::UnknownOp`.
    fn execute(
        &self,
        op: &str,
        params: &Map<String, Value>,
    ) -> impl Future<Output = Result<Value, DispatchError>> + Send;
}

/// Object-safe version of [`Tool`].
pub trait ToolDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        op: &'a str,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>>;
}

impl<T: Tool> ToolDyn for T {
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        op: &'a str,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>> {
        Box::pin(self.execute(op, params))
    }
}

/// Type-erased tool.
pub struct BoxTool {
    inner: Box<dyn ToolDyn>,
}

impl BoxTool {
    pub fn new<T: Tool + 'static>(tool: T) -> Self {
        Self {
            inner: Box::new(tool),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(
        &self,
        op: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        self.inner.execute_boxed(op, params).await
    }
}

impl std::fmt::Debug for BoxTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTool").field("name", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// AgentAdapter
// ---------------------------------------------------------------------------

/// Runs an `agent.<op>` step against one model backend.
///
/// `inputs` are the step's inputs already resolved against `context`.
/// A returned result with status `Completed` is a success, `Skipped` marks
/// the step skipped, anything else is a failure carrying `error`. `Err` is
/// a transport-level failure.
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn execute_step(
        &self,
        step: &WorkflowStep,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> impl Future<Output = Result<AgentStepResult, DispatchError>> + Send;
}

/// Object-safe version of [`AgentAdapter`].
pub trait AgentAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_step_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        inputs: &'a Map<String, Value>,
        context: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<AgentStepResult, DispatchError>> + Send + 'a>>;
}

impl<T: AgentAdapter> AgentAdapterDyn for T {
    fn name(&self) -> &str {
        AgentAdapter::name(self)
    }

    fn execute_step_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        inputs: &'a Map<String, Value>,
        context: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<AgentStepResult, DispatchError>> + Send + 'a>> {
        Box::pin(self.execute_step(step, inputs, context))
    }
}

/// Type-erased agent adapter.
pub struct BoxAgentAdapter {
    inner: Box<dyn AgentAdapterDyn>,
}

impl BoxAgentAdapter {
    pub fn new<T: AgentAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        inputs: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<AgentStepResult, DispatchError> {
        self.inner.execute_step_boxed(step, inputs, context).await
    }
}

impl std::fmt::Debug for BoxAgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentAdapter")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Tools by name, with optional per-agent overrides.
///
/// Built once at startup and shared with the engine by `Arc`.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    global: HashMap<String, Arc<BoxTool>>,
    scoped: HashMap<(String, String), Arc<BoxTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name for every agent.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> &mut Self {
        let tool = BoxTool::new(tool);
        self.global.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    /// Register a tool visible only when `agent` runs the step.
    pub fn register_for_agent<T: Tool + 'static>(
        &mut self,
        agent: impl Into<String>,
        tool: T,
    ) -> &mut Self {
        let tool = BoxTool::new(tool);
        self.scoped
            .insert((agent.into(), tool.name().to_string()), Arc::new(tool));
        self
    }

    /// Look up a tool; an agent-scoped registration shadows the global one.
    pub fn get_tool(&self, name: &str, agent: Option<&str>) -> Option<Arc<BoxTool>> {
        agent
            .and_then(|a| self.scoped.get(&(a.to_string(), name.to_string())))
            .or_else(|| self.global.get(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.global.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Agent adapters by name. Profiles for routing live in `AgentRouter`.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<BoxAgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: AgentAdapter + 'static>(&mut self, adapter: T) -> &mut Self {
        let adapter = BoxAgentAdapter::new(adapter);
        self.adapters
            .insert(adapter.name().to_string(), Arc::new(adapter));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxAgentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            op: &str,
            params: &Map<String, Value>,
        ) -> Result<Value, DispatchError> {
            match op {
                "say" => Ok(json!({ "by": self.0, "params": params })),
                other => Err(DispatchError::UnknownOp {
                    target: "echo".to_string(),
                    op: other.to_string(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn agent_scoped_tool_shadows_global() {
        let mut tools = ToolRegistry::new();
        tools.register(Echo("global")).register_for_agent("smart", Echo("scoped"));

        let params = Map::new();
        let global = tools.get_tool("echo", Some("fast")).unwrap();
        assert_eq!(global.execute("say", &params).await.unwrap()["by"], "global");

        let scoped = tools.get_tool("echo", Some("smart")).unwrap();
        assert_eq!(scoped.execute("say", &params).await.unwrap()["by"], "scoped");

        assert!(tools.get_tool("jira", None).is_none());
        assert_eq!(tools.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn unknown_op_maps_to_non_retryable_step_error() {
        let tool = BoxTool::new(Echo("global"));
        let err = tool.execute("shout", &Map::new()).await.unwrap_err();
        let step_err: StepError = err.into();
        assert_eq!(step_err, StepError::UnknownTarget("echo.shout".to_string()));
        assert!(!step_err.is_retryable());
    }
}
