//! Workflow engine: sequential step execution with durable checkpointing.
//!
//! `WorkflowEngine` drives each run's steps one at a time. A step moves
//! through `Pending -> Running -> (Retrying -> Running)* -> Completed | Failed`,
//! or straight to `Skipped` when its condition is false. Every terminal step
//! transition is checkpointed through the `StateStore` before the next step
//! starts, so a crashed run can be resumed from its first gap.
//!
//! # Failure handling
//!
//! 1. Retryable errors (execution failures, timeouts) are retried per the
//!    step's `RetryPolicy` with exponential backoff.
//! 2. Agent tasks whose agent keeps failing, or whose circuit breaker is
//!    open, fail over to a replacement chosen by the `AgentRouter`.
//! 3. What remains is handled by the step's (or workflow's) `ErrorHandling`:
//!    continue, stop, or stop and roll back completed steps.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conductor_types::agent::{FailoverEvent, RoutingContext};
use conductor_types::config::{CircuitBreakerConfig, EngineConfig, EngineSettings};
use conductor_types::event::EngineEvent;
use conductor_types::execution::{
    ExecutionOptions, ExecutionRecord, ExecutionStats, ExecutionStatus, StepCheckpoint,
    StepResult, StepStatus, WorkflowResult,
};
use conductor_types::rollback::{RollbackAction, RollbackReport};
use conductor_types::workflow::{
    ErrorHandling, RetryPolicy, StepAction, Workflow, WorkflowStep,
};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::hooks::{AuditHook, PermissionChecker};
use crate::repository::execution::ExecutionRepository;
use crate::rollback::RollbackRegistry;
use crate::routing::{AgentRouter, BudgetTracker, RoutingError};

use super::checkpoint::{resume_point, StateStore};
use super::circuit::CircuitBreakerRegistry;
use super::context::ExecutionContext;
use super::definition::{resolve_inputs, validate_workflow};
use super::dispatch::{AgentRegistry, BoxAgentAdapter, BoxTool, ToolRegistry};
use super::error::{EngineError, StepError};
use super::expression::ConditionEvaluator;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Everything a run mutates while its steps execute.
struct RunState {
    record: ExecutionRecord,
    ctx: ExecutionContext,
    step_results: Vec<StepResult>,
    failovers: Vec<FailoverEvent>,
}

/// How the step loop ended.
enum Outcome {
    Finished,
    Aborted { error: String, rollback: bool },
    Cancelled,
    TimedOut(u64),
}

/// Result of running one step to a terminal state.
struct StepRun {
    status: StepStatus,
    output: Option<Value>,
    error: Option<StepError>,
    retry_count: u32,
    agent: Option<String>,
    failovers: Vec<FailoverEvent>,
}

/// Successful dispatch payload.
struct Dispatched {
    output: Value,
    skipped: bool,
}

enum Target {
    Tool { tool: Arc<BoxTool>, op: String },
    Agent { name: String, adapter: Arc<BoxAgentAdapter> },
}

/// A dispatch raced against cancellation and a timeout.
enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn bounded<F: Future>(token: &CancellationToken, timeout: Duration, fut: F) -> Bounded<F::Output> {
    tokio::select! {
        _ = token.cancelled() => Bounded::Cancelled,
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(v) => Bounded::Done(v),
            Err(_) => Bounded::TimedOut,
        },
    }
}

/// Tracks one in-flight agent dispatch. Dropping it without `settle`
/// (cancellation, workflow timeout) hands back the breaker's trial slot.
struct InFlight<'a> {
    router: &'a AgentRouter,
    breakers: &'a CircuitBreakerRegistry,
    agent: &'a str,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn begin(router: &'a AgentRouter, breakers: &'a CircuitBreakerRegistry, agent: &'a str) -> Self {
        router.begin_dispatch(agent);
        Self {
            router,
            breakers,
            agent,
            settled: false,
        }
    }

    fn success(mut self) {
        self.breakers.record_success(self.agent);
        self.settled = true;
    }

    fn failure(mut self, error: &str) {
        self.breakers.record_failure(self.agent, error);
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.router.end_dispatch(self.agent);
        if !self.settled {
            self.breakers.release(self.agent);
        }
    }
}

/// Removes a run's cancellation token when the run stops, however it stops.
struct ActiveRun<'a> {
    active: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Central orchestrator. Generic over `R: ExecutionRepository` for storage
/// flexibility; shared across concurrent runs behind an `Arc`.
pub struct WorkflowEngine<R: ExecutionRepository> {
    store: StateStore<R>,
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentRegistry>,
    router: Arc<AgentRouter>,
    breakers: CircuitBreakerRegistry,
    rollback: Arc<RollbackRegistry>,
    events: EventBus,
    audit: Option<Arc<dyn AuditHook>>,
    permissions: Option<Arc<dyn PermissionChecker>>,
    settings: EngineSettings,
    /// Cancellation tokens keyed by run_id.
    active: DashMap<Uuid, CancellationToken>,
}

impl<R: ExecutionRepository> WorkflowEngine<R> {
    pub fn new(
        repo: R,
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentRegistry>,
        router: Arc<AgentRouter>,
    ) -> Self {
        let settings = EngineSettings::default();
        Self {
            store: StateStore::new(repo),
            tools,
            agents,
            router,
            breakers: CircuitBreakerRegistry::default(),
            rollback: Arc::new(RollbackRegistry::new()),
            events: EventBus::new(settings.event_bus_capacity),
            audit: None,
            permissions: None,
            settings,
            active: DashMap::new(),
        }
    }

    /// Build an engine with router, budget, breakers and settings taken
    /// from a loaded `EngineConfig`.
    pub fn from_config(
        repo: R,
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let budget = BudgetTracker::new(config.budget.clone());
        let router = AgentRouter::new(config.agents.clone(), config.router.clone(), budget);
        let mut engine = Self::new(repo, tools, agents, Arc::new(router))
            .with_breaker_config(config.circuit_breaker.clone());
        engine.events = EventBus::new(config.engine.event_bus_capacity);
        engine.settings = config.engine.clone();
        engine
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breakers = CircuitBreakerRegistry::new(config);
        self
    }

    pub fn with_rollback_registry(mut self, rollback: Arc<RollbackRegistry>) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_audit_hook(mut self, hook: Arc<dyn AuditHook>) -> Self {
        self.audit = Some(hook);
        self
    }

    pub fn with_permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = Some(checker);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &StateStore<R> {
        &self.store
    }

    pub fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Runs currently executing in this process.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active.contains_key(&run_id)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start a new run of `workflow`.
    ///
    /// Validation and input resolution failures are returned before any
    /// record is written. Step failures never surface as `Err`; they are
    /// reported in the returned `WorkflowResult`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: Value,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult, EngineError> {
        validate_workflow(workflow)?;
        let resolved = resolve_inputs(workflow, &inputs)?;

        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
        if self.is_active(run_id) {
            return Err(EngineError::AlreadyRunning(run_id));
        }

        let mut record = ExecutionRecord::new(
            run_id,
            workflow.id.clone(),
            workflow.name.clone(),
            options.trigger.clone(),
            Value::Object(resolved.clone()),
        );
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        self.store.create_execution(&record).await?;

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.id,
            trigger = %options.trigger,
            "starting workflow run"
        );
        self.emit(EngineEvent::RunStarted {
            run_id,
            workflow_id: workflow.id.clone(),
            trigger: options.trigger.clone(),
        });

        let state = RunState {
            record,
            ctx: ExecutionContext::new(run_id, workflow.id.clone(), resolved),
            step_results: Vec::new(),
            failovers: Vec::new(),
        };
        self.drive(workflow, state, 0, options.user.as_deref()).await
    }

    /// Continue a crashed, paused or failed run from its first gap.
    ///
    /// Variables are restored from the persisted outputs and the completed
    /// checkpoints. When a checkpoint already exists at or beyond the resume
    /// point the run continues under a new run_id with `resumed_from` set,
    /// so checkpoints stay append-only.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult, EngineError> {
        validate_workflow(workflow)?;

        let mut record = self.store.require_execution(run_id).await?;
        if record.workflow_id != workflow.id {
            return Err(EngineError::WorkflowMismatch {
                run_id,
                expected: record.workflow_id,
                actual: workflow.id.clone(),
            });
        }
        if !record.status.is_resumable() {
            return Err(EngineError::NotResumable {
                run_id,
                status: record.status.to_string(),
            });
        }
        if self.is_active(run_id) {
            return Err(EngineError::AlreadyRunning(run_id));
        }

        let checkpoints = self.store.get_checkpoints(run_id).await?;
        let point = resume_point(&checkpoints);

        let inputs = match &record.inputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut ctx = ExecutionContext::new(run_id, workflow.id.clone(), inputs);
        if let Value::Object(vars) = &record.outputs {
            for (k, v) in vars {
                ctx.set_variable(k.clone(), v.clone());
            }
        }

        let mut step_results = Vec::new();
        for cp in checkpoints.iter().filter(|c| c.step_index < point) {
            let variable = workflow
                .steps
                .iter()
                .find(|s| s.id == cp.step_id)
                .and_then(|s| s.output.as_deref());
            ctx.record_output(&cp.step_id, variable, cp.output.clone().unwrap_or(Value::Null));
            step_results.push(StepResult {
                step_id: cp.step_id.clone(),
                step_index: cp.step_index,
                status: cp.status,
                output: cp.output.clone(),
                error: None,
                retry_count: cp.retry_count,
                agent: cp.agent.clone(),
                duration_ms: duration_ms(cp.started_at, cp.completed_at),
            });
        }

        let fork = checkpoints.iter().any(|c| c.step_index >= point);
        if fork {
            let new_id = Uuid::now_v7();
            let mut forked = ExecutionRecord::new(
                new_id,
                workflow.id.clone(),
                workflow.name.clone(),
                options.trigger.clone(),
                record.inputs.clone(),
            );
            forked.status = ExecutionStatus::Running;
            forked.current_step = point;
            forked.resumed_from = Some(run_id);
            forked.started_at = Some(Utc::now());
            forked.outputs = record.outputs.clone();
            self.store.create_execution(&forked).await?;

            for cp in checkpoints.iter().filter(|c| c.step_index < point) {
                let mut copy = cp.clone();
                copy.run_id = new_id;
                self.store.save_checkpoint(&copy).await?;
            }

            tracing::info!(
                run_id = %new_id,
                resumed_from = %run_id,
                resume_point = point,
                "resuming workflow run under new run id"
            );
            ctx.run_id = new_id;
            record = forked;
        } else {
            record.status = ExecutionStatus::Running;
            record.error = None;
            record.completed_at = None;
            record.current_step = point;
            self.store.update_execution(&mut record).await?;
            tracing::info!(run_id = %run_id, resume_point = point, "resuming workflow run");
        }

        // The compensation log is in-memory; rebuild it from completed checkpoints.
        self.rollback.discard(record.run_id);
        for cp in checkpoints
            .iter()
            .filter(|c| c.step_index < point && c.status == StepStatus::Completed)
        {
            if let Some(step) = workflow.steps.get(cp.step_index).filter(|s| s.id == cp.step_id) {
                let output = cp.output.clone().unwrap_or(Value::Null);
                self.register_compensations(record.run_id, cp.step_index, step, &ctx, &output);
            }
        }

        self.emit(EngineEvent::RunStarted {
            run_id: record.run_id,
            workflow_id: workflow.id.clone(),
            trigger: options.trigger.clone(),
        });

        let state = RunState {
            record,
            ctx,
            step_results,
            failovers: Vec::new(),
        };
        self.drive(workflow, state, point, options.user.as_deref()).await
    }

    /// Trip a run's cancellation token. Returns `false` if the run is not
    /// executing in this process.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling workflow run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs left in `running` by a previous process, excluding those active here.
    pub async fn crashed_runs(&self) -> Result<Vec<ExecutionRecord>, EngineError> {
        let runs = self.store.list_crashed_executions().await?;
        Ok(runs.into_iter().filter(|r| !self.is_active(r.run_id)).collect())
    }

    pub async fn stats(&self, workflow_id: Option<&str>) -> Result<ExecutionStats, EngineError> {
        Ok(self.store.get_stats(workflow_id).await?)
    }

    /// Delete finished runs older than the configured retention.
    pub async fn cleanup(&self) -> Result<u64, EngineError> {
        Ok(self
            .store
            .cleanup_old_records(self.settings.retention_days)
            .await?)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        workflow: &Workflow,
        mut state: RunState,
        start: usize,
        user: Option<&str>,
    ) -> Result<WorkflowResult, EngineError> {
        let run_id = state.record.run_id;
        let token = CancellationToken::new();
        self.active.insert(run_id, token.clone());
        let _active = ActiveRun {
            active: &self.active,
            run_id,
        };

        let started = Instant::now();
        let outcome = match workflow.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, self.run_steps(workflow, &mut state, start, &token, user)).await {
                    Ok(res) => res,
                    Err(_) => Ok(Outcome::TimedOut(secs)),
                }
            }
            None => self.run_steps(workflow, &mut state, start, &token, user).await,
        };

        match outcome {
            Ok(outcome) => self.finish(workflow, state, outcome, started).await,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "workflow run aborted by engine fault");
                self.release_run(run_id);
                Err(e)
            }
        }
    }

    /// Drop the per-run compensation log and spend.
    fn release_run(&self, run_id: Uuid) {
        self.rollback.discard(run_id);
        self.router.budget().clear_run(run_id);
    }

    async fn run_steps(
        &self,
        workflow: &Workflow,
        state: &mut RunState,
        start: usize,
        token: &CancellationToken,
        user: Option<&str>,
    ) -> Result<Outcome, EngineError> {
        let run_id = state.record.run_id;

        for (index, step) in workflow.steps.iter().enumerate().skip(start) {
            if token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            state.ctx.current_step_index = index;
            state.record.current_step = index;
            self.store.update_execution(&mut state.record).await?;

            if let Some(condition) = &step.condition {
                if !condition_holds(condition, &state.ctx) {
                    tracing::debug!(run_id = %run_id, step_id = %step.id, "condition false, skipping step");
                    let now = Utc::now();
                    self.checkpoint(run_id, index, step, StepStatus::Skipped, None, None, 0, None, now)
                        .await?;
                    self.emit(EngineEvent::StepSkipped {
                        run_id,
                        step_id: step.id.clone(),
                    });
                    state.step_results.push(StepResult {
                        step_id: step.id.clone(),
                        step_index: index,
                        status: StepStatus::Skipped,
                        output: None,
                        error: None,
                        retry_count: 0,
                        agent: None,
                        duration_ms: 0,
                    });
                    continue;
                }
            }

            let step_started = Utc::now();
            let clock = Instant::now();
            let mut run = self.run_step(step, index, &state.ctx, token, user).await;
            state.failovers.append(&mut run.failovers);

            if matches!(run.error, Some(StepError::Cancelled)) {
                return Ok(Outcome::Cancelled);
            }

            let error_text = run.error.as_ref().map(ToString::to_string);
            self.checkpoint(
                run_id,
                index,
                step,
                run.status,
                run.output.clone(),
                error_text.clone(),
                run.retry_count,
                run.agent.clone(),
                step_started,
            )
            .await?;

            let duration_ms = clock.elapsed().as_millis() as u64;
            state.step_results.push(StepResult {
                step_id: step.id.clone(),
                step_index: index,
                status: run.status,
                output: run.output.clone(),
                error: error_text.clone(),
                retry_count: run.retry_count,
                agent: run.agent.clone(),
                duration_ms,
            });

            match run.status {
                StepStatus::Completed => {
                    let output = run.output.unwrap_or(Value::Null);
                    state.ctx.record_output(&step.id, step.output.as_deref(), output.clone());
                    self.register_compensations(run_id, index, step, &state.ctx, &output);
                    self.emit(EngineEvent::StepCompleted {
                        run_id,
                        step_id: step.id.clone(),
                        duration_ms,
                        retry_count: run.retry_count,
                    });
                }
                StepStatus::Skipped => {
                    self.emit(EngineEvent::StepSkipped {
                        run_id,
                        step_id: step.id.clone(),
                    });
                }
                _ => {
                    let error = error_text.unwrap_or_else(|| "step failed".to_string());
                    tracing::warn!(run_id = %run_id, step_id = %step.id, error = %error, "step failed");
                    self.emit(EngineEvent::StepFailed {
                        run_id,
                        step_id: step.id.clone(),
                        error: error.clone(),
                    });

                    match workflow.error_handling_for(step) {
                        ErrorHandling::Continue => {}
                        ErrorHandling::Stop => {
                            return Ok(Outcome::Aborted {
                                error: format!("step '{}' failed: {error}", step.id),
                                rollback: false,
                            });
                        }
                        ErrorHandling::Rollback => {
                            return Ok(Outcome::Aborted {
                                error: format!("step '{}' failed: {error}", step.id),
                                rollback: true,
                            });
                        }
                    }
                }
            }

            state.record.outputs = Value::Object(state.ctx.variables.clone());
        }

        Ok(Outcome::Finished)
    }

    async fn finish(
        &self,
        workflow: &Workflow,
        mut state: RunState,
        outcome: Outcome,
        started: Instant,
    ) -> Result<WorkflowResult, EngineError> {
        let run_id = state.record.run_id;

        let (status, error, roll_back) = match outcome {
            Outcome::Finished => {
                let failed: Vec<&str> = state
                    .step_results
                    .iter()
                    .filter(|r| r.status == StepStatus::Failed)
                    .map(|r| r.step_id.as_str())
                    .collect();
                if failed.is_empty() {
                    (ExecutionStatus::Completed, None, false)
                } else {
                    (
                        ExecutionStatus::Failed,
                        Some(format!("steps failed: {}", failed.join(", "))),
                        false,
                    )
                }
            }
            Outcome::Aborted { error, rollback } => (ExecutionStatus::Failed, Some(error), rollback),
            Outcome::Cancelled => (ExecutionStatus::Cancelled, None, false),
            Outcome::TimedOut(secs) => (
                ExecutionStatus::Failed,
                Some(format!("workflow timed out after {secs}s")),
                workflow.error_handling == ErrorHandling::Rollback,
            ),
        };

        let rollback = if roll_back {
            let report = self.rollback.rollback(run_id).await;
            self.emit(EngineEvent::RollbackCompleted {
                run_id,
                status: report.status,
                compensated: report.compensated.len(),
                failed: report.failures.len(),
            });
            Some(report)
        } else {
            self.rollback.discard(run_id);
            None
        };

        self.router.budget().clear_run(run_id);

        state.record.status = status;
        state.record.error = error.clone();
        state.record.outputs = Value::Object(state.ctx.variables.clone());
        state.record.completed_at = Some(Utc::now());
        self.store.update_execution(&mut state.record).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        match status {
            ExecutionStatus::Completed => {
                let steps_completed = state
                    .step_results
                    .iter()
                    .filter(|r| r.status == StepStatus::Completed)
                    .count() as u32;
                tracing::info!(run_id = %run_id, duration_ms, steps_completed, "workflow run completed");
                self.emit(EngineEvent::RunCompleted {
                    run_id,
                    workflow_id: workflow.id.clone(),
                    duration_ms,
                    steps_completed,
                });
            }
            ExecutionStatus::Cancelled => {
                tracing::info!(run_id = %run_id, "workflow run cancelled");
                self.emit(EngineEvent::RunCancelled {
                    run_id,
                    workflow_id: workflow.id.clone(),
                });
            }
            _ => {
                let message = error.clone().unwrap_or_default();
                tracing::warn!(run_id = %run_id, error = %message, "workflow run failed");
                self.emit(EngineEvent::RunFailed {
                    run_id,
                    workflow_id: workflow.id.clone(),
                    error: message,
                });
            }
        }

        Ok(WorkflowResult {
            run_id,
            workflow_id: workflow.id.clone(),
            status,
            error,
            step_results: state.step_results,
            outputs: Value::Object(state.ctx.variables),
            rollback,
            failovers: state.failovers,
        })
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    async fn run_step(
        &self,
        step: &WorkflowStep,
        index: usize,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        user: Option<&str>,
    ) -> StepRun {
        let run_id = ctx.run_id;
        let failed = |error: StepError, retry_count: u32, agent: Option<String>| StepRun {
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            retry_count,
            agent,
            failovers: Vec::new(),
        };

        if let (Some(checker), Some(user)) = (&self.permissions, user) {
            if let Err(denied) = checker.require_permission(user, &step.action.to_string()) {
                return failed(StepError::PermissionDenied(denied.to_string()), 0, None);
            }
        }

        let target = match self.resolve_target(run_id, step) {
            Ok(t) => t,
            Err(e) => return failed(e, 0, step.agent.as_ref().and_then(|a| a.preferred.clone())),
        };
        let mut agent = match &target {
            Target::Agent { name, .. } => Some(name.clone()),
            Target::Tool { .. } => None,
        };

        self.emit(EngineEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            step_index: index,
            agent: agent.clone(),
        });

        let inputs = ctx.resolve_map(&step.inputs);
        let policy = step.retry.clone().unwrap_or_else(RetryPolicy::none);
        let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(self.settings.step_timeout_ms));

        let mut retries = 0u32;
        let last_error = loop {
            match self.dispatch(&target, step, &inputs, ctx, token, timeout).await {
                Ok(done) => return success(done, retries, agent),
                Err(StepError::Cancelled) => return failed(StepError::Cancelled, retries, agent),
                Err(e) if RetryHandler::should_retry(&policy, retries, &e) => {
                    retries += 1;
                    let delay = RetryHandler::delay_for(&policy, retries);
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "step failed, retrying"
                    );
                    self.emit(EngineEvent::StepRetrying {
                        run_id,
                        step_id: step.id.clone(),
                        attempt: retries,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = token.cancelled() => return failed(StepError::Cancelled, retries, agent),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break e,
            }
        };

        // Failover applies to agent tasks only.
        let Target::Agent { name: first_agent, .. } = &target else {
            return failed(last_error, retries, agent);
        };
        let Some(config) = step.failover.as_ref().filter(|f| f.enabled) else {
            return failed(last_error, retries, agent);
        };
        if !last_error.allows_failover() {
            return failed(last_error, retries, agent);
        }

        let mut tried = vec![first_agent.clone()];
        let mut failovers = Vec::new();
        let mut last_error = last_error;

        for _ in 0..config.max_failovers {
            let Some((next, adapter)) = self.failover_agent(run_id, step, &tried, &config.fallback_agents)
            else {
                break;
            };
            let from = tried.last().cloned().unwrap_or_default();
            tracing::warn!(
                run_id = %run_id,
                step_id = %step.id,
                from_agent = %from,
                to_agent = %next,
                reason = %last_error,
                "failing over step"
            );
            let event = FailoverEvent {
                run_id,
                step_id: step.id.clone(),
                from_agent: from.clone(),
                to_agent: next.clone(),
                reason: last_error.to_string(),
                at: Utc::now(),
            };
            self.emit(EngineEvent::Failover {
                run_id,
                step_id: step.id.clone(),
                from_agent: from,
                to_agent: next.clone(),
                reason: last_error.to_string(),
            });
            failovers.push(event);
            tried.push(next.clone());
            agent = Some(next.clone());

            let replacement = Target::Agent {
                name: next,
                adapter,
            };
            match self.dispatch(&replacement, step, &inputs, ctx, token, timeout).await {
                Ok(done) => {
                    let mut run = success(done, retries, agent);
                    run.failovers = failovers;
                    return run;
                }
                Err(StepError::Cancelled) => {
                    let mut run = failed(StepError::Cancelled, retries, agent);
                    run.failovers = failovers;
                    return run;
                }
                Err(e) => last_error = e,
            }
        }

        let mut run = failed(last_error, retries, agent);
        run.failovers = failovers;
        run
    }

    /// One attempt against one target, bounded by the step timeout and the
    /// run's cancellation token.
    async fn dispatch(
        &self,
        target: &Target,
        step: &WorkflowStep,
        inputs: &Map<String, Value>,
        ctx: &ExecutionContext,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Dispatched, StepError> {
        let timeout_ms = timeout.as_millis() as u64;

        match target {
            Target::Tool { tool, op } => match bounded(token, timeout, tool.execute(op, inputs)).await {
                Bounded::Done(Ok(output)) => Ok(Dispatched {
                    output,
                    skipped: false,
                }),
                Bounded::Done(Err(e)) => Err(e.into()),
                Bounded::TimedOut => Err(StepError::Timeout(timeout_ms)),
                Bounded::Cancelled => Err(StepError::Cancelled),
            },
            Target::Agent { name, adapter } => {
                if !self.breakers.try_acquire(name) {
                    return Err(StepError::CircuitOpen(name.clone()));
                }
                let flight = InFlight::begin(&self.router, &self.breakers, name);

                match bounded(token, timeout, adapter.execute_step(step, inputs, ctx)).await {
                    Bounded::Done(Ok(result)) => match result.status {
                        StepStatus::Completed | StepStatus::Skipped => {
                            flight.success();
                            self.router.budget().record_spend(ctx.run_id, name, result.cost);
                            Ok(Dispatched {
                                output: result.output,
                                skipped: result.status == StepStatus::Skipped,
                            })
                        }
                        _ => {
                            let error = result
                                .error
                                .unwrap_or_else(|| format!("agent '{name}' reported failure"));
                            flight.failure(&error);
                            Err(StepError::Execution(error))
                        }
                    },
                    Bounded::Done(Err(e)) => {
                        let err: StepError = e.into();
                        if matches!(err, StepError::Execution(_)) {
                            flight.failure(&err.to_string());
                        }
                        Err(err)
                    }
                    Bounded::TimedOut => {
                        flight.failure("timeout");
                        Err(StepError::Timeout(timeout_ms))
                    }
                    Bounded::Cancelled => Err(StepError::Cancelled),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Target selection
    // -----------------------------------------------------------------------

    fn resolve_target(&self, run_id: Uuid, step: &WorkflowStep) -> Result<Target, StepError> {
        match &step.action {
            StepAction::ToolCall { tool, op } => {
                let agent = step.agent.as_ref().and_then(|a| a.preferred.as_deref());
                let tool = self
                    .tools
                    .get_tool(tool, agent)
                    .ok_or_else(|| StepError::UnknownTarget(tool.clone()))?;
                Ok(Target::Tool {
                    tool,
                    op: op.clone(),
                })
            }
            StepAction::AgentTask { .. } => {
                let hints = step.agent.clone().unwrap_or_default();
                let blocked: Vec<String> = self
                    .breakers
                    .blocked_agents()
                    .into_iter()
                    .filter(|a| hints.preferred.as_ref() != Some(a))
                    .collect();
                let routing = RoutingContext {
                    run_id: Some(run_id),
                    step_id: step.id.clone(),
                    required_capabilities: hints.capabilities,
                    preferred_agent: hints.preferred,
                    exclude: blocked.clone(),
                };

                let names = match self.candidates(&routing, None) {
                    Ok(names) => names,
                    Err(RoutingError::NoCapableAgent { .. }) if !blocked.is_empty() => {
                        return Err(StepError::CircuitOpen(blocked.join(", ")));
                    }
                    Err(e) => return Err(routing_error(e)),
                };
                let (name, adapter) = self
                    .first_registered(&names)
                    .ok_or_else(|| StepError::NoAgent(format!("no adapter registered for step '{}'", step.id)))?;
                Ok(Target::Agent { name, adapter })
            }
        }
    }

    fn failover_agent(
        &self,
        run_id: Uuid,
        step: &WorkflowStep,
        tried: &[String],
        fallback_agents: &[String],
    ) -> Option<(String, Arc<BoxAgentAdapter>)> {
        let hints = step.agent.clone().unwrap_or_default();
        let mut exclude = tried.to_vec();
        exclude.extend(self.breakers.blocked_agents());
        let routing = RoutingContext {
            run_id: Some(run_id),
            step_id: step.id.clone(),
            required_capabilities: hints.capabilities,
            preferred_agent: None,
            exclude,
        };
        match self.candidates(&routing, Some(fallback_agents)) {
            Ok(names) => self.first_registered(&names),
            Err(e) => {
                tracing::debug!(run_id = %run_id, step_id = %step.id, error = %e, "no failover candidate");
                None
            }
        }
    }

    /// Ranked agent names for a routing request.
    ///
    /// Without any configured profiles the registered adapters are used
    /// directly (fallback list first when given, preferred agent first),
    /// and a run or period whose budget is spent gets no candidate.
    fn candidates(
        &self,
        routing: &RoutingContext,
        fallback_agents: Option<&[String]>,
    ) -> Result<Vec<String>, RoutingError> {
        if !self.router.profiles().is_empty() {
            let result = match fallback_agents {
                Some(list) => self.router.select_failover(routing, list),
                None => self.router.select(routing),
            }?;
            return Ok(result.candidates.into_iter().map(|c| c.agent).collect());
        }

        let pool: Vec<String> = match fallback_agents {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => self.agents.names().into_iter().map(String::from).collect(),
        };
        let mut names: Vec<String> = pool
            .into_iter()
            .filter(|n| !routing.exclude.contains(n))
            .collect();
        if !names.is_empty() && !self.router.budget().has_headroom(routing.run_id) {
            return Err(RoutingError::BudgetExceeded {
                step_id: routing.step_id.clone(),
            });
        }
        if let Some(preferred) = &routing.preferred_agent {
            if let Some(pos) = names.iter().position(|n| n == preferred) {
                let chosen = names.remove(pos);
                names.insert(0, chosen);
            }
        }
        if names.is_empty() {
            return Err(RoutingError::NoCapableAgent {
                step_id: routing.step_id.clone(),
                required: routing.required_capabilities.clone(),
            });
        }
        Ok(names)
    }

    fn first_registered(&self, names: &[String]) -> Option<(String, Arc<BoxAgentAdapter>)> {
        names
            .iter()
            .find_map(|n| self.agents.get(n).map(|a| (n.clone(), a)))
    }

    // -----------------------------------------------------------------------
    // Persistence, compensation, events
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn checkpoint(
        &self,
        run_id: Uuid,
        step_index: usize,
        step: &WorkflowStep,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
        retry_count: u32,
        agent: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let checkpoint = StepCheckpoint {
            run_id,
            step_index,
            step_id: step.id.clone(),
            status,
            agent,
            started_at,
            completed_at: Some(Utc::now()),
            output,
            error,
            retry_count,
        };
        self.store.save_checkpoint(&checkpoint).await?;
        Ok(())
    }

    /// Register the step's declared compensation and any `rollback` entries
    /// in its output.
    fn register_compensations(
        &self,
        run_id: Uuid,
        step_index: usize,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
        output: &Value,
    ) {
        if let Some(spec) = &step.compensation {
            self.rollback.register(RollbackAction {
                run_id,
                step_id: step.id.clone(),
                step_index,
                resource: spec.resource.clone(),
                compensating_op: spec.op.clone(),
                params: ctx.resolve_map(&spec.params),
                registered_at: Utc::now(),
            });
        }

        let Some(entries) = output.get("rollback").and_then(Value::as_array) else {
            return;
        };
        for entry in entries {
            let resource = entry.get("resource").and_then(Value::as_str);
            let op = entry.get("op").and_then(Value::as_str);
            let (Some(resource), Some(op)) = (resource, op) else {
                tracing::warn!(run_id = %run_id, step_id = %step.id, "ignoring malformed rollback entry");
                continue;
            };
            self.rollback.register(RollbackAction {
                run_id,
                step_id: step.id.clone(),
                step_index,
                resource: resource.to_string(),
                compensating_op: op.to_string(),
                params: entry
                    .get("params")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                registered_at: Utc::now(),
            });
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(audit) = &self.audit {
            if event.is_audited() {
                audit.record(&event);
            }
        }
        self.events.publish(event);
    }

    /// Undo a run's registered compensations outside of the step loop.
    pub async fn rollback_run(&self, run_id: Uuid) -> RollbackReport {
        let report = self.rollback.rollback(run_id).await;
        self.emit(EngineEvent::RollbackCompleted {
            run_id,
            status: report.status,
            compensated: report.compensated.len(),
            failed: report.failures.len(),
        });
        report
    }
}

/// Evaluated synchronously; the evaluator is never held across an await.
fn condition_holds(expression: &str, ctx: &ExecutionContext) -> bool {
    ConditionEvaluator::new().condition_holds(expression, ctx)
}

fn success(done: Dispatched, retry_count: u32, agent: Option<String>) -> StepRun {
    StepRun {
        status: if done.skipped {
            StepStatus::Skipped
        } else {
            StepStatus::Completed
        },
        output: Some(done.output),
        error: None,
        retry_count,
        agent,
        failovers: Vec::new(),
    }
}

fn routing_error(e: RoutingError) -> StepError {
    match e {
        RoutingError::BudgetExceeded { step_id } => StepError::BudgetExceeded(step_id),
        other => StepError::NoAgent(other.to_string()),
    }
}

fn duration_ms(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> u64 {
    end.map(|e| (e - start).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
