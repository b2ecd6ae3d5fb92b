//! Cron scheduler for workflow jobs.
//!
//! Provides:
//! - Job registry keyed by job id (add, remove, enable, disable, inspect)
//! - A wake loop that sleeps until the earliest due job and fires it
//! - Completion callbacks, invoked in registration order after each run
//! - Missed-run detection for catch-up reporting on restart
//!
//! Firing never blocks the loop: each run is spawned as its own task.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::config::JobConfig;
use conductor_types::execution::{ExecutionOptions, ExecutionStatus, WorkflowResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::repository::execution::ExecutionRepository;

use super::cron::{CronError, CronExpr, ScheduleTz};
use super::definition::{load_workflow, WorkflowParser};
use super::engine::WorkflowEngine;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or timezone.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] CronError),

    /// A job with this id is already registered.
    #[error("job '{0}' already exists")]
    DuplicateJob(String),

    /// No job registered under this id.
    #[error("job '{0}' not found")]
    JobNotFound(String),
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Outcome handed to completion callbacks. Load and engine errors are
/// carried as their display text.
pub type JobOutcome = Result<WorkflowResult, String>;

/// Callback invoked after a job's run finishes.
pub type JobCallback = Arc<dyn Fn(String, JobOutcome) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered job and its bookkeeping.
#[derive(Debug, Clone)]
struct ScheduledJob {
    workflow_path: PathBuf,
    expr: CronExpr,
    timezone: Option<String>,
    tz: ScheduleTz,
    enabled: bool,
    inputs: Map<String, Value>,
    run_count: u64,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    last_status: Option<ExecutionStatus>,
    last_error: Option<String>,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub workflow_path: PathBuf,
    pub schedule: String,
    pub timezone: Option<String>,
    pub enabled: bool,
    pub run_count: u64,
    /// `None` while the job is disabled.
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    fn info(&self, id: &str) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            workflow_path: self.workflow_path.clone(),
            schedule: self.expr.as_str().to_string(),
            timezone: self.timezone.clone(),
            enabled: self.enabled,
            run_count: self.run_count,
            next_run: self.next_run.filter(|_| self.enabled),
            last_run: self.last_run,
            last_status: self.last_status,
            last_error: self.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fires workflow jobs through a shared `WorkflowEngine`.
///
/// Cheap to clone; clones share jobs, callbacks and the shutdown token.
pub struct Scheduler<R: ExecutionRepository + 'static> {
    engine: Arc<WorkflowEngine<R>>,
    parser: Arc<dyn WorkflowParser>,
    jobs: Arc<DashMap<String, ScheduledJob>>,
    callbacks: Arc<RwLock<Vec<JobCallback>>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    max_idle_sleep: Duration,
}

impl<R: ExecutionRepository + 'static> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            parser: self.parser.clone(),
            jobs: self.jobs.clone(),
            callbacks: self.callbacks.clone(),
            wake: self.wake.clone(),
            shutdown: self.shutdown.clone(),
            max_idle_sleep: self.max_idle_sleep,
        }
    }
}

impl<R: ExecutionRepository + 'static> Scheduler<R> {
    /// The idle sleep bound comes from the engine's `max_idle_sleep_secs`.
    pub fn new(engine: Arc<WorkflowEngine<R>>, parser: Arc<dyn WorkflowParser>) -> Self {
        let max_idle_sleep = Duration::from_secs(engine.settings().max_idle_sleep_secs);
        Self {
            engine,
            parser,
            jobs: Arc::new(DashMap::new()),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            max_idle_sleep,
        }
    }

    /// Upper bound on a single sleep of the wake loop.
    pub fn with_max_idle_sleep(mut self, max: Duration) -> Self {
        self.max_idle_sleep = max;
        self
    }

    /// Register a job. The schedule and timezone are validated here.
    pub fn add_job(&self, config: JobConfig) -> Result<(), SchedulerError> {
        let expr = CronExpr::parse(&config.schedule)?;
        let tz = ScheduleTz::parse(config.timezone.as_deref())?;

        let entry = match self.jobs.entry(config.id.clone()) {
            Entry::Occupied(_) => return Err(SchedulerError::DuplicateJob(config.id)),
            Entry::Vacant(entry) => entry,
        };
        let next_run = expr.next_run(Utc::now(), tz);
        entry.insert(ScheduledJob {
            workflow_path: PathBuf::from(&config.workflow_path),
            expr,
            timezone: config.timezone,
            tz,
            enabled: config.enabled,
            inputs: config.inputs,
            run_count: 0,
            next_run,
            last_run: None,
            last_status: None,
            last_error: None,
        });

        tracing::info!(job_id = %config.id, next_run = ?next_run, "job scheduled");
        self.wake.notify_one();
        Ok(())
    }

    /// Register every job from the config file. Stops at the first invalid job.
    pub fn add_jobs(&self, configs: &[JobConfig]) -> Result<(), SchedulerError> {
        configs.iter().try_for_each(|c| self.add_job(c.clone()))
    }

    pub fn remove_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.jobs
            .remove(job_id)
            .map(|_| tracing::info!(job_id, "job removed"))
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    pub fn enable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(job_id, true)
    }

    pub fn disable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(job_id, false)
    }

    fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        job.enabled = enabled;
        if enabled {
            job.next_run = job.expr.next_run(Utc::now(), job.tz);
        }
        drop(job);
        tracing::info!(job_id, enabled, "job toggled");
        self.wake.notify_one();
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.get(job_id).map(|job| job.info(job_id))
    }

    /// All jobs, ordered by id.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|j| j.info(j.key())).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Add a completion callback. Callbacks run in registration order.
    pub fn on_complete(&self, callback: JobCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    /// Occurrences of `job_id`'s schedule in `(since, now)`.
    pub fn missed_runs(
        &self,
        job_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        let missed = job.expr.missed_runs(since, Utc::now(), job.tz);
        if !missed.is_empty() {
            tracing::warn!(job_id, count = missed.len(), "detected missed cron runs");
        }
        Ok(missed)
    }

    /// Fire a job immediately with trigger `manual`, enabled or not.
    pub fn run_job_now(&self, job_id: &str) -> Result<JoinHandle<()>, SchedulerError> {
        self.fire(job_id, "manual")
    }

    // -----------------------------------------------------------------------
    // Wake loop
    // -----------------------------------------------------------------------

    /// Spawn the wake loop. It runs until `shutdown` is called.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the wake loop. Runs already spawned keep going.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn run(&self) {
        tracing::info!(jobs = self.jobs.len(), "scheduler started");
        loop {
            let now = Utc::now();
            for job_id in self.due_jobs(now) {
                if let Err(e) = self.fire(&job_id, "cron") {
                    tracing::warn!(job_id = %job_id, error = %e, "failed to fire job");
                }
            }

            let sleep = self.sleep_until_next(Utc::now());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Enabled jobs whose next_run has passed.
    ///
    /// Every enabled job's next_run is then recomputed from `now`, so a late
    /// wake fires once instead of replaying and a clock step never leaves a
    /// stale fire time behind.
    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for mut job in self.jobs.iter_mut() {
            if !job.enabled {
                continue;
            }
            if job.next_run.is_some_and(|t| t <= now) {
                due.push(job.key().clone());
            }
            job.next_run = job.expr.next_run(now, job.tz);
        }
        due.sort();
        due
    }

    fn sleep_until_next(&self, now: DateTime<Utc>) -> Duration {
        let earliest = self
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.next_run)
            .min();
        match earliest {
            Some(t) => (t - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_idle_sleep),
            None => self.max_idle_sleep,
        }
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    fn fire(&self, job_id: &str, trigger: &str) -> Result<JoinHandle<()>, SchedulerError> {
        let (path, inputs) = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            job.run_count += 1;
            job.last_run = Some(Utc::now());
            (job.workflow_path.clone(), job.inputs.clone())
        };

        tracing::debug!(job_id, trigger, path = %path.display(), "firing job");

        let scheduler = self.clone();
        let job_id = job_id.to_string();
        let options = ExecutionOptions::with_trigger(trigger);

        Ok(tokio::spawn(async move {
            let outcome = match load_workflow(scheduler.parser.as_ref(), &path).await {
                Ok(workflow) => scheduler
                    .engine
                    .execute(&workflow, Value::Object(inputs), options)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            scheduler.complete(job_id, outcome).await;
        }))
    }

    async fn complete(&self, job_id: String, outcome: JobOutcome) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            match &outcome {
                Ok(result) => {
                    job.last_status = Some(result.status);
                    job.last_error = result.error.clone();
                }
                Err(e) => {
                    job.last_status = None;
                    job.last_error = Some(e.clone());
                }
            }
        }

        match &outcome {
            Ok(result) => tracing::info!(
                job_id = %job_id,
                run_id = %result.run_id,
                status = %result.status,
                "job run finished"
            ),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "job run failed to start"),
        }

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for callback in callbacks {
            callback(job_id.clone(), outcome.clone()).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryExecutionRepository;
    use crate::routing::{AgentRouter, BudgetTracker};
    use crate::workflow::definition::YamlWorkflowParser;
    use crate::workflow::dispatch::{AgentRegistry, DispatchError, Tool, ToolRegistry};
    use conductor_types::agent::BudgetConfig;
    use conductor_types::config::RouterConfig;
    use std::sync::Mutex;

    struct Echo;

    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _op: &str, params: &Map<String, Value>) -> Result<Value, DispatchError> {
            Ok(Value::Object(params.clone()))
        }
    }

    fn scheduler() -> Scheduler<InMemoryExecutionRepository> {
        let mut tools = ToolRegistry::new();
        tools.register(Echo);
        let router = AgentRouter::new(
            Vec::new(),
            RouterConfig::default(),
            BudgetTracker::new(BudgetConfig::default()),
        );
        let engine = WorkflowEngine::new(
            InMemoryExecutionRepository::new(),
            Arc::new(tools),
            Arc::new(AgentRegistry::new()),
            Arc::new(router),
        );
        Scheduler::new(Arc::new(engine), Arc::new(YamlWorkflowParser))
    }

    fn job(id: &str, path: &str, schedule: &str) -> JobConfig {
        JobConfig {
            id: id.to_string(),
            workflow_path: path.to_string(),
            schedule: schedule.to_string(),
            timezone: None,
            enabled: true,
            inputs: Map::new(),
        }
    }

    // -------------------------------------------------------------------
    // Job management
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn add_job_validates_eagerly() {
        let s = scheduler();
        s.add_job(job("nightly", "wf.yaml", "0 2 * * *")).unwrap();

        let err = s.add_job(job("nightly", "wf.yaml", "0 3 * * *")).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob(_)));

        let err = s.add_job(job("bad", "wf.yaml", "61 * * * *")).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

        let mut tz = job("tz", "wf.yaml", "@daily");
        tz.timezone = Some("Mars/Olympus".to_string());
        assert!(matches!(s.add_job(tz).unwrap_err(), SchedulerError::InvalidSchedule(_)));

        assert_eq!(s.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn disable_keeps_job_but_hides_next_run() {
        let s = scheduler();
        s.add_job(job("b", "b.yaml", "every 5 minutes")).unwrap();
        s.add_job(job("a", "a.yaml", "@hourly")).unwrap();

        let before = s.get_job("a").unwrap();
        assert!(before.next_run.unwrap() > Utc::now());

        s.disable_job("a").unwrap();
        let disabled = s.get_job("a").unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.next_run.is_none());

        s.enable_job("a").unwrap();
        assert!(s.get_job("a").unwrap().next_run.is_some());

        let ids: Vec<String> = s.list_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        s.remove_job("a").unwrap();
        assert!(matches!(s.remove_job("a").unwrap_err(), SchedulerError::JobNotFound(_)));
        assert!(matches!(s.enable_job("zzz").unwrap_err(), SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn missed_runs_lists_hourly_gaps() {
        let s = scheduler();
        s.add_job(job("hourly", "wf.yaml", "0 * * * *")).unwrap();
        let since = Utc::now() - chrono::Duration::hours(3);
        let missed = s.missed_runs("hourly", since).unwrap();
        assert!((2..=3).contains(&missed.len()));
    }

    // -------------------------------------------------------------------
    // Firing
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn run_job_now_executes_and_invokes_callbacks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greet.yaml");
        std::fs::write(
            &path,
            "name: greet\nsteps:\n  - id: say\n    action: echo.say\n    inputs: { who: \"{{ who }}\" }\n    output: said\n",
        )
        .unwrap();

        let s = scheduler();
        let mut config = job("greet", path.to_str().unwrap(), "@daily");
        config.inputs.insert("who".to_string(), Value::String("ops".to_string()));
        s.add_job(config).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            s.on_complete(Arc::new(move |job_id: String, outcome: JobOutcome| -> BoxFuture<'static, ()> {
                let seen = seen.clone();
                Box::pin(async move {
                    let status = outcome.map(|r| r.outputs["said"]["who"].clone());
                    seen.lock().unwrap().push((tag, job_id, status));
                })
            }));
        }

        s.run_job_now("greet").unwrap().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "first");
        assert_eq!(seen[1].0, "second");
        assert_eq!(seen[0].1, "greet");
        assert_eq!(seen[0].2, Ok(Value::String("ops".to_string())));

        let info = s.get_job("greet").unwrap();
        assert_eq!(info.run_count, 1);
        assert!(info.last_run.is_some());
        assert_eq!(info.last_status, Some(ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn missing_workflow_file_reports_error() {
        let s = scheduler();
        s.add_job(job("ghost", "/nonexistent/ghost.yaml", "@daily")).unwrap();

        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        s.on_complete(Arc::new(move |_: String, outcome: JobOutcome| -> BoxFuture<'static, ()> {
            let slot = slot.clone();
            Box::pin(async move {
                *slot.lock().unwrap() = Some(outcome.is_err());
            })
        }));

        s.run_job_now("ghost").unwrap().await.unwrap();

        assert_eq!(*got.lock().unwrap(), Some(true));
        let info = s.get_job("ghost").unwrap();
        assert!(info.last_status.is_none());
        assert!(info.last_error.is_some());
        assert!(matches!(s.run_job_now("nope").unwrap_err(), SchedulerError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn due_jobs_advance_and_skip_disabled() {
        let s = scheduler();
        s.add_job(job("on", "a.yaml", "* * * * *")).unwrap();
        s.add_job(job("off", "b.yaml", "* * * * *")).unwrap();
        s.disable_job("off").unwrap();

        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(s.due_jobs(later), vec!["on".to_string()]);
        // next_run recomputed from `later`, so nothing is due at the same instant.
        assert!(s.due_jobs(later).is_empty());
    }

    #[tokio::test]
    async fn wake_recomputes_next_run_of_pending_jobs() {
        let s = scheduler();
        s.add_job(job("hourly", "a.yaml", "0 * * * *")).unwrap();

        // A clock step left the stored fire time a day out.
        let now = Utc::now();
        let stale = now + chrono::Duration::days(1);
        s.jobs.get_mut("hourly").unwrap().next_run = Some(stale);

        assert!(s.due_jobs(now).is_empty());
        let next = s.get_job("hourly").unwrap().next_run.unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn wake_loop_stops_on_shutdown() {
        let s = scheduler().with_max_idle_sleep(Duration::from_millis(20));
        let handle = s.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop")
            .unwrap();
        assert!(s.is_shut_down());
    }
}
