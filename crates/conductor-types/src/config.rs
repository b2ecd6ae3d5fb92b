//! Engine configuration types for Conductor.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls step
//! timeouts, circuit breaking, budgets, routing, agent profiles and
//! scheduled jobs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::{AgentProfile, BudgetConfig, SelectionStrategy, StrategyWeights};

/// Top-level configuration for the runtime.
///
/// Loaded from `~/.conductor/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-dispatch timeout used when a step does not set one.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Age after which finished runs are removed by cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Upper bound on the scheduler's sleep between wakes.
    #[serde(default = "default_max_idle_sleep_secs")]
    pub max_idle_sleep_secs: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_idle_sleep_secs() -> u64 {
    60
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            retention_days: default_retention_days(),
            max_idle_sleep_secs: default_max_idle_sleep_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// `[circuit_breaker]` section. Durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within `window_ms`) that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Initial cool-down once open.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Applied to the cool-down each time a half-open trial fails.
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown_ms() -> u64 {
    900_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

/// `[router]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub weights: StrategyWeights,
}

/// A `[[jobs]]` entry: a workflow file fired on a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub workflow_path: String,
    pub schedule: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_job_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

fn default_job_enabled() -> bool {
    true
}
