//! Agent routing types for Conductor.
//!
//! `AgentProfile` is the static capability/cost descriptor the router
//! filters and scores; `RoutingContext` is what a step asks for and
//! `RoutingResult` the ranked answer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static description of an agent backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Estimated cost of one call, in budget units.
    #[serde(default)]
    pub cost_per_call: f64,
    /// Quality score in `0.0..=1.0`.
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_quality() -> f64 {
    0.5
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_enabled() -> bool {
    true
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            cost_per_call: 0.0,
            quality: default_quality(),
            max_concurrent: default_max_concurrent(),
            enabled: true,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    /// True when every required capability is advertised.
    pub fn supports(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Strategy used to rank capable agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LowestCost,
    HighestQuality,
    #[default]
    Weighted,
}

/// Weights for the composite strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
    #[serde(default = "default_quality_weight")]
    pub quality: f64,
    #[serde(default = "default_load_weight")]
    pub load: f64,
}

fn default_cost_weight() -> f64 {
    0.3
}

fn default_quality_weight() -> f64 {
    0.5
}

fn default_load_weight() -> f64 {
    0.2
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            cost: default_cost_weight(),
            quality: default_quality_weight(),
            load: default_load_weight(),
        }
    }
}

/// What a step asks the router for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    pub run_id: Option<Uuid>,
    pub step_id: String,
    pub required_capabilities: Vec<String>,
    pub preferred_agent: Option<String>,
    /// Agents that must not be chosen (open breakers, the agent that just failed).
    pub exclude: Vec<String>,
}

/// A scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScore {
    pub agent: String,
    pub score: f64,
    pub cost: f64,
}

/// Ranked candidates, best first. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub strategy: SelectionStrategy,
    pub candidates: Vec<AgentScore>,
}

impl RoutingResult {
    pub fn best(&self) -> Option<&AgentScore> {
        self.candidates.first()
    }
}

/// Spend ceilings enforced by the budget tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Max spend for a single run.
    #[serde(default)]
    pub per_run_limit: Option<f64>,
    /// Max spend across all runs within one period.
    #[serde(default)]
    pub per_period_limit: Option<f64>,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

fn default_period_secs() -> u64 {
    86_400
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_run_limit: None,
            per_period_limit: None,
            period_secs: default_period_secs(),
        }
    }
}

/// In-flight dispatch counts per agent, used by the weighted strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub in_flight: HashMap<String, u32>,
}

impl LoadInfo {
    pub fn get(&self, agent: &str) -> u32 {
        self.in_flight.get(agent).copied().unwrap_or(0)
    }
}

/// Emitted when a step moves from one agent to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub run_id: Uuid,
    pub step_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}
