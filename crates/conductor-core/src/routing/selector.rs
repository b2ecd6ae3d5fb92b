//! Agent selection.
//!
//! `AgentRouter` holds the static `AgentProfile`s, filters them by
//! capability and budget headroom, then ranks the survivors with the
//! configured `SelectionStrategy`. Ties keep declaration order.

use std::sync::atomic::{AtomicUsize, Ordering};

use conductor_types::agent::{
    AgentProfile, AgentScore, LoadInfo, RoutingContext, RoutingResult, SelectionStrategy,
    StrategyWeights,
};
use conductor_types::config::RouterConfig;
use dashmap::DashMap;

use super::budget::BudgetTracker;
use super::RoutingError;

/// Multi-criteria agent selector shared by all runs.
#[derive(Debug)]
pub struct AgentRouter {
    profiles: Vec<AgentProfile>,
    strategy: SelectionStrategy,
    weights: StrategyWeights,
    budget: BudgetTracker,
    in_flight: DashMap<String, u32>,
    rr_cursor: AtomicUsize,
}

impl AgentRouter {
    pub fn new(profiles: Vec<AgentProfile>, config: RouterConfig, budget: BudgetTracker) -> Self {
        Self {
            profiles,
            strategy: config.strategy,
            weights: config.weights,
            budget,
            in_flight: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    // -----------------------------------------------------------------------
    // Load tracking
    // -----------------------------------------------------------------------

    /// Mark a dispatch to `agent` as started.
    pub fn begin_dispatch(&self, agent: &str) {
        *self.in_flight.entry(agent.to_string()).or_insert(0) += 1;
    }

    /// Mark a dispatch to `agent` as finished.
    pub fn end_dispatch(&self, agent: &str) {
        if let Some(mut count) = self.in_flight.get_mut(agent) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current in-flight counts.
    pub fn load(&self) -> LoadInfo {
        LoadInfo {
            in_flight: self
                .in_flight
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Rank every enabled, capable, affordable agent for `ctx`.
    pub fn select(&self, ctx: &RoutingContext) -> Result<RoutingResult, RoutingError> {
        self.rank(ctx, None)
    }

    /// Pick a replacement agent after a failure.
    ///
    /// With a non-empty `fallback_agents` list only those agents are
    /// considered, in list order. Otherwise this is `select`.
    pub fn select_failover(
        &self,
        ctx: &RoutingContext,
        fallback_agents: &[String],
    ) -> Result<RoutingResult, RoutingError> {
        if fallback_agents.is_empty() {
            return self.rank(ctx, None);
        }
        self.rank(ctx, Some(fallback_agents))
    }

    fn rank(
        &self,
        ctx: &RoutingContext,
        only: Option<&[String]>,
    ) -> Result<RoutingResult, RoutingError> {
        let pool: Vec<&AgentProfile> = match only {
            Some(names) => names
                .iter()
                .filter_map(|n| self.profile(n))
                .collect(),
            None => self.profiles.iter().collect(),
        };

        let capable: Vec<&AgentProfile> = pool
            .into_iter()
            .filter(|p| p.enabled)
            .filter(|p| !ctx.exclude.contains(&p.name))
            .filter(|p| p.supports(&ctx.required_capabilities))
            .collect();

        if capable.is_empty() {
            return Err(RoutingError::NoCapableAgent {
                step_id: ctx.step_id.clone(),
                required: ctx.required_capabilities.clone(),
            });
        }

        let affordable: Vec<&AgentProfile> = capable
            .into_iter()
            .filter(|p| self.budget.fits(ctx.run_id, p.cost_per_call))
            .collect();

        if affordable.is_empty() {
            tracing::warn!(step_id = %ctx.step_id, "all capable agents exceed budget");
            return Err(RoutingError::BudgetExceeded {
                step_id: ctx.step_id.clone(),
            });
        }

        let mut candidates = if only.is_some() {
            // Explicit fallback order wins over strategy scores.
            let n = affordable.len() as f64;
            affordable
                .iter()
                .enumerate()
                .map(|(i, p)| score(p, 1.0 - i as f64 / n))
                .collect()
        } else {
            self.score_all(&affordable)
        };

        if let Some(preferred) = &ctx.preferred_agent {
            if let Some(pos) = candidates.iter().position(|c| &c.agent == preferred) {
                let chosen = candidates.remove(pos);
                candidates.insert(0, chosen);
            }
        }

        tracing::debug!(
            step_id = %ctx.step_id,
            strategy = ?self.strategy,
            best = %candidates[0].agent,
            candidates = candidates.len(),
            "routed step"
        );

        Ok(RoutingResult {
            strategy: self.strategy,
            candidates,
        })
    }

    fn score_all(&self, agents: &[&AgentProfile]) -> Vec<AgentScore> {
        let n = agents.len();
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n)
                    .map(|i| {
                        let p = agents[(start + i) % n];
                        score(p, 1.0 - i as f64 / n as f64)
                    })
                    .collect()
            }
            SelectionStrategy::LowestCost => {
                let max_cost = max_cost(agents);
                sorted(agents.iter().map(|p| score(p, cost_score(p, max_cost))))
            }
            SelectionStrategy::HighestQuality => {
                sorted(agents.iter().map(|p| score(p, p.quality)))
            }
            SelectionStrategy::Weighted => {
                let max_cost = max_cost(agents);
                let w = self.weights;
                sorted(agents.iter().map(|p| {
                    let load = self.in_flight.get(&p.name).map(|v| *v).unwrap_or(0);
                    let s = w.cost * cost_score(p, max_cost)
                        + w.quality * p.quality
                        + w.load * load_score(load, p.max_concurrent);
                    score(p, s)
                }))
            }
        }
    }
}

fn score(profile: &AgentProfile, value: f64) -> AgentScore {
    AgentScore {
        agent: profile.name.clone(),
        score: value,
        cost: profile.cost_per_call,
    }
}

/// Stable descending sort, so equal scores keep declaration order.
fn sorted(scores: impl Iterator<Item = AgentScore>) -> Vec<AgentScore> {
    let mut v: Vec<AgentScore> = scores.collect();
    v.sort_by(|a, b| b.score.total_cmp(&a.score));
    v
}

fn max_cost(agents: &[&AgentProfile]) -> f64 {
    agents.iter().map(|p| p.cost_per_call).fold(0.0, f64::max)
}

fn cost_score(p: &AgentProfile, max_cost: f64) -> f64 {
    if max_cost <= 0.0 {
        1.0
    } else {
        1.0 - p.cost_per_call / max_cost
    }
}

fn load_score(in_flight: u32, max_concurrent: u32) -> f64 {
    if max_concurrent == 0 {
        return 0.0;
    }
    (1.0 - f64::from(in_flight) / f64::from(max_concurrent)).max(0.0)
}
