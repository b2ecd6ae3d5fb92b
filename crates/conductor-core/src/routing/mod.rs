//! Agent routing: capability filtering, budget headroom and strategy scoring.
//!
//! - `budget` -- per-run and per-period spend tracking against `BudgetConfig`
//! - `selector` -- `AgentRouter`, which filters and ranks `AgentProfile`s

pub mod budget;
pub mod selector;

pub use budget::BudgetTracker;
pub use selector::AgentRouter;

/// Why the router could not produce a candidate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    /// No enabled, non-excluded agent advertises the required capabilities.
    #[error("no capable agent for step '{step_id}' (requires {required:?})")]
    NoCapableAgent {
        step_id: String,
        required: Vec<String>,
    },

    /// Capable agents exist but every one would exceed the budget.
    #[error("budget exceeded: no capable agent for step '{step_id}' fits the remaining budget")]
    BudgetExceeded { step_id: String },
}
