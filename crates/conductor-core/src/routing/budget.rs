//! Spend tracking for agent dispatches.
//!
//! `BudgetTracker` accumulates cost per run and per rolling period. The
//! router asks `fits` before scoring; the engine calls `record_spend` after
//! each successful agent dispatch. State is shared across concurrent runs,
//! so all counters sit behind locks and cloning shares them.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conductor_types::agent::BudgetConfig;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug)]
struct PeriodWindow {
    started: Instant,
    spent: f64,
}

/// Shared budget ledger.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    per_run: Arc<DashMap<Uuid, f64>>,
    period: Arc<Mutex<PeriodWindow>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            per_run: Arc::new(DashMap::new()),
            period: Arc::new(Mutex::new(PeriodWindow {
                started: Instant::now(),
                spent: 0.0,
            })),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Would spending `cost` keep both the run and the period within limits?
    pub fn fits(&self, run_id: Option<Uuid>, cost: f64) -> bool {
        if let (Some(limit), Some(run_id)) = (self.config.per_run_limit, run_id) {
            if self.run_spend(run_id) + cost > limit {
                return false;
            }
        }
        if let Some(limit) = self.config.per_period_limit {
            if self.period_spend() + cost > limit {
                return false;
            }
        }
        true
    }

    /// Is any budget left at all? Used when the cost of the next call is
    /// unknown (no profile for the agent).
    pub fn has_headroom(&self, run_id: Option<Uuid>) -> bool {
        if let (Some(limit), Some(run_id)) = (self.config.per_run_limit, run_id) {
            if self.run_spend(run_id) >= limit {
                return false;
            }
        }
        match self.config.per_period_limit {
            Some(limit) => self.period_spend() < limit,
            None => true,
        }
    }

    /// Add `cost` to the run and period totals.
    pub fn record_spend(&self, run_id: Uuid, agent: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        *self.per_run.entry(run_id).or_insert(0.0) += cost;

        let period_total = {
            let mut window = self.window();
            window.spent += cost;
            window.spent
        };

        tracing::debug!(
            run_id = %run_id,
            agent,
            cost,
            period_total,
            "recorded agent spend"
        );

        if let Some(limit) = self.config.per_period_limit {
            if period_total >= limit * 0.8 {
                tracing::warn!(period_total, limit, "period budget above 80%");
            }
        }
    }

    pub fn run_spend(&self, run_id: Uuid) -> f64 {
        self.per_run.get(&run_id).map(|v| *v).unwrap_or(0.0)
    }

    /// Spend within the current period, resetting the window if it elapsed.
    pub fn period_spend(&self) -> f64 {
        self.window().spent
    }

    /// Forget a finished run's spend.
    pub fn clear_run(&self, run_id: Uuid) {
        self.per_run.remove(&run_id);
    }

    fn window(&self) -> std::sync::MutexGuard<'_, PeriodWindow> {
        let mut window = self.period.lock().unwrap_or_else(|p| p.into_inner());
        let period = Duration::from_secs(self.config.period_secs.max(1));
        if window.started.elapsed() >= period {
            window.started = Instant::now();
            window.spent = 0.0;
        }
        window
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(per_run: Option<f64>, per_period: Option<f64>) -> BudgetTracker {
        BudgetTracker::new(BudgetConfig {
            per_run_limit: per_run,
            per_period_limit: per_period,
            period_secs: 3600,
        })
    }

    #[test]
    fn unlimited_budget_always_fits() {
        let t = BudgetTracker::default();
        assert!(t.fits(Some(Uuid::now_v7()), 1_000_000.0));
    }

    #[test]
    fn per_run_limit_is_enforced_per_run() {
        let t = tracker(Some(1.0), None);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        t.record_spend(a, "fast", 0.75);
        assert!(!t.fits(Some(a), 0.5));
        assert!(t.fits(Some(a), 0.25));
        assert!(t.fits(Some(b), 0.5));
    }

    #[test]
    fn headroom_is_gone_once_spend_reaches_limit() {
        let t = tracker(Some(1.0), Some(5.0));
        let run = Uuid::now_v7();
        assert!(t.has_headroom(Some(run)));

        t.record_spend(run, "fast", 1.0);
        assert!(!t.has_headroom(Some(run)));
        assert!(t.has_headroom(Some(Uuid::now_v7())));

        t.record_spend(Uuid::now_v7(), "fast", 4.0);
        assert!(!t.has_headroom(None));
    }

    #[test]
    fn per_period_limit_spans_runs() {
        let t = tracker(None, Some(2.0));
        t.record_spend(Uuid::now_v7(), "fast", 1.0);
        t.record_spend(Uuid::now_v7(), "smart", 0.5);
        assert_eq!(t.period_spend(), 1.5);
        assert!(!t.fits(Some(Uuid::now_v7()), 1.0));
        assert!(t.fits(None, 0.5));
    }

    #[test]
    fn period_window_resets_when_elapsed() {
        let t = BudgetTracker::new(BudgetConfig {
            per_run_limit: None,
            per_period_limit: Some(1.0),
            period_secs: 1,
        });
        t.record_spend(Uuid::now_v7(), "fast", 1.0);
        assert!(!t.fits(None, 0.5));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(t.period_spend(), 0.0);
        assert!(t.fits(None, 0.5));
    }

    #[test]
    fn clone_shares_ledger_and_clear_run() {
        let t = tracker(Some(1.0), None);
        let t2 = t.clone();
        let run = Uuid::now_v7();
        t2.record_spend(run, "fast", 0.5);
        assert_eq!(t.run_spend(run), 0.5);
        t.clear_run(run);
        assert_eq!(t2.run_spend(run), 0.0);
    }
}
