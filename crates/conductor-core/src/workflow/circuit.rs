//! Per-agent circuit breakers.
//!
//! Implements a circuit breaker per agent so a repeatedly failing agent is
//! fast-failed instead of called. `N` consecutive failures inside a rolling
//! window open the breaker for a cool-down; when the cool-down expires one
//! trial call is let through (half-open). Success closes the breaker, failure
//! re-opens it with the cool-down multiplied, up to a ceiling.
//!
//! State transitions depend only on the sequence of acquire/success/failure
//! calls and the clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use conductor_types::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;

/// Circuit breaker state for an agent.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Agent is disabled until `opened_at + cooldown`.
    Open { opened_at: Instant, cooldown: Duration },
    /// Cool-down expired. One trial call is allowed at a time.
    HalfOpen { trial_in_flight: bool },
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker for a single agent.
#[derive(Debug)]
pub struct AgentBreaker {
    state: CircuitState,
    /// Timestamps of the current run of consecutive failures.
    failures: VecDeque<Instant>,
    /// Cool-down applied the next time the breaker opens from half-open.
    next_cooldown: Duration,
    config: CircuitBreakerConfig,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl AgentBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            next_cooldown: Duration::from_millis(config.cooldown_ms),
            config,
            total_calls: 0,
            total_failures: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    /// Current status, without transitioning.
    pub fn status(&self) -> BreakerStatus {
        match self.state {
            CircuitState::Closed => BreakerStatus::Closed,
            CircuitState::Open { .. } => BreakerStatus::Open,
            CircuitState::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Whether a call would be rejected right now. Does not claim the trial slot.
    pub fn is_blocking(&self) -> bool {
        match &self.state {
            CircuitState::Closed => false,
            CircuitState::Open { opened_at, cooldown } => opened_at.elapsed() < *cooldown,
            CircuitState::HalfOpen { trial_in_flight } => *trial_in_flight,
        }
    }

    /// Ask to make a call.
    ///
    /// Moves Open -> HalfOpen once the cool-down has elapsed and claims the
    /// single trial slot. Returns `false` when the call must fast-fail.
    pub fn try_acquire(&mut self) -> bool {
        match &self.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at, cooldown } => {
                if opened_at.elapsed() >= *cooldown {
                    self.state = CircuitState::HalfOpen { trial_in_flight: true };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    false
                } else {
                    self.state = CircuitState::HalfOpen { trial_in_flight: true };
                    true
                }
            }
        }
    }

    /// Give back a claimed trial slot without an outcome (e.g. cancellation).
    pub fn release(&mut self) {
        if let CircuitState::HalfOpen { .. } = self.state {
            self.state = CircuitState::HalfOpen { trial_in_flight: false };
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.failures.clear();
        if !matches!(self.state, CircuitState::Closed) {
            self.next_cooldown = Duration::from_millis(self.config.cooldown_ms);
        }
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, error: &str) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
        let now = Instant::now();

        match self.status() {
            BreakerStatus::Closed => {
                let window = Duration::from_millis(self.config.window_ms);
                while let Some(first) = self.failures.front() {
                    if now.duration_since(*first) > window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                self.failures.push_back(now);
                if self.failures.len() as u32 >= self.config.failure_threshold.max(1) {
                    self.open(now, Duration::from_millis(self.config.cooldown_ms));
                }
            }
            BreakerStatus::HalfOpen => {
                let cooldown = self.next_cooldown;
                self.open(now, cooldown);
            }
            BreakerStatus::Open => {}
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.failures.clear();
        self.state = CircuitState::Open { opened_at: now, cooldown };
        let extended = cooldown.as_millis() as f64 * self.config.cooldown_multiplier.max(1.0);
        self.next_cooldown =
            Duration::from_millis((extended as u64).min(self.config.max_cooldown_ms));
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Breakers keyed by agent name, one mutex per agent.
///
/// Shared by all concurrent runs. Locks are never held across `.await`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<Mutex<AgentBreaker>>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    fn breaker(&self, agent: &str) -> Arc<Mutex<AgentBreaker>> {
        self.breakers
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentBreaker::new(self.config.clone()))))
            .clone()
    }

    fn with<T>(&self, agent: &str, f: impl FnOnce(&mut AgentBreaker) -> T) -> T {
        let breaker = self.breaker(agent);
        let mut guard: MutexGuard<'_, AgentBreaker> =
            breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// See [`AgentBreaker::try_acquire`].
    pub fn try_acquire(&self, agent: &str) -> bool {
        let allowed = self.with(agent, AgentBreaker::try_acquire);
        if !allowed {
            tracing::debug!(agent, "circuit open, fast-failing call");
        }
        allowed
    }

    pub fn release(&self, agent: &str) {
        self.with(agent, AgentBreaker::release);
    }

    pub fn record_success(&self, agent: &str) {
        let was = self.with(agent, |b| {
            let was = b.status();
            b.record_success();
            was
        });
        if was != BreakerStatus::Closed {
            tracing::info!(agent, "circuit closed after successful trial call");
        }
    }

    pub fn record_failure(&self, agent: &str, error: &str) {
        let (before, after) = self.with(agent, |b| {
            let before = b.status();
            b.record_failure(error);
            (before, b.status())
        });
        if before != BreakerStatus::Open && after == BreakerStatus::Open {
            tracing::warn!(agent, error, "circuit opened");
        }
    }

    pub fn status(&self, agent: &str) -> BreakerStatus {
        self.with(agent, |b| b.status())
    }

    /// Whether calls to `agent` are currently being rejected.
    pub fn is_blocking(&self, agent: &str) -> bool {
        self.breakers
            .get(agent)
            .map(|b| {
                b.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_blocking()
            })
            .unwrap_or(false)
    }

    /// Agents whose breakers currently reject calls.
    pub fn blocked_agents(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_blocking()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 40,
            cooldown_multiplier: 2.0,
            max_cooldown_ms: 100,
        }
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let breaker = AgentBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(!breaker.is_blocking());
    }

    #[test]
    fn test_fifth_failure_opens() {
        let mut b = AgentBreaker::new(fast_config());
        for _ in 0..4 {
            b.record_failure("boom");
            assert_eq!(b.status(), BreakerStatus::Closed);
        }
        b.record_failure("boom");
        assert_eq!(b.status(), BreakerStatus::Open);
        assert!(!b.try_acquire());
        assert_eq!(b.total_failures, 5);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut b = AgentBreaker::new(fast_config());
        for _ in 0..4 {
            b.record_failure("boom");
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure("boom");
        }
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let mut b = AgentBreaker::new(CircuitBreakerConfig {
            window_ms: 20,
            ..fast_config()
        });
        for _ in 0..4 {
            b.record_failure("boom");
        }
        std::thread::sleep(Duration::from_millis(40));
        b.record_failure("boom");
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial_then_closes() {
        let mut b = AgentBreaker::new(fast_config());
        for _ in 0..5 {
            b.record_failure("boom");
        }
        assert!(!b.try_acquire());

        std::thread::sleep(Duration::from_millis(60));
        assert!(b.try_acquire());
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
        // Second caller is rejected while the trial is in flight.
        assert!(!b.try_acquire());

        b.record_success();
        assert_eq!(b.status(), BreakerStatus::Closed);
        assert!(b.try_acquire());
    }

    #[test]
    fn test_failed_trial_reopens_with_extended_cooldown() {
        let mut b = AgentBreaker::new(fast_config());
        for _ in 0..5 {
            b.record_failure("boom");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.try_acquire());
        b.record_failure("still down");

        match b.state() {
            CircuitState::Open { cooldown, .. } => assert_eq!(*cooldown, Duration::from_millis(80)),
            other => panic!("expected open, got {other:?}"),
        }

        // Next extension is capped at max_cooldown_ms.
        std::thread::sleep(Duration::from_millis(100));
        assert!(b.try_acquire());
        b.record_failure("still down");
        match b.state() {
            CircuitState::Open { cooldown, .. } => assert_eq!(*cooldown, Duration::from_millis(100)),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_release_frees_trial_slot() {
        let mut b = AgentBreaker::new(fast_config());
        for _ in 0..5 {
            b.record_failure("boom");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.try_acquire());
        b.release();
        assert!(b.try_acquire());
    }

    #[test]
    fn test_registry_is_per_agent() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..5 {
            registry.record_failure("flaky", "boom");
        }
        assert!(!registry.try_acquire("flaky"));
        assert!(registry.try_acquire("steady"));
        assert!(registry.is_blocking("flaky"));
        assert!(!registry.is_blocking("unknown"));
        assert_eq!(registry.blocked_agents(), vec!["flaky".to_string()]);
        assert_eq!(registry.status("steady"), BreakerStatus::Closed);
    }
}
