use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// One breaker per route id, so a failing backend degrades only the routes
/// that point at it.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<RouteBreaker>>,
}

struct RouteBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    Allowed,
    /// Half-open: let the request through as a probe.
    Probe,
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, route_id: &str, config: &CircuitBreakerConfig) -> BreakerCheck {
        self.get_or_create(route_id, config).check()
    }

    pub fn record_success(&self, route_id: &str, config: &CircuitBreakerConfig) {
        self.get_or_create(route_id, config).record_success(route_id);
    }

    pub fn record_failure(&self, route_id: &str, config: &CircuitBreakerConfig) {
        self.get_or_create(route_id, config).record_failure(route_id);
    }

    fn get_or_create(&self, route_id: &str, config: &CircuitBreakerConfig) -> Arc<RouteBreaker> {
        if let Some(entry) = self.breakers.get(route_id) {
            // Rebuild the breaker if the rule changed under it.
            if entry.value().config == *config {
                return entry.value().clone();
            }
        }
        let fresh = Arc::new(RouteBreaker::new(config.clone()));
        self.breakers
            .entry(route_id.to_string())
            .and_modify(|existing| {
                if existing.config != *config {
                    *existing = fresh.clone();
                }
            })
            .or_insert_with(|| fresh.clone())
            .clone()
    }

    /// Drop breakers for routes that no longer exist.
    pub fn retain_routes(&self, route_ids: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| route_ids.contains(k));
    }
}

impl RouteBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            config,
        }
    }

    fn opened_at(&self) -> Option<Instant> {
        *self.opened_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_opened(&self) {
        *self.opened_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => {
                let cooled = self
                    .opened_at()
                    .map(|at| at.elapsed() >= Duration::from_secs(self.config.open_duration_secs))
                    .unwrap_or(false);
                // Only the caller that wins the CAS gets the probe.
                if cooled
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    return BreakerCheck::Probe;
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => BreakerCheck::Probe,
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self, route_id: &str) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    tracing::info!(
                        "policy: circuit_breaker: closed, route={}, successes={}",
                        route_id,
                        count
                    );
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self, route_id: &str) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    self.mark_opened();
                    tracing::warn!(
                        "policy: circuit_breaker: opened, route={}, failures={}",
                        route_id,
                        count
                    );
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                self.mark_opened();
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!(
                    "policy: circuit_breaker: re-opened, route={}, probe failed",
                    route_id
                );
            }
            _ => {}
        }
    }
}
