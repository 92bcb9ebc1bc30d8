//! Traffic policy decisions.
//!
//! The request pipeline talks to a [`PolicyEngine`] only through
//! `evaluate`/`report`; it never inspects limiter or breaker state itself.
//! [`LocalPolicy`] is the in-process engine: per-route rate limits produce
//! flow blocks and per-route circuit breakers produce degrade blocks.

mod circuit_breaker;
mod rate_limit;

pub use circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
pub use rate_limit::RateLimiter;

use crate::config::PolicyConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Why the engine refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCause {
    /// Generic flow limit (rate or count exceeded).
    Flow,
    /// Circuit open / service degraded.
    Degrade,
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockCause::Flow => f.write_str("flow"),
            BlockCause::Degrade => f.write_str("degrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(BlockCause),
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, route_id: &str, client_ip: &IpAddr, path: &str) -> Verdict;

    /// Feed back the outcome of a dispatched request.
    fn report(&self, route_id: &str, failed: bool);

    /// Called when the route set changes so per-route state can be pruned.
    fn retain_routes(&self, _route_ids: &HashSet<String>) {}
}

pub type SharedPolicy = Arc<dyn PolicyEngine>;

pub struct LocalPolicy {
    config: PolicyConfig,
    limiter: Arc<RateLimiter>,
    breakers: CircuitBreakerRegistry,
}

impl LocalPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            limiter: Arc::new(RateLimiter::new()),
            breakers: CircuitBreakerRegistry::new(),
        }
    }

    /// Start background eviction of idle limiter entries.
    pub fn start_gc(&self) {
        self.limiter.start_gc();
    }
}

#[async_trait]
impl PolicyEngine for LocalPolicy {
    async fn evaluate(&self, route_id: &str, client_ip: &IpAddr, path: &str) -> Verdict {
        let rule = match self.config.rule_for(route_id) {
            Some(rule) => rule,
            None => return Verdict::Allow,
        };

        if let Some(cb) = &rule.circuit_breaker {
            if self.breakers.check(route_id, cb) == BreakerCheck::Rejected {
                return Verdict::Block(BlockCause::Degrade);
            }
        }

        if let Some(rl) = &rule.rate_limit {
            let key = RateLimiter::extract_key(rl, route_id, path, client_ip);
            if !self.limiter.check(rl, &key).await {
                return Verdict::Block(BlockCause::Flow);
            }
        }

        Verdict::Allow
    }

    fn report(&self, route_id: &str, failed: bool) {
        let cb = match self
            .config
            .rule_for(route_id)
            .and_then(|r| r.circuit_breaker.as_ref())
        {
            Some(cb) => cb,
            None => return,
        };
        if failed {
            self.breakers.record_failure(route_id, cb);
        } else {
            self.breakers.record_success(route_id, cb);
        }
    }

    fn retain_routes(&self, route_ids: &HashSet<String>) {
        self.breakers.retain_routes(route_ids);
    }
}
