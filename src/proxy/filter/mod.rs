mod auth;
mod replay;
mod traffic;
mod waf;

pub use auth::AuthGuard;
pub use replay::{NonceGuard, ReplayReject};
pub use traffic::TrafficGate;
pub use waf::WafGate;

use crate::config::GatewayConfig;
use crate::policy::SharedPolicy;
use crate::proxy::context::{BoxBody, Exchange};
use crate::relay::LogRelay;
use crate::store::SharedStore;
use std::sync::Arc;

/// Result of a filter's on_request phase.
pub enum FilterResult {
    /// Continue to the next filter / phase.
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Path fragments exempt from a guard. A path is exempt when it contains any
/// fragment, so `/dashboard` also covers `/api/dashboard/x`.
#[derive(Debug, Clone, Default)]
pub struct Whitelist(Arc<Vec<String>>);

impl Whitelist {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Self {
        Self(Arc::new(entries.into_iter().collect()))
    }

    pub fn matches(&self, path: &str) -> bool {
        self.0.iter().any(|frag| path.contains(frag.as_str()))
    }
}

/// Enum-based filter: static dispatch, exhaustive match.
///
/// Each variant holds the config/state it needs. The chain is built once at
/// startup and shared by every request.
pub enum Filter {
    Waf(WafGate),
    Replay(NonceGuard),
    Auth(AuthGuard),
    Traffic(TrafficGate),
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .finish()
    }
}

impl Filter {
    /// Lower runs first.
    pub fn priority(&self) -> i32 {
        match self {
            Filter::Waf(_) => -100,
            Filter::Replay(_) => -90,
            Filter::Auth(_) => -80,
            Filter::Traffic(_) => -70,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::Waf(_) => "waf",
            Filter::Replay(_) => "replay",
            Filter::Auth(_) => "auth",
            Filter::Traffic(_) => "traffic",
        }
    }

    pub async fn on_request(&self, ex: &mut Exchange) -> FilterResult {
        let result = match self {
            Filter::Waf(f) => f.on_request(ex).await,
            Filter::Replay(f) => f.on_request(ex).await,
            Filter::Auth(f) => f.on_request(ex).await,
            Filter::Traffic(f) => f.on_request(ex).await,
        };
        if matches!(result, FilterResult::Reject(_)) {
            ex.rejected_by = Some(self.name());
            metrics::counter!("gateway_filter_rejected_total", "filter" => self.name()).increment(1);
        }
        result
    }
}

/// Build the request chain in priority order.
pub fn build_filters(
    config: &GatewayConfig,
    store: SharedStore,
    relay: LogRelay,
    policy: SharedPolicy,
) -> anyhow::Result<Vec<Filter>> {
    let whitelist = Whitelist::new(config.whitelist.iter().cloned());

    let mut filters = vec![
        Filter::Waf(WafGate::new(&config.waf, store.clone(), relay.clone())?),
        Filter::Replay(NonceGuard::new(
            config.replay.clone(),
            whitelist.clone(),
            store,
            relay.clone(),
        )),
        Filter::Auth(AuthGuard::new(&config.auth, whitelist, relay.clone())?),
        Filter::Traffic(TrafficGate::new(&config.policy, policy, relay)),
    ];
    filters.sort_by_key(Filter::priority);

    tracing::info!(
        "proxy: filter chain built, filters={:?}",
        filters.iter().map(Filter::name).collect::<Vec<_>>()
    );
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Background;
    use crate::config::BackgroundConfig;
    use crate::policy::LocalPolicy;
    use crate::store::MemoryStore;

    #[test]
    fn test_whitelist_contains() {
        let wl = Whitelist::new(["/auth/login".to_string(), "/dashboard".to_string()]);
        assert!(wl.matches("/auth/login"));
        assert!(wl.matches("/api/dashboard/metrics"));
        assert!(!wl.matches("/api/user/1"));
        assert!(!Whitelist::default().matches("/anything"));
    }

    #[tokio::test]
    async fn test_chain_order() {
        let mut config = GatewayConfig::default();
        config.auth.jwt_secret = "secret".into();
        let store: SharedStore = Arc::new(MemoryStore::new());
        let relay = LogRelay::new(
            store.clone(),
            Background::start(&BackgroundConfig::default()),
            config.log_relay.clone(),
        );
        let policy: SharedPolicy = Arc::new(LocalPolicy::new(config.policy.clone()));

        let filters = build_filters(&config, store, relay, policy).unwrap();
        let names: Vec<_> = filters.iter().map(Filter::name).collect();
        assert_eq!(names, ["waf", "replay", "auth", "traffic"]);
        assert!(filters.windows(2).all(|w| w[0].priority() < w[1].priority()));
    }
}
