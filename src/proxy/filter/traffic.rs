use super::FilterResult;
use crate::config::PolicyConfig;
use crate::policy::{BlockCause, SharedPolicy, Verdict};
use crate::proxy::context::{error_body, Exchange};
use crate::relay::{Category, LogRelay};
use http::StatusCode;

/// Consults the policy engine for routed requests and maps blocks to
/// client-facing responses.
pub struct TrafficGate {
    policy: SharedPolicy,
    relay: LogRelay,
    flow_status: StatusCode,
    degrade_status: StatusCode,
}

fn block_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
}

impl TrafficGate {
    pub fn new(config: &PolicyConfig, policy: SharedPolicy, relay: LogRelay) -> Self {
        Self {
            policy,
            relay,
            flow_status: block_status(config.flow_status),
            degrade_status: block_status(config.degrade_status),
        }
    }

    pub(super) async fn on_request(&self, ex: &mut Exchange) -> FilterResult {
        let route_id = match ex.route_id() {
            Some(id) => id,
            None => return FilterResult::Continue,
        };

        let cause = match self.policy.evaluate(route_id, &ex.client_ip, &ex.path).await {
            Verdict::Allow => return FilterResult::Continue,
            Verdict::Block(cause) => cause,
        };

        let (status, category, msg) = match cause {
            BlockCause::Flow => (
                self.flow_status,
                Category::Flow,
                format!("QPS Limit: {}", ex.path),
            ),
            BlockCause::Degrade => (
                self.degrade_status,
                Category::Fuse,
                "Service Degraded".to_string(),
            ),
        };
        tracing::debug!(
            "filter: traffic: blocked, route={}, cause={}, client_ip={}",
            route_id,
            cause,
            ex.client_ip
        );
        self.relay.record(&ex.client_ip.to_string(), category, &msg);
        ex.already_logged = true;
        FilterResult::Reject(error_body(status, &msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Background;
    use crate::config::{BackgroundConfig, LogRelayConfig, RouteConfig};
    use crate::policy::PolicyEngine;
    use crate::routing::CompiledRoute;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use http::{HeaderMap, Method};
    use http_body_util::BodyExt;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        verdict: Verdict,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicyEngine for Fixed {
        async fn evaluate(&self, _route_id: &str, _ip: &IpAddr, _path: &str) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }

        fn report(&self, _route_id: &str, _failed: bool) {}
    }

    fn gate(verdict: Verdict, config: &PolicyConfig) -> (TrafficGate, Arc<Fixed>) {
        let engine = Arc::new(Fixed {
            verdict,
            calls: AtomicUsize::new(0),
        });
        let relay = LogRelay::new(
            Arc::new(MemoryStore::new()),
            Background::start(&BackgroundConfig::default()),
            LogRelayConfig::default(),
        );
        (TrafficGate::new(config, engine.clone(), relay), engine)
    }

    fn routed_exchange() -> Exchange {
        let route = CompiledRoute::compile(&RouteConfig {
            id: "orders".into(),
            path: "/api/order/**".into(),
            uri: "http://127.0.0.1:9002".into(),
            order: 0,
            strip_prefix: 0,
        })
        .unwrap();
        let mut ex = Exchange::new(
            Method::GET,
            "/api/order/9".into(),
            None,
            HeaderMap::new(),
            "10.0.0.1:1000".parse().unwrap(),
        );
        ex.route = Some(Arc::new(route));
        ex
    }

    async fn body_json(resp: hyper::Response<crate::proxy::BoxBody>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unrouted_skips_policy() {
        let (g, engine) = gate(Verdict::Block(BlockCause::Flow), &PolicyConfig::default());
        let mut ex = Exchange::new(
            Method::GET,
            "/nowhere".into(),
            None,
            HeaderMap::new(),
            "10.0.0.1:1000".parse().unwrap(),
        );
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flow_block_response() {
        let (g, _) = gate(Verdict::Block(BlockCause::Flow), &PolicyConfig::default());
        let mut ex = routed_exchange();
        let resp = match g.on_request(&mut ex).await {
            FilterResult::Reject(resp) => resp,
            FilterResult::Continue => panic!("expected block"),
        };
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(resp).await;
        assert_eq!(json["code"], 429);
        assert_eq!(json["msg"], "QPS Limit: /api/order/9");
        assert!(ex.already_logged);
    }

    #[tokio::test]
    async fn test_degrade_uses_configured_status() {
        let config = PolicyConfig {
            degrade_status: 503,
            ..PolicyConfig::default()
        };
        let (g, _) = gate(Verdict::Block(BlockCause::Degrade), &config);
        let mut ex = routed_exchange();
        let resp = match g.on_request(&mut ex).await {
            FilterResult::Reject(resp) => resp,
            FilterResult::Continue => panic!("expected block"),
        };
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["msg"], "Service Degraded");
    }

    #[tokio::test]
    async fn test_allow_continues() {
        let (g, engine) = gate(Verdict::Allow, &PolicyConfig::default());
        let mut ex = routed_exchange();
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(!ex.already_logged);
    }
}
