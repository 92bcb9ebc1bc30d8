use crate::background::Background;
use crate::config::{GatewayConfig, RouteConfig, UpstreamConfig};
use crate::policy::{LocalPolicy, SharedPolicy};
use crate::proxy::filter::{build_filters, Filter};
use crate::proxy::BoxBody;
use crate::relay::LogRelay;
use crate::routing::RouteTable;
use crate::store::SharedStore;
use crate::telemetry::{Metrics, MetricsRecorder};
use anyhow::Result;
use arc_swap::ArcSwap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Shared gateway state, cheaply cloneable.
///
/// Everything except the route table is fixed at startup. A route reload
/// replaces the table wholesale; reads via `ArcSwap::load` stay lock-free.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub store: SharedStore,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub filters: Arc<Vec<Filter>>,
    pub policy: SharedPolicy,
    pub recorder: MetricsRecorder,
    pub relay: LogRelay,
    pub background: Background,
    pub metrics: Metrics,
    pub client: HttpClient,
    /// Reported as `gateway` in access-log events.
    pub hostname: Arc<str>,
    /// Serializes route replacement.
    routes_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    /// Build with the in-process policy engine. Must run inside a tokio runtime.
    pub fn new(config: GatewayConfig, store: SharedStore) -> Result<Self> {
        let policy = LocalPolicy::new(config.policy.clone());
        policy.start_gc();
        Self::with_policy(config, store, Arc::new(policy))
    }

    pub fn with_policy(config: GatewayConfig, store: SharedStore, policy: SharedPolicy) -> Result<Self> {
        let metrics = Metrics::install()?;
        let background = Background::start(&config.background);
        let relay = LogRelay::new(store.clone(), background.clone(), config.log_relay.clone());
        let recorder = MetricsRecorder::new(store.clone(), config.metrics.clone());
        let filters = build_filters(&config, store.clone(), relay.clone(), policy.clone())?;
        let routes = RouteTable::new(&config.routes);
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            "server: state ready, routes={}, store={}, hostname={}",
            routes.len(),
            store.backend(),
            hostname
        );

        Ok(Self {
            client: build_http_client(&config.upstream),
            config: Arc::new(config),
            store,
            routes: Arc::new(ArcSwap::new(Arc::new(routes))),
            filters: Arc::new(filters),
            policy,
            recorder,
            relay,
            background,
            metrics,
            hostname: hostname.into(),
            routes_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Swap in a new route set and drop policy state for routes that left.
    /// Returns the number of routes that compiled.
    pub async fn replace_routes(&self, routes: &[RouteConfig]) -> usize {
        let _guard = self.routes_mu.lock().await;
        let table = RouteTable::new(routes);
        self.policy.retain_routes(&table.ids());
        let count = table.len();
        self.routes.store(Arc::new(table));
        info!("config: routes replaced, count={}", count);
        count
    }

    /// Re-read the config file and apply its route list. Other sections only
    /// take effect on restart. A missing or invalid file leaves the current
    /// table in place.
    pub async fn reload_routes(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            anyhow::bail!("config file {} not found", path.display());
        }
        let config = GatewayConfig::load(path)?;
        Ok(self.replace_routes(&config.routes).await)
    }
}

fn build_http_client(cfg: &UpstreamConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(cfg.connect_timeout_secs)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn route(id: &str, path: &str) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            path: path.into(),
            uri: "http://127.0.0.1:9001".into(),
            order: 0,
            strip_prefix: 0,
        }
    }

    #[tokio::test]
    async fn test_state_from_config() {
        let config = GatewayConfig {
            routes: vec![route("user", "/api/user/**")],
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(state.routes.load().len(), 1);
        assert_eq!(state.filters.len(), 4);
        assert!(!state.hostname.is_empty());
    }

    #[tokio::test]
    async fn test_replace_routes() {
        let state = GatewayState::new(GatewayConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        assert!(state.routes.load().match_route("/api/order/1").is_none());

        state.replace_routes(&[route("orders", "/api/order/**")]).await;
        let matched = state.routes.load().match_route("/api/order/1");
        assert_eq!(matched.map(|r| r.id.clone()).as_deref(), Some("orders"));

        state.replace_routes(&[]).await;
        assert!(state.routes.load().is_empty());
    }

    fn write_config(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "edge-gateway-reload-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reload_routes_from_file() {
        let config = GatewayConfig {
            routes: vec![route("user", "/api/user/**")],
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, Arc::new(MemoryStore::new())).unwrap();

        let path = write_config(
            "ok",
            r#"
[[routes]]
id = "orders"
path = "/api/order/**"
uri = "http://127.0.0.1:9002"

[[routes]]
id = "pay"
path = "/api/pay/**"
uri = "http://127.0.0.1:9003"
"#,
        );
        assert_eq!(state.reload_routes(&path).await.unwrap(), 2);
        let table = state.routes.load();
        assert!(table.match_route("/api/user/1").is_none());
        assert_eq!(
            table.match_route("/api/pay/7").map(|r| r.id.clone()).as_deref(),
            Some("pay")
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_reload_keeps_routes_on_bad_file() {
        let config = GatewayConfig {
            routes: vec![route("user", "/api/user/**")],
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, Arc::new(MemoryStore::new())).unwrap();

        let missing = std::env::temp_dir().join("edge-gateway-reload-missing.toml");
        assert!(state.reload_routes(&missing).await.is_err());

        let broken = write_config("broken", "[[routes]\nid = ");
        assert!(state.reload_routes(&broken).await.is_err());
        std::fs::remove_file(&broken).unwrap();

        assert_eq!(state.routes.load().len(), 1);
        assert!(state.routes.load().match_route("/api/user/1").is_some());
    }
}
