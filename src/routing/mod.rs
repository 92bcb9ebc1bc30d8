//! Route selection: ordered glob predicates over the request path.

use crate::config::RouteConfig;
use crate::error::GatewayError;
use globset::{GlobBuilder, GlobMatcher};
use http::Uri;
use std::collections::HashSet;
use std::sync::Arc;

pub struct CompiledRoute {
    pub id: String,
    pub order: i32,
    pub strip_prefix: usize,
    /// Backend base, without a trailing slash.
    pub upstream: String,
    matcher: GlobMatcher,
    /// `/api/**` also matches the bare `/api`.
    bare_prefix: Option<String>,
}

impl CompiledRoute {
    pub fn compile(cfg: &RouteConfig) -> Result<Self, GatewayError> {
        let matcher = GlobBuilder::new(&cfg.path)
            .literal_separator(true)
            .build()
            .map_err(|e| GatewayError::Config(format!("route {}: bad path: {}", cfg.id, e)))?
            .compile_matcher();
        let base: Uri = cfg
            .uri
            .parse()
            .map_err(|_| GatewayError::InvalidUpstream(cfg.uri.clone()))?;
        if base.scheme().is_none() || base.authority().is_none() {
            return Err(GatewayError::InvalidUpstream(cfg.uri.clone()));
        }

        Ok(Self {
            id: cfg.id.clone(),
            order: cfg.order,
            strip_prefix: cfg.strip_prefix,
            upstream: cfg.uri.trim_end_matches('/').to_string(),
            matcher,
            bare_prefix: cfg.path.strip_suffix("/**").map(str::to_string),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path) || self.bare_prefix.as_deref() == Some(path)
    }

    /// Path forwarded to the backend after dropping `strip_prefix` segments.
    pub fn forward_path(&self, path: &str) -> String {
        if self.strip_prefix == 0 {
            return path.to_string();
        }
        let rest: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(self.strip_prefix)
            .collect();
        let mut out = String::with_capacity(path.len());
        for seg in &rest {
            out.push('/');
            out.push_str(seg);
        }
        if out.is_empty() {
            out.push('/');
        } else if path.ends_with('/') {
            out.push('/');
        }
        out
    }

    pub fn upstream_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
        let forward = self.forward_path(path);
        let mut uri = String::with_capacity(self.upstream.len() + forward.len() + 16);
        uri.push_str(&self.upstream);
        uri.push_str(&forward);
        if let Some(q) = query {
            uri.push('?');
            uri.push_str(q);
        }
        uri.parse().map_err(|_| GatewayError::InvalidUpstream(uri))
    }
}

/// Immutable snapshot of the routes; replaced wholesale on change.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Routes that fail to compile are skipped with a warning; `validate`
    /// rejects them at load time, so this only matters for hot updates.
    pub fn new(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Arc<CompiledRoute>> = configs
            .iter()
            .filter_map(|cfg| match CompiledRoute::compile(cfg) {
                Ok(route) => {
                    tracing::debug!(
                        "routing: compiled route, id={}, path={}, uri={}, order={}",
                        cfg.id,
                        cfg.path,
                        cfg.uri,
                        cfg.order
                    );
                    Some(Arc::new(route))
                }
                Err(e) => {
                    tracing::warn!("routing: skipped route, id={}, error={}", cfg.id, e);
                    None
                }
            })
            .collect();
        // Stable: equal orders keep declaration order.
        routes.sort_by_key(|r| r.order);

        tracing::info!("routing: compiled route table, count={}", routes.len());
        metrics::gauge!("gateway_config_routes_total").set(routes.len() as f64);
        Self { routes }
    }

    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes.iter().find(|r| r.matches(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn ids(&self) -> HashSet<String> {
        self.routes.iter().map(|r| r.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, path: &str, order: i32, strip_prefix: usize) -> RouteConfig {
        RouteConfig {
            id: id.to_string(),
            path: path.to_string(),
            uri: "http://127.0.0.1:9001".to_string(),
            order,
            strip_prefix,
        }
    }

    #[test]
    fn test_match_by_order() {
        let table = RouteTable::new(&[
            route("catch-all", "/api/**", 10, 0),
            route("user", "/api/user/**", 0, 1),
        ]);
        assert_eq!(table.match_route("/api/user/7").unwrap().id, "user");
        assert_eq!(table.match_route("/api/order/7").unwrap().id, "catch-all");
        assert!(table.match_route("/other").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_single_star_does_not_cross_segments() {
        let table = RouteTable::new(&[route("one", "/api/*", 0, 0)]);
        assert!(table.match_route("/api/a").is_some());
        assert!(table.match_route("/api/a/b").is_none());
    }

    #[test]
    fn test_double_star_matches_bare_prefix() {
        let table = RouteTable::new(&[route("user", "/api/user/**", 0, 0)]);
        assert!(table.match_route("/api/user").is_some());
        assert!(table.match_route("/api/users").is_none());
    }

    #[test]
    fn test_forward_path_strip_prefix() {
        let r = CompiledRoute::compile(&route("user", "/api/user/**", 0, 1)).unwrap();
        assert_eq!(r.forward_path("/api/user/7"), "/user/7");
        assert_eq!(r.forward_path("/api/user/"), "/user/");
        assert_eq!(r.forward_path("/api"), "/");

        let keep = CompiledRoute::compile(&route("keep", "/x/**", 0, 0)).unwrap();
        assert_eq!(keep.forward_path("/x/y"), "/x/y");
    }

    #[test]
    fn test_upstream_uri() {
        let r = CompiledRoute::compile(&route("user", "/api/user/**", 0, 1)).unwrap();
        let uri = r.upstream_uri("/api/user/7", Some("a=1")).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9001/user/7?a=1");
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let mut cfg = route("bad", "/bad/**", 0, 0);
        cfg.uri = "not a uri".into();
        assert!(CompiledRoute::compile(&cfg).is_err());
        assert!(RouteTable::new(&[cfg]).is_empty());
    }
}
