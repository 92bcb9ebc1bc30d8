pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used so the gateway starts with zero
    /// configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            store = %config.store.backend,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides for deployment-specific settings. Routes and
    /// policies come from the config file or the external config service.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EDGE_REDIS_URL") {
            self.store.redis_url = v;
        }
        if let Ok(v) = std::env::var("EDGE_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Ok(v) = std::env::var("EDGE_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("EDGE_REPLAY_BYPASS_NONCE") {
            self.replay.bypass_nonce = (!v.is_empty()).then_some(v);
        }
        if let Ok(v) = std::env::var("EDGE_LOG_QUEUE") {
            self.log_relay.queue = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "redis" | "memory" => {}
            other => anyhow::bail!("unknown store backend '{}', use 'redis' or 'memory'", other),
        }
        if self.store.timeout_ms == 0 {
            anyhow::bail!("store.timeout_ms must be greater than 0");
        }

        if !matches!(self.auth.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            anyhow::bail!(
                "unsupported auth algorithm '{}', use HS256, HS384 or HS512",
                self.auth.algorithm
            );
        }
        if http::HeaderName::from_bytes(self.auth.user_id_header.as_bytes()).is_err() {
            anyhow::bail!("invalid auth.user_id_header '{}'", self.auth.user_id_header);
        }

        if self.replay.max_age_secs == 0 || self.replay.nonce_ttl_secs == 0 {
            anyhow::bail!("replay.max_age_secs and replay.nonce_ttl_secs must be greater than 0");
        }

        for range in &self.waf.blocked_ranges {
            if range.parse::<ipnetwork::IpNetwork>().is_err() {
                anyhow::bail!("waf.blocked_ranges: invalid CIDR '{}'", range);
            }
        }

        for status in [self.policy.flow_status, self.policy.degrade_status] {
            if http::StatusCode::from_u16(status).is_err() {
                anyhow::bail!("policy: invalid block status {}", status);
            }
        }
        for (route_id, rule) in &self.policy.rules {
            if let Some(ref rl) = rule.rate_limit {
                if rl.mode == "count" && (rl.count.is_none() || rl.time_window.is_none()) {
                    anyhow::bail!(
                        "policy rule '{}': rate_limit mode 'count' requires 'count' and 'time_window'",
                        route_id
                    );
                }
            }
        }

        if self.metrics.rank_size == 0 {
            anyhow::bail!("metrics.rank_size must be greater than 0");
        }
        if self.log_relay.recent_capacity == 0 {
            anyhow::bail!("log_relay.recent_capacity must be greater than 0");
        }
        if self.background.workers == 0 || self.background.queue_capacity == 0 {
            anyhow::bail!("background.workers and background.queue_capacity must be greater than 0");
        }

        let mut ids = std::collections::HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with path '{}' has empty id", route.path);
            }
            if !ids.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id '{}'", route.id);
            }
            if route.uri.is_empty() {
                anyhow::bail!("route '{}' has empty uri", route.id);
            }
            if globset::Glob::new(&route.path).is_err() {
                anyhow::bail!("route '{}' has invalid path pattern '{}'", route.id, route.path);
            }
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            whitelist: types::default_whitelist(),
            auth: AuthConfig::default(),
            replay: ReplayConfig::default(),
            waf: WafConfig::default(),
            policy: PolicyConfig::default(),
            metrics: MetricsConfig::default(),
            log_relay: LogRelayConfig::default(),
            background: BackgroundConfig::default(),
            upstream: UpstreamConfig::default(),
            routes: Vec::new(),
        }
    }
}
