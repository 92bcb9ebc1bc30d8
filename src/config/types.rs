use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same
/// as a missing field. Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub store: StoreConfig,

    /// Path fragments that bypass authentication and replay protection.
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub waf: WafConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub log_relay: LogRelayConfig,

    #[serde(default)]
    pub background: BackgroundConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

pub(super) fn default_whitelist() -> Vec<String> {
    [
        "/auth/login",
        "/doc.html",
        "/v3/api-docs",
        "/webjars",
        "/log/logs",
        "/favicon.ico",
        "/dashboard",
        "/health",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "redis" (default) or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on every store round-trip.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_store_backend() -> String {
    "redis".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret shared with the token issuer.
    #[serde(default)]
    pub jwt_secret: String,

    /// "HS256", "HS384" or "HS512".
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,

    /// Path fragments where the `token` query parameter is accepted in place
    /// of the Authorization header. Empty disables the fallback.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub query_token_paths: Vec<String>,

    /// Outbound header carrying the validated subject.
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            algorithm: default_jwt_algorithm(),
            query_token_paths: Vec::new(),
            user_id_header: default_user_id_header(),
        }
    }
}

fn default_jwt_algorithm() -> String {
    "HS512".to_string()
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_replay_max_age")]
    pub max_age_secs: u64,

    /// Tolerated clock skew for timestamps ahead of local time.
    #[serde(default = "default_replay_future_skew")]
    pub max_future_skew_secs: u64,

    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_secs: u64,

    /// Nonce value accepted without touching the store. Integration testing only.
    #[serde(default)]
    pub bypass_nonce: Option<String>,

    /// Extra path fragments exempt from replay checks only.
    #[serde(default = "default_replay_extra_whitelist")]
    pub extra_whitelist: Vec<String>,

    #[serde(default = "default_nonce_key_prefix")]
    pub key_prefix: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: default_replay_max_age(),
            max_future_skew_secs: default_replay_future_skew(),
            nonce_ttl_secs: default_nonce_ttl(),
            bypass_nonce: None,
            extra_whitelist: default_replay_extra_whitelist(),
            key_prefix: default_nonce_key_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_replay_max_age() -> u64 {
    300
}

fn default_replay_future_skew() -> u64 {
    10
}

fn default_nonce_ttl() -> u64 {
    300
}

fn default_replay_extra_whitelist() -> Vec<String> {
    vec!["/admin/routes".to_string(), "/actuator".to_string()]
}

fn default_nonce_key_prefix() -> String {
    "gateway:nonce:".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    /// Store key holding the operator toggle; the gate is active while it reads "true".
    #[serde(default = "default_waf_toggle_key")]
    pub toggle_key: String,

    /// CIDR ranges blocked while the toggle is on.
    #[serde(default = "default_waf_blocked_ranges")]
    pub blocked_ranges: Vec<String>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            toggle_key: default_waf_toggle_key(),
            blocked_ranges: default_waf_blocked_ranges(),
        }
    }
}

fn default_waf_toggle_key() -> String {
    "gateway:waf:enable".to_string()
}

fn default_waf_blocked_ranges() -> Vec<String> {
    vec!["192.168.0.100/32".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Keyed by route id; `"*"` applies to routes without their own entry.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: HashMap<String, PolicyRule>,

    #[serde(default = "default_block_status")]
    pub flow_status: u16,

    #[serde(default = "default_block_status")]
    pub degrade_status: u16,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            flow_status: default_block_status(),
            degrade_status: default_block_status(),
        }
    }
}

impl PolicyConfig {
    pub fn rule_for(&self, route_id: &str) -> Option<&PolicyRule> {
        self.rules.get(route_id).or_else(|| self.rules.get("*"))
    }
}

fn default_block_status() -> u16 {
    429
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// "req" (token bucket) or "count" (sliding window).
    #[serde(default = "default_limit_mode")]
    pub mode: String,

    /// Requests per second for "req" mode.
    #[serde(default)]
    pub rate: Option<f64>,

    #[serde(default)]
    pub burst: Option<u64>,

    /// Requests per window for "count" mode.
    #[serde(default)]
    pub count: Option<u64>,

    /// Window length in seconds for "count" mode.
    #[serde(default)]
    pub time_window: Option<u64>,

    /// "route" (default), "remote_addr" or "uri".
    #[serde(default = "default_limit_key")]
    pub key: String,
}

fn default_limit_mode() -> String {
    "req".to_string()
}

fn default_limit_key() -> String {
    "route".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful probes needed in half-open state to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_duration")]
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_secs: default_open_duration(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_prefix")]
    pub key_prefix: String,

    /// Routes kept in the popularity ranking after each trim.
    #[serde(default = "default_rank_size")]
    pub rank_size: usize,

    /// Backstop expiry on the ranking (7 days).
    #[serde(default = "default_rank_ttl")]
    pub rank_ttl_secs: u64,

    #[serde(default = "default_minute_ttl")]
    pub minute_ttl_secs: u64,

    #[serde(default = "default_second_ttl")]
    pub second_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_metrics_prefix(),
            rank_size: default_rank_size(),
            rank_ttl_secs: default_rank_ttl(),
            minute_ttl_secs: default_minute_ttl(),
            second_ttl_secs: default_second_ttl(),
        }
    }
}

fn default_metrics_prefix() -> String {
    "gateway:metrics:".to_string()
}

fn default_rank_size() -> usize {
    10
}

fn default_rank_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_minute_ttl() -> u64 {
    300
}

fn default_second_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRelayConfig {
    /// Capped list of recent events for the live dashboard.
    #[serde(default = "default_recent_key")]
    pub recent_key: String,

    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Outbound stream consumed by the log storage service.
    #[serde(default = "default_log_queue")]
    pub queue: String,

    /// While this key exists every completed request is also sampled into the recent list.
    #[serde(default = "default_sample_key")]
    pub sample_key: String,
}

impl Default for LogRelayConfig {
    fn default() -> Self {
        Self {
            recent_key: default_recent_key(),
            recent_capacity: default_recent_capacity(),
            queue: default_log_queue(),
            sample_key: default_sample_key(),
        }
    }
}

fn default_recent_key() -> String {
    "gateway:dashboard:logs".to_string()
}

fn default_recent_capacity() -> usize {
    50
}

fn default_log_queue() -> String {
    "gateway_log_queue".to_string()
}

fn default_sample_key() -> String {
    "gateway:log:sample".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_workers")]
    pub workers: usize,

    /// Jobs beyond this backlog are dropped rather than queued.
    #[serde(default = "default_background_capacity")]
    pub queue_capacity: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            workers: default_background_workers(),
            queue_capacity: default_background_capacity(),
        }
    }
}

fn default_background_workers() -> usize {
    4
}

fn default_background_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Whole-request timeout for backend dispatch.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_upstream_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    2
}

/// A backend route. Selection is by ascending `order`, first path match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Glob over the request path, e.g. `/api/user/**`.
    pub path: String,

    /// Backend base uri, e.g. `http://127.0.0.1:9001`.
    pub uri: String,

    #[serde(default)]
    pub order: i32,

    /// Leading path segments removed before forwarding.
    #[serde(default)]
    pub strip_prefix: usize,
}
