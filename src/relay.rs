//! Log relay: the live recent-events list and the outbound access-log queue.

use crate::background::Background;
use crate::config::LogRelayConfig;
use crate::store::SharedStore;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Category tag on a recent-events record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Waf,
    Replay,
    Auth,
    /// Rate limit block from the traffic policy.
    Flow,
    /// Circuit-open / degrade block from the traffic policy.
    Fuse,
    /// Short-circuit not already recorded by a guard (e.g. no route).
    Reject,
    /// Completed request.
    Access,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Waf => "WAF",
            Category::Replay => "REPLAY",
            Category::Auth => "AUTH",
            Category::Flow => "FLOW",
            Category::Fuse => "FUSE",
            Category::Reject => "REJECT",
            Category::Access => "ACCESS",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the capped recent-events list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEvent {
    /// Local wall-clock time, `HH:mm:ss`.
    pub time: String,
    pub source: String,
    #[serde(rename = "type")]
    pub category: String,
    pub msg: String,
}

impl RecentEvent {
    pub fn new(now: &DateTime<Local>, source: &str, category: Category, msg: &str) -> Self {
        Self {
            time: now.format("%H:%M:%S").to_string(),
            source: source.to_string(),
            category: category.as_str().to_string(),
            msg: msg.to_string(),
        }
    }
}

/// Access-log event for the durable log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub ip: String,
    pub path: String,
    pub method: String,
    pub status: u16,
    /// Milliseconds.
    pub response_time: u64,
    /// RFC 3339 start time.
    pub request_time: String,
    /// Hostname of the gateway instance that served the request.
    pub gateway: String,
}

/// Best-effort emission of log records. Nothing here can fail a request:
/// the fire-and-forget entry points hand work to the background pool and
/// the async ones report errors to the caller, which logs and drops them.
#[derive(Clone)]
pub struct LogRelay {
    store: SharedStore,
    background: Background,
    config: LogRelayConfig,
}

impl LogRelay {
    pub fn new(store: SharedStore, background: Background, config: LogRelayConfig) -> Self {
        Self {
            store,
            background,
            config,
        }
    }

    /// Record a guard rejection without waiting for the store.
    pub fn record(&self, source: &str, category: Category, msg: &str) {
        let event = RecentEvent::new(&Local::now(), source, category, msg);
        let relay = self.clone();
        self.background.submit("relay_recent", async move {
            if let Err(e) = relay.push_recent(&event).await {
                warn!("relay: recent push failed, type={}, error={}", event.category, e);
                metrics::counter!("gateway_side_effect_errors_total", "kind" => "relay_recent")
                    .increment(1);
            }
        });
    }

    /// LPUSH + LTRIM so the list never exceeds its capacity.
    pub async fn push_recent(&self, event: &RecentEvent) -> crate::store::Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| crate::store::StoreError::Codec(e.to_string()))?;
        self.store
            .list_push_trim(&self.config.recent_key, &payload, self.config.recent_capacity)
            .await
    }

    pub async fn publish(&self, event: &AccessLogEvent) -> crate::store::Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| crate::store::StoreError::Codec(e.to_string()))?;
        self.store.enqueue(&self.config.queue, &payload).await
    }

    /// Whether the operator has switched on detailed access records. Read from
    /// the store each time so every instance sees the same toggle.
    pub async fn sampling_enabled(&self) -> crate::store::Result<bool> {
        self.store.exists(&self.config.sample_key).await
    }

    /// Newest `limit` records. Entries that fail to parse are skipped.
    pub async fn recent(&self, limit: usize) -> crate::store::Result<Vec<RecentEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .list_range(&self.config.recent_key, 0, limit as isize - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackgroundConfig;
    use crate::store::{CounterStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn relay(store: Arc<MemoryStore>) -> (LogRelay, Background) {
        let background = Background::start(&BackgroundConfig::default());
        let relay = LogRelay::new(store, background.clone(), LogRelayConfig::default());
        (relay, background)
    }

    #[test]
    fn test_recent_event_shape() {
        let now = Local::now();
        let event = RecentEvent::new(&now, "10.0.0.7", Category::Auth, "Token Invalid");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["source"], "10.0.0.7");
        assert_eq!(json["type"], "AUTH");
        assert_eq!(json["msg"], "Token Invalid");
        assert_eq!(json["time"].as_str().unwrap().len(), 8);
    }

    #[test]
    fn test_access_event_omits_missing_ids() {
        let event = AccessLogEvent {
            trace_id: None,
            user_id: None,
            ip: "127.0.0.1".into(),
            path: "/api/user/1".into(),
            method: "GET".into(),
            status: 200,
            response_time: 4,
            request_time: "2026-01-01T00:00:00+00:00".into(),
            gateway: "gw-1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("trace_id"));
        assert!(!json.contains("user_id"));
        assert!(json.contains(r#""status":200"#));
    }

    #[tokio::test]
    async fn test_record_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let (relay, background) = relay(store);
        for i in 0..60 {
            relay.record("10.0.0.1", Category::Waf, &format!("event {}", i));
            // Keep submission order deterministic across workers.
            background.wait_idle(Duration::from_secs(1)).await;
        }

        let all = relay.recent(100).await.unwrap();
        assert_eq!(all.len(), 50);
        assert_eq!(all[0].msg, "event 59");
        assert_eq!(relay.recent(20).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_publish_to_queue() {
        let store = Arc::new(MemoryStore::new());
        let (relay, _background) = relay(store.clone());
        let event = AccessLogEvent {
            trace_id: Some("abc".into()),
            user_id: Some("42".into()),
            ip: "127.0.0.1".into(),
            path: "/api/order".into(),
            method: "POST".into(),
            status: 201,
            response_time: 9,
            request_time: "2026-01-01T00:00:00+00:00".into(),
            gateway: "gw-1".into(),
        };
        relay.publish(&event).await.unwrap();

        let queued = store.queued("gateway_log_queue");
        assert_eq!(queued.len(), 1);
        let parsed: AccessLogEvent = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn test_sampling_toggle() {
        let store = Arc::new(MemoryStore::new());
        let (relay, _background) = relay(store.clone());
        assert!(!relay.sampling_enabled().await.unwrap());
        store.set("gateway:log:sample", "1", Some(60)).await.unwrap();
        assert!(relay.sampling_enabled().await.unwrap());
    }
}
