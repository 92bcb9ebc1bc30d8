use super::FilterResult;
use crate::config::WafConfig;
use crate::proxy::context::{error_body, Exchange};
use crate::relay::{Category, LogRelay};
use crate::store::SharedStore;
use http::StatusCode;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Operator kill-switch for a set of client ranges.
///
/// The toggle lives in the shared store and is read on every request so all
/// instances flip together. A failed read leaves the gate off.
pub struct WafGate {
    store: SharedStore,
    relay: LogRelay,
    toggle_key: String,
    ranges: Vec<IpNetwork>,
}

impl WafGate {
    pub fn new(config: &WafConfig, store: SharedStore, relay: LogRelay) -> anyhow::Result<Self> {
        let ranges = config
            .blocked_ranges
            .iter()
            .map(|r| {
                r.parse::<IpNetwork>()
                    .map_err(|e| anyhow::anyhow!("waf: invalid range '{}': {}", r, e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            store,
            relay,
            toggle_key: config.toggle_key.clone(),
            ranges,
        })
    }

    pub fn is_blocked_ip(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|net| net.contains(*ip))
    }

    async fn enabled(&self) -> bool {
        match self.store.get(&self.toggle_key).await {
            Ok(v) => v.as_deref() == Some("true"),
            Err(e) => {
                tracing::warn!("filter: waf: toggle read failed, treating as off, error={}", e);
                false
            }
        }
    }

    pub(super) async fn on_request(&self, ex: &mut Exchange) -> FilterResult {
        if self.ranges.is_empty() || !self.enabled().await {
            return FilterResult::Continue;
        }
        if !self.is_blocked_ip(&ex.client_ip) {
            return FilterResult::Continue;
        }

        tracing::debug!("filter: waf: blocked, client_ip={}, path={}", ex.client_ip, ex.path);
        self.relay
            .record(&ex.client_ip.to_string(), Category::Waf, "IP Blocked by Firewall");
        ex.already_logged = true;
        FilterResult::Reject(error_body(StatusCode::FORBIDDEN, "IP blocked by firewall"))
    }
}
