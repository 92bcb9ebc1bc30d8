use super::{FilterResult, Whitelist};
use crate::config::ReplayConfig;
use crate::proxy::context::{error_body, Exchange};
use crate::relay::{Category, LogRelay};
use crate::store::SharedStore;
use http::StatusCode;

const TIMESTAMP_HEADER: &str = "timestamp";
const NONCE_HEADER: &str = "nonce";

/// Why a request failed replay protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayReject {
    MissingHeaders,
    InvalidTimestamp,
    /// Older than the window or too far ahead of local time.
    Expired,
    Replayed,
    /// The nonce could not be recorded; the check fails closed.
    Unavailable,
}

impl ReplayReject {
    pub fn status(&self) -> StatusCode {
        match self {
            ReplayReject::MissingHeaders | ReplayReject::InvalidTimestamp => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::FORBIDDEN,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ReplayReject::MissingHeaders => "missing security headers",
            ReplayReject::InvalidTimestamp => "invalid timestamp",
            ReplayReject::Expired => "request expired",
            ReplayReject::Replayed => "replay detected",
            ReplayReject::Unavailable => "replay protection unavailable",
        }
    }
}

/// One-time nonce plus bounded timestamp check.
///
/// The nonce is claimed with a single set-if-absent on the shared store, so
/// of any number of concurrent requests carrying it exactly one wins.
pub struct NonceGuard {
    config: ReplayConfig,
    whitelist: Whitelist,
    extra_whitelist: Whitelist,
    store: SharedStore,
    relay: LogRelay,
}

impl NonceGuard {
    pub fn new(
        config: ReplayConfig,
        whitelist: Whitelist,
        store: SharedStore,
        relay: LogRelay,
    ) -> Self {
        let extra_whitelist = Whitelist::new(config.extra_whitelist.iter().cloned());
        Self {
            config,
            whitelist,
            extra_whitelist,
            store,
            relay,
        }
    }

    fn exempt(&self, path: &str) -> bool {
        !self.config.enabled || self.whitelist.matches(path) || self.extra_whitelist.matches(path)
    }

    pub fn nonce_key(&self, nonce: &str) -> String {
        format!("{}{}", self.config.key_prefix, nonce)
    }

    /// Run the check against an explicit clock reading (epoch millis).
    pub async fn verify(
        &self,
        path: &str,
        timestamp: Option<&str>,
        nonce: Option<&str>,
        now_ms: i64,
    ) -> Result<(), ReplayReject> {
        if self.exempt(path) {
            return Ok(());
        }

        if let (Some(bypass), Some(nonce)) = (self.config.bypass_nonce.as_deref(), nonce) {
            if nonce == bypass {
                return Ok(());
            }
        }

        let (timestamp, nonce) = match (
            timestamp.map(str::trim).filter(|s| !s.is_empty()),
            nonce.map(str::trim).filter(|s| !s.is_empty()),
        ) {
            (Some(t), Some(n)) => (t, n),
            _ => return Err(ReplayReject::MissingHeaders),
        };

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| ReplayReject::InvalidTimestamp)?;
        let max_age_ms = self.config.max_age_secs as i64 * 1000;
        let max_skew_ms = self.config.max_future_skew_secs as i64 * 1000;
        if now_ms.saturating_sub(ts) > max_age_ms || ts.saturating_sub(now_ms) > max_skew_ms {
            return Err(ReplayReject::Expired);
        }

        match self
            .store
            .set_if_absent(&self.nonce_key(nonce), "1", self.config.nonce_ttl_secs)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReplayReject::Replayed),
            Err(e) => {
                tracing::warn!("filter: replay: nonce store failed, failing closed, error={}", e);
                Err(ReplayReject::Unavailable)
            }
        }
    }

    pub(super) async fn on_request(&self, ex: &mut Exchange) -> FilterResult {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let result = self
            .verify(
                &ex.path,
                ex.header_str(TIMESTAMP_HEADER),
                ex.header_str(NONCE_HEADER),
                now_ms,
            )
            .await;

        match result {
            Ok(()) => FilterResult::Continue,
            Err(reject) => {
                tracing::debug!(
                    "filter: replay: rejected, client_ip={}, path={}, reason={}",
                    ex.client_ip,
                    ex.path,
                    reject.message()
                );
                self.relay
                    .record(&ex.client_ip.to_string(), Category::Replay, reject.message());
                ex.already_logged = true;
                FilterResult::Reject(error_body(reject.status(), reject.message()))
            }
        }
    }
}
