use crate::config::MetricsConfig;
use crate::store::{SharedStore, StoreOp};
use chrono::{DateTime, TimeZone};

/// Outcome of one finished request, as seen by the shared counters.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    pub status: u16,
    pub latency_ms: u64,
    /// Resolved route, if any. Feeds the popularity ranking.
    pub route_id: Option<String>,
}

impl RequestSample {
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Store keys for the windows a given instant falls into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKeys {
    pub req_count: String,
    pub latency_sum: String,
    pub error_count: String,
    pub qps: String,
}

/// Minute bucket label, `HHmm`.
pub fn minute_window<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%H%M").to_string()
}

/// Second bucket label, `HH:mm:ss`.
pub fn second_window<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%H:%M:%S").to_string()
}

/// Writes time-bucketed traffic counters and the route ranking.
///
/// Every write is an atomic store primitive issued in one pipelined batch, so
/// concurrent gateway instances aggregate into the same buckets without any
/// coordination. Bucket expiry is set only by the write that creates the bucket.
#[derive(Clone)]
pub struct MetricsRecorder {
    pub(super) store: SharedStore,
    pub(super) config: MetricsConfig,
}

impl MetricsRecorder {
    pub fn new(store: SharedStore, config: MetricsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn rank_key(&self) -> String {
        format!("{}routes:rank", self.config.key_prefix)
    }

    pub fn window_keys<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> WindowKeys
    where
        Tz::Offset: std::fmt::Display,
    {
        let prefix = &self.config.key_prefix;
        let minute = minute_window(now);
        WindowKeys {
            req_count: format!("{}req_count:{}", prefix, minute),
            latency_sum: format!("{}latency_sum:{}", prefix, minute),
            error_count: format!("{}error_count:{}", prefix, minute),
            qps: format!("{}qps:{}", prefix, second_window(now)),
        }
    }

    /// The batch of independent writes for one request.
    pub fn build_ops<Tz: TimeZone>(&self, sample: &RequestSample, now: &DateTime<Tz>) -> Vec<StoreOp>
    where
        Tz::Offset: std::fmt::Display,
    {
        let keys = self.window_keys(now);
        let minute_ttl = self.config.minute_ttl_secs;
        let mut ops = Vec::with_capacity(7);

        ops.push(StoreOp::Incr {
            key: keys.req_count,
            delta: 1,
            ttl_secs: minute_ttl,
        });
        ops.push(StoreOp::Incr {
            key: keys.latency_sum,
            delta: sample.latency_ms as i64,
            ttl_secs: minute_ttl,
        });
        if sample.is_error() {
            ops.push(StoreOp::Incr {
                key: keys.error_count,
                delta: 1,
                ttl_secs: minute_ttl,
            });
        }
        ops.push(StoreOp::Incr {
            key: keys.qps,
            delta: 1,
            ttl_secs: self.config.second_ttl_secs,
        });

        if let Some(route_id) = &sample.route_id {
            let rank = self.rank_key();
            ops.push(StoreOp::ZIncr {
                key: rank.clone(),
                member: route_id.clone(),
                delta: 1.0,
            });
            ops.push(StoreOp::ZTrimTop {
                key: rank.clone(),
                keep: self.config.rank_size,
            });
            ops.push(StoreOp::Expire {
                key: rank,
                ttl_secs: self.config.rank_ttl_secs,
            });
        }
        ops
    }

    /// Write the counters for one request. Callers treat failure as
    /// best-effort: log it and move on.
    pub async fn record<Tz: TimeZone>(
        &self,
        sample: &RequestSample,
        now: &DateTime<Tz>,
    ) -> crate::store::Result<()>
    where
        Tz::Offset: std::fmt::Display,
    {
        let ops = self.build_ops(sample, now);
        self.store.apply(ops).await
    }
}
