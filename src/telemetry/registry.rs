use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the process-wide Prometheus recorder.
///
/// These are local process metrics for scraping. The shared time-windowed
/// counters used by the dashboard live in the counter store, see
/// [`super::MetricsRecorder`].
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global recorder on first call; later calls reuse it, so
    /// several gateway states in one process (tests) share one registry.
    pub fn install() -> anyhow::Result<Self> {
        if let Some(handle) = HANDLE.get() {
            return Ok(Self {
                handle: handle.clone(),
            });
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        if HANDLE.set(handle.clone()).is_err() {
            // Lost the race to a concurrent install; use the winner's handle.
            let handle = HANDLE.get().cloned().unwrap_or(handle);
            return Ok(Self { handle });
        }
        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

        describe();
        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Backend request duration"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );

    // guards
    describe_counter!(
        "gateway_filter_rejected_total",
        Unit::Count,
        "Requests short-circuited by a filter"
    );
    describe_counter!(
        "gateway_policy_blocked_total",
        Unit::Count,
        "Requests blocked by the traffic policy"
    );

    // side effects
    describe_counter!(
        "gateway_store_errors_total",
        Unit::Count,
        "Failed or timed out counter store operations"
    );
    describe_counter!(
        "gateway_background_dropped_total",
        Unit::Count,
        "Background jobs dropped because the queue was full"
    );
    describe_counter!(
        "gateway_side_effect_errors_total",
        Unit::Count,
        "Metrics or log relay writes that failed and were discarded"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
    describe_counter!(
        "gateway_config_reloads_total",
        Unit::Count,
        "Route reloads by source and result"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let first = Metrics::install().unwrap();
        let second = Metrics::install().unwrap();
        metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
        let rendered = second.render();
        assert!(rendered.contains("gateway_connections_total"));
        assert_eq!(first.render().is_empty(), rendered.is_empty());
    }
}
