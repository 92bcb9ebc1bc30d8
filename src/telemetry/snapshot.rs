//! Read-side aggregation over the shared windows, computed at query time.

use super::recorder::MetricsRecorder;
use chrono::{DateTime, Duration, TimeZone};
use serde::Serialize;

/// Seconds averaged for the instantaneous throughput figure.
const QPS_SPAN_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeSnapshot {
    pub qps: u64,
    /// Mean latency in milliseconds over the current minute.
    pub latency: u64,
    /// Percentage with two decimals, e.g. `"1.25%"`.
    pub error_rate: String,
    pub top_routes: Vec<RouteShare>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteShare {
    pub name: String,
    pub count: u64,
    /// Relative to the most popular route, 0-100.
    pub percent: u64,
}

fn parse_count(raw: &Option<String>) -> u64 {
    raw.as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
        .unwrap_or(0)
}

pub fn format_error_rate(errors: u64, total: u64) -> String {
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", errors as f64 / total as f64 * 100.0)
}

/// Rank entries scaled against the highest score. A zero top score is
/// treated as one so every share stays finite.
pub fn route_shares(ranked: &[(String, f64)]) -> Vec<RouteShare> {
    let max = match ranked.first() {
        Some((_, score)) if *score > 0.0 => *score,
        Some(_) => 1.0,
        None => return Vec::new(),
    };
    ranked
        .iter()
        .map(|(name, score)| RouteShare {
            name: name.clone(),
            count: score.max(0.0) as u64,
            percent: (score / max * 100.0) as u64,
        })
        .collect()
}

impl MetricsRecorder {
    /// Build the dashboard view for `now`: mean of the last five one-second
    /// buckets, then latency and error rate for the current minute bucket.
    pub async fn snapshot<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> crate::store::Result<RealtimeSnapshot>
    where
        Tz::Offset: std::fmt::Display,
    {
        let minute = self.window_keys(now);
        let mut keys: Vec<String> = (0..QPS_SPAN_SECS)
            .map(|i| self.window_keys(&(now.clone() - Duration::seconds(i))).qps)
            .collect();
        keys.push(minute.req_count);
        keys.push(minute.latency_sum);
        keys.push(minute.error_count);

        let values = self.store.get_many(&keys).await?;
        let span = QPS_SPAN_SECS as usize;
        let qps_total: u64 = values.iter().take(span).map(parse_count).sum();
        let total = values.get(span).map(parse_count).unwrap_or(0);
        let latency_sum = values.get(span + 1).map(parse_count).unwrap_or(0);
        let errors = values.get(span + 2).map(parse_count).unwrap_or(0);

        let latency = if total > 0 { latency_sum / total } else { 0 };
        let ranked = self
            .store
            .ztop(&self.rank_key(), self.config.rank_size)
            .await?;

        Ok(RealtimeSnapshot {
            qps: qps_total / QPS_SPAN_SECS as u64,
            latency,
            error_rate: format_error_rate(errors, total),
            top_routes: route_shares(&ranked),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::store::{MemoryStore, SharedStore};
    use crate::telemetry::RequestSample;
    use chrono::{Local, NaiveDate};
    use std::sync::Arc;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn test_error_rate_format() {
        assert_eq!(format_error_rate(0, 0), "0.00%");
        assert_eq!(format_error_rate(1, 3), "33.33%");
        assert_eq!(format_error_rate(5, 5), "100.00%");
    }

    #[test]
    fn test_route_shares() {
        let ranked = vec![
            ("a".to_string(), 40.0),
            ("b".to_string(), 10.0),
            ("c".to_string(), 0.0),
        ];
        let shares = route_shares(&ranked);
        assert_eq!(shares[0].percent, 100);
        assert_eq!(shares[1].percent, 25);
        assert_eq!(shares[2].percent, 0);
        assert_eq!(shares[1].count, 10);

        let zero = route_shares(&[("z".to_string(), 0.0)]);
        assert_eq!(zero[0].percent, 0);
        assert!(route_shares(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_empty_store() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let rec = MetricsRecorder::new(store, MetricsConfig::default());
        let snap = rec.snapshot(&at(12, 0, 0)).await.unwrap();
        assert_eq!(snap.qps, 0);
        assert_eq!(snap.latency, 0);
        assert_eq!(snap.error_rate, "0.00%");
        assert!(snap.top_routes.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_aggregates_windows() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let rec = MetricsRecorder::new(store, MetricsConfig::default());

        // 10 requests spread over the last five seconds of the same minute.
        for s in 0..5 {
            for i in 0..2u64 {
                let sample = RequestSample {
                    status: if s == 0 && i == 0 { 502 } else { 200 },
                    latency_ms: 10 + i * 10,
                    route_id: Some(if i == 0 { "orders" } else { "users" }.to_string()),
                };
                rec.record(&sample, &at(12, 30, 20 + s)).await.unwrap();
            }
        }
        // Outside the five-second span, same minute.
        rec.record(
            &RequestSample {
                status: 200,
                latency_ms: 30,
                route_id: Some("orders".into()),
            },
            &at(12, 30, 1),
        )
        .await
        .unwrap();

        let snap = rec.snapshot(&at(12, 30, 24)).await.unwrap();
        assert_eq!(snap.qps, 2);
        // (5 * 10 + 5 * 20 + 30) / 11
        assert_eq!(snap.latency, 180 / 11);
        assert_eq!(snap.error_rate, "9.09%");
        assert_eq!(snap.top_routes[0].name, "orders");
        assert_eq!(snap.top_routes[0].count, 6);
        assert_eq!(snap.top_routes[1].percent, 83);

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("errorRate").is_some());
        assert!(json.get("topRoutes").is_some());
    }
}
