use super::GatewayState;
use crate::proxy::context::{error_body, full_body, json_response, BoxBody};
use chrono::Local;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};
use serde::Serialize;
use serde_json::Value;

/// Records returned by the recent-logs endpoint.
const DASHBOARD_LOG_LIMIT: usize = 20;

pub async fn handle_admin<B>(
    req: Request<B>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let resp = match req.uri().path() {
        "/health" | "/healthz" => json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" })),

        "/ready" | "/readyz" => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ready",
                "routes": state.routes.load().len(),
                "store": state.store.backend(),
                "background_pending": state.background.pending(),
            }),
        ),

        "/metrics" => {
            let mut resp = Response::new(full_body(state.metrics.render()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            resp
        }

        "/dashboard/metrics/realtime" => match state.recorder.snapshot(&Local::now()).await {
            Ok(snapshot) => success(&snapshot),
            Err(e) => {
                tracing::warn!("server: admin: realtime snapshot failed, error={}", e);
                error_body(StatusCode::SERVICE_UNAVAILABLE, "metrics unavailable")
            }
        },

        "/dashboard/metrics/logs" => match state.relay.recent(DASHBOARD_LOG_LIMIT).await {
            Ok(events) => success(&events),
            Err(e) => {
                tracing::warn!("server: admin: recent logs read failed, error={}", e);
                error_body(StatusCode::SERVICE_UNAVAILABLE, "logs unavailable")
            }
        },

        _ => error_body(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(resp)
}

/// Dashboard envelope: `{"code":200,"msg":"success","data":...}`.
fn success<T: Serialize>(data: &T) -> Response<BoxBody> {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "code": 200, "msg": "success", "data": data }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::relay::Category;
    use crate::store::{CounterStore, MemoryStore};
    use crate::telemetry::RequestSample;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;

    async fn get(state: &GatewayState, path: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(path).body(()).unwrap();
        let resp = handle_admin(req, state.clone()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn state(store: Arc<MemoryStore>) -> GatewayState {
        GatewayState::new(GatewayConfig::default(), store).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_not_found() {
        let state = state(Arc::new(MemoryStore::new()));
        assert_eq!(get(&state, "/health").await.0, StatusCode::OK);
        let (status, body) = get(&state, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(get(&state, "/nope").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_realtime_envelope() {
        let store = Arc::new(MemoryStore::new());
        let state = state(store);
        let sample = RequestSample {
            status: 500,
            latency_ms: 40,
            route_id: Some("user".into()),
        };
        state.recorder.record(&sample, &Local::now()).await.unwrap();

        let (status, body) = get(&state, "/dashboard/metrics/realtime").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
        assert_eq!(body["msg"], "success");
        assert_eq!(body["data"]["topRoutes"][0]["name"], "user");
        assert!(body["data"]["errorRate"].as_str().unwrap().ends_with('%'));
    }

    #[tokio::test]
    async fn test_logs_limited_to_twenty() {
        let store = Arc::new(MemoryStore::new());
        let state = state(store.clone());
        for i in 0..30 {
            state.relay.record("10.0.0.1", Category::Auth, &format!("event {}", i));
        }
        assert!(state.background.wait_idle(Duration::from_secs(5)).await);

        let (_, body) = get(&state, "/dashboard/metrics/logs").await;
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 20);
        assert_eq!(data[0]["type"], "AUTH");
        assert_eq!(
            store.list_range("gateway:dashboard:logs", 0, -1).await.unwrap().len(),
            30
        );
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let state = state(Arc::new(MemoryStore::new()));
        let req = Request::builder().uri("/metrics").body(()).unwrap();
        let resp = handle_admin(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
