use crate::routing::CompiledRoute;
use bytes::Bytes;
use chrono::{DateTime, Local};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// JSON response with the given status. Never fails: the only header set is static.
pub fn json_response(status: StatusCode, body: &Value) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// `{"code": <status>, "msg": <msg>}`
pub fn error_body(status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
    json_response(
        status,
        &serde_json::json!({ "code": status.as_u16(), "msg": msg }),
    )
}

/// Caller identity established by a validated token.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub claims: Map<String, Value>,
}

/// Per-request state threaded through every pipeline stage.
///
/// Owned by the handler for the lifetime of one request. Filters read the
/// request snapshot and write the attributes below; headers are the outbound
/// set forwarded to the backend.
pub struct Exchange {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// TCP peer address. Guards use this rather than forwarded headers.
    pub client_ip: IpAddr,
    pub start: Instant,
    /// Wall-clock arrival time for the access log.
    pub request_time: DateTime<Local>,
    pub route: Option<Arc<CompiledRoute>>,
    pub identity: Option<Identity>,
    /// A guard already emitted a recent-events record for this request.
    pub already_logged: bool,
    /// Filter that produced the response, if the pipeline was cut short.
    pub rejected_by: Option<&'static str>,
    /// From the inbound `sw8` tracing header.
    pub trace_id: Option<String>,
    pub upstream_start: Option<Instant>,
}

impl Exchange {
    pub fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        peer_addr: SocketAddr,
    ) -> Self {
        let trace_id = headers
            .get("sw8")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

        Self {
            method,
            path,
            query,
            headers,
            client_ip: peer_addr.ip().to_canonical(),
            start: Instant::now(),
            request_time: Local::now(),
            route: None,
            identity: None,
            already_logged: false,
            rejected_by: None,
            trace_id,
            upstream_start: None,
        }
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.id.as_str())
    }

    pub fn short_circuited(&self) -> bool {
        self.rejected_by.is_some()
    }

    /// First value of a query parameter, without percent-decoding.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Local Prometheus series for the finished request.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);
        let route = self.route_id().unwrap_or("_no_route").to_owned();

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => route.clone(),
            "method" => self.method.as_str().to_owned(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => route.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "route" => route,
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}
