use crate::error::GatewayError;
use crate::proxy::context::{error_body, BoxBody, Exchange};
use crate::proxy::filter::{Filter, FilterResult};
use crate::relay::{AccessLogEvent, Category, RecentEvent};
use crate::server::GatewayState;
use crate::telemetry::RequestSample;
use chrono::Local;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Status recorded when the client goes away before a response is produced.
const CLIENT_CLOSED: u16 = 499;

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH — resolve the backend route (may be none)
/// 2. ON_REQUEST  — filter chain in priority order (waf, replay, auth, traffic)
/// 3. UPSTREAM    — forward to the backend with a bounded timeout
/// 4. LOG         — local metrics, access line, shared counters and log relay
///
/// LOG runs exactly once per request, whichever phase produced the response,
/// including when the connection is dropped mid-flight.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut headers = parts.headers;
    inject_forwarded_headers(&mut headers, peer_addr, &host);

    let ex = Exchange::new(
        parts.method,
        parts.uri.path().to_string(),
        parts.uri.query().map(str::to_string),
        headers,
        peer_addr,
    );
    let mut completion = Completion {
        state: &state,
        ex,
        done: false,
    };
    let ex = &mut completion.ex;

    ex.route = state.routes.load().match_route(&ex.path);

    let resp = match phase_on_request(&state.filters, ex).await {
        Some(resp) => resp,
        None => phase_upstream(&state, ex, body).await,
    };

    completion.finish(resp.status().as_u16());
    Ok(resp)
}

/// Runs LOG on drop unless the request already finished normally.
struct Completion<'a> {
    state: &'a GatewayState,
    ex: Exchange,
    done: bool,
}

impl Completion<'_> {
    fn finish(&mut self, status: u16) {
        self.done = true;
        phase_log(self.state, &self.ex, status);
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!(
                "proxy: request cancelled before completion, client_ip={}, path={}",
                self.ex.client_ip, self.ex.path
            );
            self.finish(CLIENT_CLOSED);
        }
    }
}

async fn phase_on_request(filters: &[Filter], ex: &mut Exchange) -> Option<Response<BoxBody>> {
    for filter in filters {
        if let FilterResult::Reject(resp) = filter.on_request(ex).await {
            return Some(resp);
        }
    }
    None
}

/// Forward to the resolved route. The outcome is reported back to the policy
/// engine: 5xx and transport failures count as failures.
async fn phase_upstream(
    state: &GatewayState,
    ex: &mut Exchange,
    body: Incoming,
) -> Response<BoxBody> {
    let route = match ex.route.clone() {
        Some(route) => route,
        None => {
            debug!("proxy: no route matched, path={}", ex.path);
            ex.rejected_by = Some("route");
            return reject(GatewayError::NoRouteMatch);
        }
    };

    let uri = match route.upstream_uri(&ex.path, ex.query.as_deref()) {
        Ok(uri) => uri,
        Err(e) => {
            warn!("proxy: cannot build upstream uri, route={}, error={}", route.id, e);
            return reject(e);
        }
    };

    let mut headers = ex.headers.clone();
    remove_hop_headers(&mut headers);
    // The client derives Host from the upstream uri.
    headers.remove(HOST);

    let mut upstream_req = Request::new(body.boxed());
    *upstream_req.method_mut() = ex.method.clone();
    *upstream_req.uri_mut() = uri;
    *upstream_req.headers_mut() = headers;

    let timeout = Duration::from_secs(state.config.upstream.timeout_secs);
    ex.upstream_start = Some(Instant::now());

    let outcome = match tokio::time::timeout(timeout, state.client.request(upstream_req)).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(GatewayError::UpstreamConnect(e.to_string())),
        Err(_) => Err(GatewayError::UpstreamTimeout),
    };

    match outcome {
        Ok(resp) => {
            state
                .policy
                .report(&route.id, resp.status().is_server_error());
            build_downstream_response(resp)
        }
        Err(e) => {
            state.policy.report(&route.id, true);
            warn!(
                "proxy: upstream failed, route={}, upstream={}, timeout={}s, error={}",
                route.id,
                route.upstream,
                timeout.as_secs(),
                e
            );
            reject(e)
        }
    }
}

fn reject(e: GatewayError) -> Response<BoxBody> {
    error_body(e.status(), e.public_message())
}

/// Local metrics and the access line run inline; everything that touches the
/// shared store is one background job, so no store latency or failure can
/// reach the response.
fn phase_log(state: &GatewayState, ex: &Exchange, status: u16) {
    ex.finalize_metrics(status);

    let latency_ms = ex.elapsed_ms();
    let user = ex.identity.as_ref().map(|i| i.subject.as_str());

    tracing::info!(
        client_ip = %ex.client_ip,
        method = %ex.method,
        path = %ex.path,
        status = status,
        route = %ex.route_id().unwrap_or("-"),
        user = %user.unwrap_or("-"),
        rejected_by = %ex.rejected_by.unwrap_or("-"),
        latency_ms = latency_ms,
        "access"
    );

    let now = Local::now();
    let source = ex.client_ip.to_string();
    let sample = RequestSample {
        status,
        latency_ms,
        route_id: ex.route_id().map(str::to_string),
    };

    let access = (!ex.short_circuited()).then(|| AccessLogEvent {
        trace_id: ex.trace_id.clone(),
        user_id: user.map(str::to_string),
        ip: source.clone(),
        path: ex.path.clone(),
        method: ex.method.to_string(),
        status,
        response_time: latency_ms,
        request_time: ex.request_time.to_rfc3339(),
        gateway: state.hostname.to_string(),
    });

    // Guards that rejected already wrote their own record.
    let reject = (ex.short_circuited() && !ex.already_logged).then(|| {
        RecentEvent::new(
            &now,
            &source,
            Category::Reject,
            &format!("{} {} -> {}", ex.method, ex.path, status),
        )
    });
    let completed = access.as_ref().map(|_| AccessLine {
        summary: format!("{} {} {} {}ms", ex.method, ex.path, status, latency_ms),
        detail: format!(
            " route={} user={}",
            ex.route_id().unwrap_or("-"),
            user.unwrap_or("-")
        ),
    });

    let recorder = state.recorder.clone();
    let relay = state.relay.clone();
    state.background.submit("post_process", async move {
        if let Err(e) = recorder.record(&sample, &now).await {
            warn!("telemetry: counters write failed, error={}", e);
            metrics::counter!("gateway_side_effect_errors_total", "kind" => "metrics").increment(1);
        }

        if let Some(event) = access {
            if let Err(e) = relay.publish(&event).await {
                warn!("relay: publish failed, path={}, error={}", event.path, e);
                metrics::counter!("gateway_side_effect_errors_total", "kind" => "relay_publish")
                    .increment(1);
            }
        }

        if let Some(event) = reject {
            if let Err(e) = relay.push_recent(&event).await {
                warn!("relay: recent push failed, type={}, error={}", event.category, e);
                metrics::counter!("gateway_side_effect_errors_total", "kind" => "relay_recent")
                    .increment(1);
            }
        }

        if let Some(line) = completed {
            // Sampling mode widens the record, it never gates it.
            let msg = match relay.sampling_enabled().await {
                Ok(true) => line.summary + &line.detail,
                Ok(false) => line.summary,
                Err(e) => {
                    debug!("relay: sampling toggle read failed, error={}", e);
                    line.summary
                }
            };
            let event = RecentEvent::new(&now, &source, Category::Access, &msg);
            if let Err(e) = relay.push_recent(&event).await {
                warn!("relay: recent push failed, type={}, error={}", event.category, e);
                metrics::counter!("gateway_side_effect_errors_total", "kind" => "relay_recent")
                    .increment(1);
            }
        }
    });
}

struct AccessLine {
    summary: String,
    detail: String,
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_canonical().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
