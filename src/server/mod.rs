mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::{GatewayState, HttpClient};

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Upper bound on waiting for in-flight connections after shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind and run the proxy listener until `shutdown` flips to `true`.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);
    serve_proxy(listener, state, shutdown, DRAIN_TIMEOUT).await
}

/// Accept loop with graceful drain.
///
/// On shutdown the loop stops accepting, asks every open connection to finish
/// its current request and close, then waits up to `drain_timeout` for them.
pub async fn serve_proxy(
    listener: TcpListener,
    state: GatewayState,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) -> Result<()> {
    // Readable mirror of the active-connections gauge.
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = stopped(&mut shutdown) => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();
        let mut conn_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)));
            let conn = builder.serve_connection_with_upgrades(io, svc);
            tokio::pin!(conn);

            let result = tokio::select! {
                res = conn.as_mut() => res,
                _ = stopped(&mut conn_shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                if !e.to_string().contains("connection closed") {
                    error!("server: proxy: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: waiting for {} active connections to drain", active);
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout ({}s), {} connections still active",
                drain_timeout.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Resolves once shutdown has been requested, or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Admin listener: health, readiness, Prometheus and dashboard reads.
pub async fn run_admin_server(
    listen: &str,
    state: GatewayState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);
    serve_admin(listener, state, shutdown).await
}

pub async fn serve_admin(
    listener: TcpListener,
    state: GatewayState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let (stream, _) = tokio::select! {
            result = listener.accept() => result?,
            _ = stopped(&mut shutdown) => return Ok(()),
        };
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
