use crate::{config, server, store};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Time given to queued metrics and log writes after the listeners stop.
const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → connect → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let gateway = config::GatewayConfig::load(&args.config_path)?;
    let store = store::connect(&gateway.store).await?;
    let state = server::GatewayState::new(gateway, store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_handle = tokio::spawn({
        let listen = args.admin_listen.clone();
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = server::run_admin_server(&listen, state, shutdown).await {
                tracing::error!("server: admin server error: {}", e);
            }
        }
    });

    let reload_handle = tokio::spawn(reload_on_hangup(
        state.clone(),
        args.config_path.clone(),
        shutdown_rx.clone(),
    ));

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let mut proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        async move { server::run_proxy_server(&listen, state, shutdown_rx).await }
    });

    tokio::select! {
        _ = wait_for_signal() => {}
        res = &mut proxy_handle => {
            // The listener failed to start or died; nothing left to drain.
            admin_handle.abort();
            reload_handle.abort();
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("proxy task failed: {}", e)),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy exited with error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }
    let _ = admin_handle.await;
    let _ = reload_handle.await;
    state.background.shutdown(BACKGROUND_DRAIN_TIMEOUT).await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// SIGHUP re-reads the config file and swaps in its routes.
#[cfg(unix)]
async fn reload_on_hangup(
    state: server::GatewayState,
    path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!("config: cannot install SIGHUP handler, reload disabled, error={}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match state.reload_routes(&path).await {
                    Ok(count) => {
                        tracing::info!("config: reload applied, path={}, routes={}", path.display(), count);
                        metrics::counter!(
                            "gateway_config_reloads_total",
                            "source" => "sighup", "result" => "success",
                        ).increment(1);
                    }
                    Err(e) => {
                        tracing::warn!("config: reload rejected, keeping current routes, error={}", e);
                        metrics::counter!(
                            "gateway_config_reloads_total",
                            "source" => "sighup", "result" => "failure",
                        ).increment(1);
                    }
                }
            }
            _ = super::stopped(&mut shutdown) => return,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _state: server::GatewayState,
    _path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    super::stopped(&mut shutdown).await;
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("server: cannot listen for SIGINT, error={}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: cannot install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
