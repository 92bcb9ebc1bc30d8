//! Bounded pool for fire-and-forget side effects.
//!
//! Metrics and log relay writes are submitted here after the response has been
//! produced. The request path only pays for a `try_send`: when the queue is
//! full the job is dropped and counted, never awaited.

use crate::config::BackgroundConfig;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

#[derive(Clone)]
pub struct Background {
    tx: mpsc::Sender<Job>,
    /// Submitted but not yet finished.
    pending: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Background {
    /// Spawn the worker tasks. Must be called from within a tokio runtime.
    pub fn start(config: &BackgroundConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, _) = broadcast::channel(1);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    rx.clone(),
                    pending.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        info!(
            "background: started, workers={}, queue_capacity={}",
            config.workers.max(1),
            config.queue_capacity
        );

        Self {
            tx,
            pending,
            shutdown_tx,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Queue a job without waiting. Returns `false` if it was dropped.
    pub fn submit<F>(&self, kind: &'static str, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                warn!("background: job dropped, kind={}, reason={}", kind, reason);
                metrics::counter!("gateway_background_dropped_total", "kind" => kind).increment(1);
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every submitted job has finished, up to `timeout`.
    /// Returns `true` if the queue went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Stop the workers after they finish what is already queued.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(());
        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let join_all = futures_util::future::join_all(workers);
        match tokio::time::timeout(timeout, join_all).await {
            Ok(_) => info!("background: drained, pending={}", self.pending()),
            Err(_) => warn!(
                "background: drain timeout ({}s), pending={}",
                timeout.as_secs(),
                self.pending()
            ),
        }
    }
}

async fn run_worker(
    id: usize,
    rx: SharedReceiver,
    pending: Arc<AtomicUsize>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        match next {
            Some(job) => {
                job.await;
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            None => break,
        }
    }

    // Finish whatever is still queued so shutdown does not lose writes.
    loop {
        let job = match rx.lock().await.try_recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        job.await;
        pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!("background: worker {} stopped", id);
}
