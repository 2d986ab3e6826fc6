//! Download engine
//!
//! A single background driver consumes `queued` jobs strictly FIFO, one at
//! a time. For each job it parses the NZB plan, fans segment fetches out
//! across the pool manager with bounded parallelism, decodes and assembles
//! files in ordinal order, and hands finished jobs to the post-processing
//! callback.
//!
//! The driver sleeps on a coalescing wake signal or a 5 second timer.
//! The queue-wide paused flag (owned by the queue store, written by the
//! VPN coordinator) is checked before taking work and at every segment
//! dispatch site; the engine itself never flips it.

mod job;

use crate::nntp::PoolManager;
use crate::queue::QueueStore;
use crate::types::DownloadId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Driver poll interval when no wake arrives
const IDLE_TICK: Duration = Duration::from_secs(5);
/// Literal failure reason recorded for user cancellation
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Handoff invoked after a job reaches `processing`; the receiver owns the
/// final `completed`/`failed` transition.
pub type ReadyHandler = Arc<dyn Fn(crate::queue::Download) + Send + Sync>;

pub(crate) struct EngineInner {
    pub(crate) pool_manager: Arc<PoolManager>,
    pub(crate) store: Arc<QueueStore>,
    pub(crate) incomplete_dir: PathBuf,
    pub(crate) workers: usize,
    pub(crate) wake: Notify,
    pub(crate) cancel: CancellationToken,
    pub(crate) active_jobs: Mutex<HashMap<String, CancellationToken>>,
    pub(crate) current_speed: AtomicU64,
    pub(crate) on_ready: Mutex<Option<ReadyHandler>>,
}

/// The download engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine downloading into `incomplete_dir` with `workers`
    /// segments in flight per file (0 falls back to 8).
    pub fn new(
        pool_manager: Arc<PoolManager>,
        store: Arc<QueueStore>,
        incomplete_dir: PathBuf,
        workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                pool_manager,
                store,
                incomplete_dir,
                workers: if workers == 0 { 8 } else { workers },
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                active_jobs: Mutex::new(HashMap::new()),
                current_speed: AtomicU64::new(0),
                on_ready: Mutex::new(None),
            }),
        }
    }

    /// Register the post-processing handoff
    pub fn on_ready(&self, handler: impl Fn(crate::queue::Download) + Send + Sync + 'static) {
        *self.lock_handler() = Some(Arc::new(handler));
    }

    /// Spawn the background driver
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive().await })
    }

    /// Stop the engine: cancels the driver and every in-flight job scope
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Wake the driver to check for new work. Wakes coalesce: notifying an
    /// already-pending driver is a no-op.
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    /// Current download speed in bytes per second, sampled once a second
    /// while a job is active
    pub fn current_speed(&self) -> u64 {
        self.inner.current_speed.load(Ordering::SeqCst)
    }

    /// Cancel a queued or in-flight job.
    ///
    /// The failure record (`failed` / "cancelled by user") is persisted
    /// *before* the job scope is cancelled, so the unwinding download
    /// cannot re-write the status and the cancellation is idempotent.
    pub async fn cancel_download(&self, id: &DownloadId) {
        if let Err(e) = self.inner.store.set_error(id, CANCELLED_BY_USER).await {
            error!(download_id = %id, error = %e, "failed to persist cancellation");
        }
        let token = self.lock_active().get(id.as_str()).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        info!(download_id = %id, "download cancelled");
    }

    async fn drive(&self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }

            if self.inner.store.is_paused() {
                continue;
            }

            match self.inner.store.next_queued().await {
                Ok(Some(download)) => self.process_job(download).await,
                Ok(None) => {
                    if self.requeue_stalled().await {
                        self.notify();
                    }
                }
                Err(e) => error!(error = %e, "failed to query next queued download"),
            }
        }
    }

    /// Re-queue jobs stranded in `downloading` by a pause: their download
    /// broke out of the file loop without a status change, and only
    /// `queued` jobs are ever picked up. Returns whether anything was
    /// re-queued.
    async fn requeue_stalled(&self) -> bool {
        let queue = match self.inner.store.queue().await {
            Ok(queue) => queue,
            Err(e) => {
                error!(error = %e, "failed to scan for stalled downloads");
                return false;
            }
        };
        let mut requeued = false;
        for download in queue {
            if download.status() != crate::types::Status::Downloading {
                continue;
            }
            if self.lock_active().contains_key(&download.id) {
                continue;
            }
            info!(download_id = %download.id, "re-queueing download interrupted by pause");
            match self.inner.store.requeue(&download.download_id()).await {
                Ok(()) => requeued = true,
                Err(e) => error!(download_id = %download.id, error = %e, "re-queue failed"),
            }
        }
        requeued
    }

    #[allow(clippy::unwrap_used)]
    pub(crate) fn lock_active(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        // Poisoning is unreachable: only map operations run under this lock
        self.inner.active_jobs.lock().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_handler(&self) -> std::sync::MutexGuard<'_, Option<ReadyHandler>> {
        self.inner.on_ready.lock().unwrap()
    }

    pub(crate) fn ready_handler(&self) -> Option<ReadyHandler> {
        self.lock_handler().clone()
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }
}
