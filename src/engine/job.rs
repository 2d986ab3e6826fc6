//! Per-job processing: segment fan-out, decoding, and file assembly

use super::Engine;
use crate::nzb::{Nzb, NzbFile};
use crate::queue::Download;
use crate::yenc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sticky first error for a job; later errors are dropped
#[derive(Clone, Debug)]
struct JobError {
    message: String,
    cancelled: bool,
}

type ErrorSlot = Arc<Mutex<Option<JobError>>>;

fn arm(slot: &ErrorSlot, error: JobError) {
    let mut guard = lock(slot);
    if guard.is_none() {
        *guard = Some(error);
    }
}

#[allow(clippy::unwrap_used)]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// How a file download ended
enum FileOutcome {
    /// Every segment fetched, decoded, and written
    Completed,
    /// Dispatch stopped early (pause or cancellation); nothing assembled
    Interrupted,
}

/// Shared per-job progress counters
struct Counters {
    bytes: AtomicU64,
    done: AtomicU64,
}

impl Engine {
    /// Run one job to completion, failure, or interruption
    pub(crate) async fn process_job(&self, download: Download) {
        let id = download.download_id();
        info!(download_id = %id, name = %download.name, "starting download");

        let job_cancel = self.inner().cancel.child_token();
        self.lock_active().insert(id.as_str().to_string(), job_cancel.clone());

        self.run_job(&download, &job_cancel).await;

        self.lock_active().remove(id.as_str());
        self.inner().current_speed.store(0, Ordering::SeqCst);
    }

    async fn run_job(&self, download: &Download, job_cancel: &CancellationToken) {
        let id = download.download_id();
        let store = &self.inner().store;

        if let Err(e) = store.update_status(&id, crate::types::Status::Downloading).await {
            error!(download_id = %id, error = %e, "failed to mark downloading");
            return;
        }

        let plan = match Nzb::parse(&download.raw_nzb) {
            Ok(plan) => plan,
            Err(e) => {
                let _ = store.set_error(&id, &format!("NZB parse error: {e}")).await;
                return;
            }
        };

        let dir = self.inner().incomplete_dir.join(&download.name);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            let _ = store
                .set_error(&id, &format!("mkdir {}: {e}", dir.display()))
                .await;
            return;
        }
        if let Err(e) = store.update_path(&id, &dir.to_string_lossy()).await {
            error!(download_id = %id, error = %e, "failed to persist path");
        }

        let counters = Arc::new(Counters {
            bytes: AtomicU64::new(0),
            done: AtomicU64::new(0),
        });
        let started = std::time::Instant::now();

        // Speed sampler: once a second, publish the byte delta since the
        // previous sample
        let sampler_cancel = job_cancel.child_token();
        let sampler = {
            let engine = self.clone();
            let counters = counters.clone();
            let cancel = sampler_cancel.clone();
            tokio::spawn(async move {
                let mut last = 0u64;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            engine.inner().current_speed.store(0, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            let current = counters.bytes.load(Ordering::SeqCst);
                            engine
                                .inner()
                                .current_speed
                                .store(current - last, Ordering::SeqCst);
                            last = current;
                        }
                    }
                }
            })
        };

        let mut job_error: Option<JobError> = None;
        let mut interrupted = false;
        for file in &plan.files {
            if job_cancel.is_cancelled() || store.is_paused() {
                interrupted = true;
                break;
            }
            match self
                .download_file(job_cancel, file, &dir, &counters, download)
                .await
            {
                Ok(FileOutcome::Completed) => {}
                Ok(FileOutcome::Interrupted) => {
                    interrupted = true;
                    break;
                }
                Err(e) => {
                    job_error = Some(e);
                    break;
                }
            }
        }

        sampler_cancel.cancel();
        let _ = sampler.await;

        let bytes = counters.bytes.load(Ordering::SeqCst);
        let done = counters.done.load(Ordering::SeqCst);
        let _ = store.update_progress(&id, bytes as i64, done as i64).await;

        let elapsed = started.elapsed();
        info!(
            download_id = %id,
            bytes,
            segments = done,
            elapsed_secs = elapsed.as_secs(),
            "download finished"
        );

        if let Some(job_error) = job_error {
            if job_error.cancelled {
                // The cancellation path persisted its own failure record
                // before cutting the token; nothing more to write.
                return;
            }
            let _ = store
                .set_error(&id, &format!("download error: {}", job_error.message))
                .await;
            return;
        }

        if interrupted {
            // Paused mid-job (or shutting down): leave the status alone.
            // A paused job is re-queued by the driver once the pause
            // lifts; a shutdown is recovered at next startup.
            warn!(download_id = %id, "download interrupted, leaving for re-queue");
            return;
        }

        if let Err(e) = store.update_status(&id, crate::types::Status::Processing).await {
            error!(download_id = %id, error = %e, "failed to mark processing");
            return;
        }

        if let Some(handler) = self.ready_handler() {
            match store.get(&id).await {
                Ok(Some(fresh)) => handler(fresh),
                Ok(None) => error!(download_id = %id, "job vanished before handoff"),
                Err(e) => error!(download_id = %id, error = %e, "failed to reload job"),
            }
        }
    }

    /// Download every segment of one file with bounded parallelism, then
    /// assemble them in ordinal order.
    async fn download_file(
        &self,
        cancel: &CancellationToken,
        file: &NzbFile,
        dir: &Path,
        counters: &Arc<Counters>,
        download: &Download,
    ) -> Result<FileOutcome, JobError> {
        let filename = sanitize_filename(&file.filename());
        let segments = file.sorted_segments();
        let total = segments.len();

        let results: Arc<Mutex<Vec<Option<Vec<u8>>>>> =
            Arc::new(Mutex::new(vec![None; total]));
        let first_error: ErrorSlot = Arc::new(Mutex::new(None));
        let limiter = Arc::new(Semaphore::new(self.inner().workers));
        let mut tasks = JoinSet::new();

        let mut dispatched = 0usize;
        for (index, segment) in segments.into_iter().enumerate() {
            // Pause and cancellation are observed at every dispatch site;
            // a sticky error stops dispatching new work for this job.
            if cancel.is_cancelled() || self.inner().store.is_paused() {
                break;
            }
            if lock(&first_error).is_some() {
                break;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            dispatched += 1;
            let engine = self.clone();
            let cancel = cancel.clone();
            let results = results.clone();
            let first_error = first_error.clone();
            let counters = counters.clone();
            let job_id = download.download_id();
            let total_segments = download.total_segments as u64;

            tasks.spawn(async move {
                let _permit = permit;

                let body = match engine
                    .inner()
                    .pool_manager
                    .fetch_article(&cancel, &segment.message_id)
                    .await
                {
                    Ok(body) => body,
                    Err(e) => {
                        arm(
                            &first_error,
                            JobError {
                                message: format!(
                                    "segment {} (<{}>): {e}",
                                    segment.number, segment.message_id
                                ),
                                cancelled: e.is_cancelled(),
                            },
                        );
                        return;
                    }
                };

                let decoded = match yenc::decode(&body) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        // No retry for decode and CRC failures: another
                        // server would return the same bad article.
                        arm(
                            &first_error,
                            JobError {
                                message: format!("yEnc decode segment {}: {e}", segment.number),
                                cancelled: false,
                            },
                        );
                        return;
                    }
                };

                counters
                    .bytes
                    .fetch_add(decoded.data.len() as u64, Ordering::SeqCst);
                lock(&results)[index] = Some(decoded.data);

                let done = counters.done.fetch_add(1, Ordering::SeqCst) + 1;
                if done % 10 == 0 || done == total_segments {
                    let bytes = counters.bytes.load(Ordering::SeqCst);
                    let _ = engine
                        .inner()
                        .store
                        .update_progress(&job_id, bytes as i64, done as i64)
                        .await;
                }
            });
        }

        // Join barrier: every dispatched segment resolves before the file
        // is assembled or the error surfaces
        while tasks.join_next().await.is_some() {}

        if let Some(job_error) = lock(&first_error).take() {
            return Err(job_error);
        }

        if dispatched < total {
            return Ok(FileOutcome::Interrupted);
        }

        let slots: Vec<Option<Vec<u8>>> = std::mem::take(&mut *lock(&results));
        let path = dir.join(&filename);
        let mut out = tokio::fs::File::create(&path).await.map_err(|e| JobError {
            message: format!("creating {}: {e}", path.display()),
            cancelled: false,
        })?;

        for (index, slot) in slots.into_iter().enumerate() {
            let Some(data) = slot else {
                return Err(JobError {
                    message: format!("missing segment {} for {filename}", index + 1),
                    cancelled: false,
                });
            };
            out.write_all(&data).await.map_err(|e| JobError {
                message: format!("writing segment {} of {filename}: {e}", index + 1),
                cancelled: false,
            })?;
        }
        out.flush().await.map_err(|e| JobError {
            message: format!("flushing {filename}: {e}"),
            cancelled: false,
        })?;

        info!(file = %filename, "assembled file");
        Ok(FileOutcome::Completed)
    }
}

/// Keep only the final path component of an NZB-supplied filename
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        "unnamed.bin".to_string()
    } else {
        base.to_string()
    }
}
