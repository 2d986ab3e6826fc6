//! Persistent job queue
//!
//! SQLite-backed storage for download jobs and history, plus two pieces of
//! process-local state: the queue-wide paused flag (set by the VPN
//! coordinator, read by the engine before any dispatch) and the in-memory
//! extraction-progress map surfaced through the control plane.
//!
//! Status writes are terminal-guarded: once a job is `completed` or
//! `failed` no further transition is applied, which makes cancellation
//! (persist `failed` first, cancel second) idempotent against the engine's
//! own error path.

use crate::error::{DatabaseError, Error, Result};
use crate::types::{DownloadId, Status};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::FromRow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::info;

/// A download job row
#[derive(Clone, Debug, FromRow)]
pub struct Download {
    /// Opaque job identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Optional category, empty when unset
    pub category: String,
    /// Status string; decode with [`Download::status`]
    pub status: String,
    /// Total bytes across every segment, from the NZB plan
    pub total_bytes: i64,
    /// Decoded bytes downloaded so far
    pub downloaded_bytes: i64,
    /// Total segment count, from the NZB plan
    pub total_segments: i64,
    /// Segments completed so far
    pub done_segments: i64,
    /// Destination directory under the incomplete root
    pub path: String,
    /// The raw NZB document
    pub raw_nzb: Vec<u8>,
    /// One-line failure reason for failed jobs
    pub error_msg: String,
    /// Unix seconds when the job was enqueued
    pub created_at: i64,
    /// Unix seconds when the job reached a terminal state
    pub completed_at: Option<i64>,
}

impl Download {
    /// Decoded status
    pub fn status(&self) -> Status {
        Status::from_db(&self.status)
    }

    /// Typed identifier
    pub fn download_id(&self) -> DownloadId {
        DownloadId(self.id.clone())
    }

    /// Completion percentage by segments
    pub fn progress(&self) -> f64 {
        if self.total_segments == 0 {
            return 0.0;
        }
        self.done_segments as f64 / self.total_segments as f64 * 100.0
    }
}

/// A job to enqueue
#[derive(Clone, Debug)]
pub struct NewDownload {
    /// Pre-generated identifier
    pub id: DownloadId,
    /// Display name
    pub name: String,
    /// Optional category
    pub category: String,
    /// Total bytes, precomputed from the plan
    pub total_bytes: i64,
    /// Total segments, precomputed from the plan
    pub total_segments: i64,
    /// Raw NZB bytes
    pub raw_nzb: Vec<u8>,
}

/// In-memory extraction progress for a job in post-processing
#[derive(Clone, Debug, Default)]
pub struct ExtractProgress {
    /// 0..=100
    pub percent: f64,
    /// Basename of the archive currently extracting
    pub file: String,
}

/// SQLite-backed queue store
pub struct QueueStore {
    pool: SqlitePool,
    paused: AtomicBool,
    extract: Mutex<HashMap<String, ExtractProgress>>,
}

impl QueueStore {
    /// Open (creating if missing) the queue database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "failed to create database directory: {e}"
                )))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(e.to_string()))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'queued',
                total_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                total_segments INTEGER NOT NULL DEFAULT 0,
                done_segments INTEGER NOT NULL DEFAULT 0,
                path TEXT NOT NULL DEFAULT '',
                raw_nzb BLOB NOT NULL,
                error_msg TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| Error::Database(DatabaseError::SchemaFailed(e.to_string())))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status)")
            .execute(&pool)
            .await
            .map_err(|e| Error::Database(DatabaseError::SchemaFailed(e.to_string())))?;

        Ok(Self {
            pool,
            paused: AtomicBool::new(false),
            extract: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a new job with status `queued`
    pub async fn add(&self, new: &NewDownload) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO downloads
                (id, name, category, status, total_bytes, total_segments, raw_nzb, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.id.as_str())
        .bind(&new.name)
        .bind(&new.category)
        .bind(Status::Queued.as_str())
        .bind(new.total_bytes)
        .bind(new.total_segments)
        .bind(&new.raw_nzb)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        info!(download_id = %new.id, name = %new.name, "download queued");
        Ok(())
    }

    /// Fetch one job
    pub async fn get(&self, id: &DownloadId) -> Result<Option<Download>> {
        sqlx::query_as::<_, Download>("SELECT * FROM downloads WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed)
    }

    /// All non-terminal jobs, FIFO by enqueue time
    pub async fn queue(&self) -> Result<Vec<Download>> {
        sqlx::query_as::<_, Download>(
            r#"
            SELECT * FROM downloads
            WHERE status IN ('queued', 'downloading', 'processing')
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)
    }

    /// All terminal jobs, most recently finished first
    pub async fn history(&self) -> Result<Vec<Download>> {
        sqlx::query_as::<_, Download>(
            r#"
            SELECT * FROM downloads
            WHERE status IN ('completed', 'failed')
            ORDER BY completed_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)
    }

    /// The oldest `queued` job, if any
    pub async fn next_queued(&self) -> Result<Option<Download>> {
        sqlx::query_as::<_, Download>(
            r#"
            SELECT * FROM downloads
            WHERE status = 'queued'
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed)
    }

    /// Transition a job's status. Terminal rows are never modified;
    /// entering a terminal state stamps `completed_at`.
    pub async fn update_status(&self, id: &DownloadId, status: Status) -> Result<()> {
        if status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE downloads SET status = ?, completed_at = ?
                WHERE id = ? AND status NOT IN ('completed', 'failed')
                "#,
            )
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        } else {
            sqlx::query(
                r#"
                UPDATE downloads SET status = ?
                WHERE id = ? AND status NOT IN ('completed', 'failed')
                "#,
            )
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        }
        Ok(())
    }

    /// Mark a job failed with a one-line reason. A no-op for jobs already
    /// in a terminal state, so the first failure reason wins.
    pub async fn set_error(&self, id: &DownloadId, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE downloads SET status = 'failed', error_msg = ?, completed_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(message)
        .bind(chrono::Utc::now().timestamp())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    /// Persist progress counters. Terminal jobs are left untouched, so a
    /// cancelled job shows no further movement.
    pub async fn update_progress(
        &self,
        id: &DownloadId,
        downloaded_bytes: i64,
        done_segments: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE downloads SET downloaded_bytes = ?, done_segments = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(downloaded_bytes)
        .bind(done_segments)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    /// Persist the job's destination directory
    pub async fn update_path(&self, id: &DownloadId, path: &str) -> Result<()> {
        sqlx::query("UPDATE downloads SET path = ? WHERE id = ?")
            .bind(path)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    /// Send one non-terminal job back to `queued` with fresh counters.
    ///
    /// Used by the engine for jobs whose download was interrupted by a
    /// queue pause: the job re-enters the queue and is re-picked once the
    /// pause lifts.
    pub async fn requeue(&self, id: &DownloadId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'queued', downloaded_bytes = 0, done_segments = 0
            WHERE id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    /// Re-queue jobs left `downloading`/`processing` by a previous run.
    ///
    /// Called once at startup, before the engine starts; a resumed job
    /// re-downloads from a clean slate (no segment-level checkpointing).
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'queued', downloaded_bytes = 0, done_segments = 0
            WHERE status IN ('downloading', 'processing')
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_failed)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "re-queued jobs interrupted by previous shutdown");
        }
        Ok(recovered)
    }

    /// Whether the queue is paused (VPN down). Authoritative for the
    /// engine: while true no new segment fetch is dispatched.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Flip the queue-wide paused flag
    pub fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was != paused {
            if paused {
                info!("download queue PAUSED");
            } else {
                info!("download queue RESUMED");
            }
        }
    }

    /// Record in-memory extraction progress for a job
    pub fn set_extract_progress(&self, id: &DownloadId, percent: f64, file: &str) {
        self.lock_extract().insert(
            id.as_str().to_string(),
            ExtractProgress {
                percent,
                file: file.to_string(),
            },
        );
    }

    /// Drop a job's extraction progress entry
    pub fn clear_extract_progress(&self, id: &DownloadId) {
        self.lock_extract().remove(id.as_str());
    }

    /// Current extraction progress for a job, if extracting
    pub fn extract_progress(&self, id: &str) -> Option<ExtractProgress> {
        self.lock_extract().get(id).cloned()
    }

    /// Close the underlying connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[allow(clippy::unwrap_used)]
    fn lock_extract(&self) -> std::sync::MutexGuard<'_, HashMap<String, ExtractProgress>> {
        // Poisoning is unreachable: map operations cannot panic
        self.extract.lock().unwrap()
    }
}

fn query_failed(e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(e.to_string()))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (QueueStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(&dir.path().join("queue.db")).await.unwrap();
        (store, dir)
    }

    fn job(name: &str) -> NewDownload {
        NewDownload {
            id: DownloadId::generate(),
            name: name.to_string(),
            category: String::new(),
            total_bytes: 1000,
            total_segments: 4,
            raw_nzb: b"<nzb/>".to_vec(),
        }
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let (store, _dir) = store().await;
        let new = job("first");
        store.add(&new).await.unwrap();

        let loaded = store.get(&new.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "first");
        assert_eq!(loaded.status(), Status::Queued);
        assert_eq!(loaded.total_bytes, 1000);
        assert_eq!(loaded.raw_nzb, b"<nzb/>");
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn next_queued_is_fifo() {
        let (store, _dir) = store().await;
        let first = job("first");
        let second = job("second");
        store.add(&first).await.unwrap();
        store.add(&second).await.unwrap();

        let next = store.next_queued().await.unwrap().unwrap();
        assert_eq!(next.id, first.id.as_str());

        store
            .update_status(&first.id, Status::Downloading)
            .await
            .unwrap();
        let next = store.next_queued().await.unwrap().unwrap();
        assert_eq!(next.id, second.id.as_str());
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let (store, _dir) = store().await;
        let new = job("cancelled");
        store.add(&new).await.unwrap();

        store.set_error(&new.id, "cancelled by user").await.unwrap();

        // A racing engine error or status transition must be a no-op
        store.set_error(&new.id, "download error: boom").await.unwrap();
        store
            .update_status(&new.id, Status::Processing)
            .await
            .unwrap();

        let loaded = store.get(&new.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), Status::Failed);
        assert_eq!(loaded.error_msg, "cancelled by user");
    }

    #[tokio::test]
    async fn terminal_entry_stamps_completed_at() {
        let (store, _dir) = store().await;
        let new = job("done");
        store.add(&new).await.unwrap();
        store
            .update_status(&new.id, Status::Downloading)
            .await
            .unwrap();
        assert!(store.get(&new.id).await.unwrap().unwrap().completed_at.is_none());

        store
            .update_status(&new.id, Status::Processing)
            .await
            .unwrap();
        store
            .update_status(&new.id, Status::Completed)
            .await
            .unwrap();
        let loaded = store.get(&new.id).await.unwrap().unwrap();
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn queue_and_history_partition_by_terminality() {
        let (store, _dir) = store().await;
        let active = job("active");
        let failed = job("failed");
        store.add(&active).await.unwrap();
        store.add(&failed).await.unwrap();
        store.set_error(&failed.id, "boom").await.unwrap();

        let queue = store.queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, active.id.as_str());

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, failed.id.as_str());
        assert_eq!(history[0].error_msg, "boom");
    }

    #[tokio::test]
    async fn recover_interrupted_requeues_and_resets_progress() {
        let (store, _dir) = store().await;
        let stuck = job("stuck");
        store.add(&stuck).await.unwrap();
        store
            .update_status(&stuck.id, Status::Downloading)
            .await
            .unwrap();
        store.update_progress(&stuck.id, 500, 2).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 1);

        let loaded = store.get(&stuck.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), Status::Queued);
        assert_eq!(loaded.downloaded_bytes, 0);
        assert_eq!(loaded.done_segments, 0);
    }

    #[tokio::test]
    async fn recover_interrupted_leaves_terminal_jobs_alone() {
        let (store, _dir) = store().await;
        let done = job("done");
        store.add(&done).await.unwrap();
        store.set_error(&done.id, "kept").await.unwrap();

        assert_eq!(store.recover_interrupted().await.unwrap(), 0);
        let loaded = store.get(&done.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), Status::Failed);
    }

    #[tokio::test]
    async fn paused_flag_round_trips() {
        let (store, _dir) = store().await;
        assert!(!store.is_paused());
        store.set_paused(true);
        assert!(store.is_paused());
        store.set_paused(false);
        assert!(!store.is_paused());
    }

    #[tokio::test]
    async fn extract_progress_is_per_job_and_clearable() {
        let (store, _dir) = store().await;
        let id = DownloadId::generate();

        assert!(store.extract_progress(id.as_str()).is_none());
        store.set_extract_progress(&id, 42.5, "archive.rar");

        let progress = store.extract_progress(id.as_str()).unwrap();
        assert_eq!(progress.percent, 42.5);
        assert_eq!(progress.file, "archive.rar");

        store.clear_extract_progress(&id);
        assert!(store.extract_progress(id.as_str()).is_none());
    }

    #[tokio::test]
    async fn progress_updates_accumulate() {
        let (store, _dir) = store().await;
        let new = job("progress");
        store.add(&new).await.unwrap();

        store.update_progress(&new.id, 250, 1).await.unwrap();
        store.update_progress(&new.id, 750, 3).await.unwrap();

        let loaded = store.get(&new.id).await.unwrap().unwrap();
        assert_eq!(loaded.downloaded_bytes, 750);
        assert_eq!(loaded.done_segments, 3);
        assert_eq!(loaded.progress(), 75.0);
    }
}
