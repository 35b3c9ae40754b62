// src/state_manager.rs

use crate::models::{DownloadJob, JobStatus};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable table of download jobs. Every cross-component state transition goes
/// through here; the guarded operations (`claim`, `checkpoint`,
/// `compare_and_set`) return `false` when the row was not in the expected state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row; returns `false` if a row with this id already exists.
    async fn insert(&self, job: &DownloadJob) -> Result<bool, StoreError>;
    /// Insert or overwrite every column of the row.
    async fn upsert(&self, job: &DownloadJob) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<DownloadJob>, StoreError>;
    async fn get_by_recording(&self, recording_id: &str) -> Result<Vec<DownloadJob>, StoreError>;
    /// Queued, not marked for deletion, ordered by priority then age.
    async fn queued_by_priority(&self, limit: usize) -> Result<Vec<DownloadJob>, StoreError>;
    async fn active_count(&self) -> Result<usize, StoreError>;
    /// Failed rows with retries left whose last update is older than `cutoff`.
    async fn failed_retry_candidates(
        &self,
        cutoff: i64,
        max_retries: u32,
    ) -> Result<Vec<DownloadJob>, StoreError>;
    async fn marked_for_deletion_before(&self, cutoff: i64) -> Result<Vec<DownloadJob>, StoreError>;
    /// Cancelled or retry-exhausted Failed rows last updated before `cutoff`.
    async fn terminal_before(
        &self,
        cutoff: i64,
        max_retries: u32,
    ) -> Result<Vec<DownloadJob>, StoreError>;
    /// Downloading rows whose heartbeat (or start time) is older than `cutoff`.
    async fn stale_downloading(&self, cutoff: i64) -> Result<Vec<DownloadJob>, StoreError>;
    /// Completed rows, least recently accessed first.
    async fn completed_by_last_access(&self, limit: usize) -> Result<Vec<DownloadJob>, StoreError>;
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Queued -> Downloading, only if still queued and not marked for deletion.
    async fn claim(&self, id: &str, now: i64) -> Result<bool, StoreError>;
    /// Persist transfer progress and heartbeat. `false` means the job is no
    /// longer wanted (not Downloading any more, or marked for deletion).
    async fn checkpoint(
        &self,
        id: &str,
        bytes_downloaded: u64,
        total_bytes: u64,
        progress: f64,
        now: i64,
    ) -> Result<bool, StoreError>;
    /// Write the mutable transfer fields of `job` if the stored status equals
    /// `expected`. Deletion marks and access times are left untouched.
    async fn compare_and_set(&self, job: &DownloadJob, expected: JobStatus) -> Result<bool, StoreError>;
    /// Flag every job of a recording for deletion. Returns rows changed.
    async fn mark_recording_for_deletion(&self, recording_id: &str, now: i64) -> Result<usize, StoreError>;
    async fn unmark_for_deletion(&self, id: &str, now: i64) -> Result<bool, StoreError>;
    async fn touch_recording(&self, recording_id: &str, now: i64) -> Result<usize, StoreError>;

    /// Feed of recording ids whose job set changed.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

const COLUMNS: &str = "id, recording_id, filename, url, priority, status, progress, \
     bytes_downloaded, total_bytes, local_path, expected_sha256, error_message, retry_count, \
     started_at, completed_at, created_at, updated_at, heartbeat_at, \
     is_marked_for_deletion, deletion_timestamp, last_access_timestamp";

const CHANGE_FEED_CAPACITY: usize = 256;

/// Manages the persistence of download jobs in an SQLite database.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
    changes: broadcast::Sender<String>,
}

impl StateManager {
    /// Opens the database file, creating it and the schema if missing.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn).await
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let manager = Self { conn, changes };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS download_jobs (
                        id                      TEXT PRIMARY KEY,
                        recording_id            TEXT NOT NULL,
                        filename                TEXT NOT NULL,
                        url                     TEXT NOT NULL,
                        priority                INTEGER NOT NULL,
                        status                  TEXT NOT NULL,
                        progress                REAL NOT NULL DEFAULT 0,
                        bytes_downloaded        INTEGER NOT NULL DEFAULT 0,
                        total_bytes             INTEGER NOT NULL DEFAULT 0,
                        local_path              TEXT NOT NULL,
                        expected_sha256         TEXT,
                        error_message           TEXT,
                        retry_count             INTEGER NOT NULL DEFAULT 0,
                        started_at              INTEGER,
                        completed_at            INTEGER,
                        created_at              INTEGER NOT NULL,
                        updated_at              INTEGER NOT NULL,
                        heartbeat_at            INTEGER,
                        is_marked_for_deletion  INTEGER NOT NULL DEFAULT 0,
                        deletion_timestamp      INTEGER,
                        last_access_timestamp   INTEGER NOT NULL
                     );
                     CREATE INDEX IF NOT EXISTS idx_download_jobs_queue
                        ON download_jobs (status, priority, created_at);
                     CREATE INDEX IF NOT EXISTS idx_download_jobs_recording
                        ON download_jobs (recording_id);",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn notify(&self, recording_id: Option<String>) {
        if let Some(recording_id) = recording_id {
            // No subscribers is fine.
            let _ = self.changes.send(recording_id);
        }
    }

    async fn query_jobs(
        &self,
        sql: String,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<DownloadJob>, StoreError> {
        let jobs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_job)?;
                let mut jobs = Vec::new();
                for row in rows {
                    if let Some(job) = row? {
                        jobs.push(job);
                    }
                }
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<DownloadJob>> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    let Some(status) = JobStatus::parse(&status) else {
        tracing::warn!(job_id = %id, status = %status, "skipping job row with unknown status");
        return Ok(None);
    };
    let local_path: String = row.get(9)?;
    Ok(Some(DownloadJob {
        id,
        recording_id: row.get(1)?,
        filename: row.get(2)?,
        url: row.get(3)?,
        priority: row.get(4)?,
        status,
        progress: row.get(6)?,
        bytes_downloaded: row.get::<_, i64>(7)?.max(0) as u64,
        total_bytes: row.get::<_, i64>(8)?.max(0) as u64,
        local_path: PathBuf::from(local_path),
        expected_sha256: row.get(10)?,
        error_message: row.get(11)?,
        retry_count: row.get::<_, i64>(12)?.max(0) as u32,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        heartbeat_at: row.get(17)?,
        is_marked_for_deletion: row.get(18)?,
        deletion_timestamp: row.get(19)?,
        last_access_timestamp: row.get(20)?,
    }))
}

/// Column values for a full-row write, in `COLUMNS` order.
fn job_values(job: &DownloadJob) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value;
    let opt_int = |v: Option<i64>| v.map(Value::Integer).unwrap_or(Value::Null);
    let opt_text = |v: &Option<String>| v.clone().map(Value::Text).unwrap_or(Value::Null);
    vec![
        Value::Text(job.id.clone()),
        Value::Text(job.recording_id.clone()),
        Value::Text(job.filename.clone()),
        Value::Text(job.url.clone()),
        Value::Integer(job.priority as i64),
        Value::Text(job.status.as_str().to_string()),
        Value::Real(job.progress),
        Value::Integer(job.bytes_downloaded as i64),
        Value::Integer(job.total_bytes as i64),
        Value::Text(job.local_path.to_string_lossy().into_owned()),
        opt_text(&job.expected_sha256),
        opt_text(&job.error_message),
        Value::Integer(job.retry_count as i64),
        opt_int(job.started_at),
        opt_int(job.completed_at),
        Value::Integer(job.created_at),
        Value::Integer(job.updated_at),
        opt_int(job.heartbeat_at),
        Value::Integer(job.is_marked_for_deletion as i64),
        opt_int(job.deletion_timestamp),
        Value::Integer(job.last_access_timestamp),
    ]
}

#[async_trait]
impl JobStore for StateManager {
    async fn insert(&self, job: &DownloadJob) -> Result<bool, StoreError> {
        let values = job_values(job);
        let inserted = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "INSERT OR IGNORE INTO download_jobs ({COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                );
                let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
                Ok(changed == 1)
            })
            .await?;
        if inserted {
            self.notify(Some(job.recording_id.clone()));
        }
        Ok(inserted)
    }

    async fn upsert(&self, job: &DownloadJob) -> Result<(), StoreError> {
        let values = job_values(job);
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "INSERT OR REPLACE INTO download_jobs ({COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
                );
                conn.execute(&sql, rusqlite::params_from_iter(values))?;
                Ok(())
            })
            .await?;
        self.notify(Some(job.recording_id.clone()));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadJob>, StoreError> {
        let jobs = self
            .query_jobs(
                format!("SELECT {COLUMNS} FROM download_jobs WHERE id = ?1"),
                vec![id.to_string().into()],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn get_by_recording(&self, recording_id: &str) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs WHERE recording_id = ?1 \
                 ORDER BY priority ASC, created_at ASC, id ASC"
            ),
            vec![recording_id.to_string().into()],
        )
        .await
    }

    async fn queued_by_priority(&self, limit: usize) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs \
                 WHERE status = 'queued' AND is_marked_for_deletion = 0 \
                 ORDER BY priority ASC, created_at ASC, id ASC LIMIT ?1"
            ),
            vec![(limit as i64).into()],
        )
        .await
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM download_jobs WHERE status = 'downloading'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn failed_retry_candidates(
        &self,
        cutoff: i64,
        max_retries: u32,
    ) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs \
                 WHERE status = 'failed' AND retry_count < ?1 AND updated_at < ?2 \
                   AND is_marked_for_deletion = 0 \
                 ORDER BY updated_at ASC"
            ),
            vec![(max_retries as i64).into(), cutoff.into()],
        )
        .await
    }

    async fn marked_for_deletion_before(&self, cutoff: i64) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs \
                 WHERE is_marked_for_deletion = 1 AND COALESCE(deletion_timestamp, 0) < ?1"
            ),
            vec![cutoff.into()],
        )
        .await
    }

    async fn terminal_before(
        &self,
        cutoff: i64,
        max_retries: u32,
    ) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs \
                 WHERE (status = 'cancelled' OR (status = 'failed' AND retry_count >= ?1)) \
                   AND updated_at < ?2"
            ),
            vec![(max_retries as i64).into(), cutoff.into()],
        )
        .await
    }

    async fn stale_downloading(&self, cutoff: i64) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs \
                 WHERE status = 'downloading' \
                   AND COALESCE(heartbeat_at, started_at, updated_at) < ?1"
            ),
            vec![cutoff.into()],
        )
        .await
    }

    async fn completed_by_last_access(&self, limit: usize) -> Result<Vec<DownloadJob>, StoreError> {
        self.query_jobs(
            format!(
                "SELECT {COLUMNS} FROM download_jobs WHERE status = 'completed' \
                 ORDER BY last_access_timestamp ASC, completed_at ASC LIMIT ?1"
            ),
            vec![(limit as i64).into()],
        )
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let recording_id = self
            .conn
            .call(move |conn| {
                let recording_id: Option<String> = conn
                    .query_row(
                        "DELETE FROM download_jobs WHERE id = ?1 RETURNING recording_id",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(recording_id)
            })
            .await?;
        let deleted = recording_id.is_some();
        self.notify(recording_id);
        Ok(deleted)
    }

    async fn claim(&self, id: &str, now: i64) -> Result<bool, StoreError> {
        let id = id.to_string();
        let recording_id = self
            .conn
            .call(move |conn| {
                let recording_id: Option<String> = conn
                    .query_row(
                        "UPDATE download_jobs
                         SET status = 'downloading', started_at = ?2, heartbeat_at = ?2,
                             error_message = NULL, updated_at = ?2
                         WHERE id = ?1 AND status = 'queued' AND is_marked_for_deletion = 0
                         RETURNING recording_id",
                        params![id, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(recording_id)
            })
            .await?;
        let claimed = recording_id.is_some();
        self.notify(recording_id);
        Ok(claimed)
    }

    async fn checkpoint(
        &self,
        id: &str,
        bytes_downloaded: u64,
        total_bytes: u64,
        progress: f64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let recording_id = self
            .conn
            .call(move |conn| {
                let recording_id: Option<String> = conn
                    .query_row(
                        "UPDATE download_jobs
                         SET bytes_downloaded = ?2, total_bytes = ?3, progress = ?4,
                             heartbeat_at = ?5, updated_at = ?5
                         WHERE id = ?1 AND status = 'downloading' AND is_marked_for_deletion = 0
                         RETURNING recording_id",
                        params![id, bytes_downloaded as i64, total_bytes as i64, progress, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(recording_id)
            })
            .await?;
        let wanted = recording_id.is_some();
        self.notify(recording_id);
        Ok(wanted)
    }

    async fn compare_and_set(&self, job: &DownloadJob, expected: JobStatus) -> Result<bool, StoreError> {
        let job_owned = job.clone();
        let changed = self
            .conn
            .call(move |conn| {
                let job = job_owned;
                let changed = conn.execute(
                    "UPDATE download_jobs
                     SET status = ?2, priority = ?3, progress = ?4, bytes_downloaded = ?5,
                         total_bytes = ?6, error_message = ?7, retry_count = ?8,
                         started_at = ?9, completed_at = ?10, updated_at = ?11, heartbeat_at = ?12
                     WHERE id = ?1 AND status = ?13",
                    params![
                        job.id,
                        job.status.as_str(),
                        job.priority,
                        job.progress,
                        job.bytes_downloaded as i64,
                        job.total_bytes as i64,
                        job.error_message,
                        job.retry_count as i64,
                        job.started_at,
                        job.completed_at,
                        job.updated_at,
                        job.heartbeat_at,
                        expected.as_str(),
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        if changed {
            self.notify(Some(job.recording_id.clone()));
        }
        Ok(changed)
    }

    async fn mark_recording_for_deletion(&self, recording_id: &str, now: i64) -> Result<usize, StoreError> {
        let owned = recording_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE download_jobs
                     SET is_marked_for_deletion = 1, deletion_timestamp = ?2, updated_at = ?2
                     WHERE recording_id = ?1 AND is_marked_for_deletion = 0",
                    params![owned, now],
                )?;
                Ok(changed)
            })
            .await?;
        if changed > 0 {
            self.notify(Some(recording_id.to_string()));
        }
        Ok(changed)
    }

    async fn unmark_for_deletion(&self, id: &str, now: i64) -> Result<bool, StoreError> {
        let id = id.to_string();
        let recording_id = self
            .conn
            .call(move |conn| {
                let recording_id: Option<String> = conn
                    .query_row(
                        "UPDATE download_jobs
                         SET is_marked_for_deletion = 0, deletion_timestamp = NULL, updated_at = ?2
                         WHERE id = ?1 AND is_marked_for_deletion = 1
                         RETURNING recording_id",
                        params![id, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(recording_id)
            })
            .await?;
        let changed = recording_id.is_some();
        self.notify(recording_id);
        Ok(changed)
    }

    async fn touch_recording(&self, recording_id: &str, now: i64) -> Result<usize, StoreError> {
        let owned = recording_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE download_jobs SET last_access_timestamp = ?2 WHERE recording_id = ?1",
                    params![owned, now],
                )?;
                Ok(changed)
            })
            .await?;
        Ok(changed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileRequest;

    fn job(recording: &str, file: &str, priority: i32, created_at: i64) -> DownloadJob {
        let request = FileRequest::new(file, format!("https://example.org/{recording}/{file}"));
        DownloadJob::new(recording, &request, priority, Path::new("/tmp/taper"), created_at)
    }

    #[tokio::test]
    async fn insert_is_idempotent_and_get_roundtrips() {
        let store = StateManager::open_in_memory().await.unwrap();
        let j = job("rec", "a.flac", 1, 10);
        assert!(store.insert(&j).await.unwrap());
        assert!(!store.insert(&j).await.unwrap());
        let loaded = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded, j);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queued_order_is_priority_then_fifo() {
        let store = StateManager::open_in_memory().await.unwrap();
        let a = job("rec", "a", 2, 1);
        let b = job("rec", "b", 1, 3);
        let c = job("rec", "c", 1, 2);
        let mut deleted = job("rec", "d", 0, 0);
        deleted.is_marked_for_deletion = true;
        for j in [&a, &b, &c, &deleted] {
            store.insert(j).await.unwrap();
        }
        let queued = store.queued_by_priority(10).await.unwrap();
        let names: Vec<_> = queued.iter().map(|j| j.filename.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
        assert_eq!(store.queued_by_priority(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_succeeds_only_once() {
        let store = StateManager::open_in_memory().await.unwrap();
        let j = job("rec", "a", 0, 0);
        store.insert(&j).await.unwrap();
        assert!(store.claim(&j.id, 5).await.unwrap());
        assert!(!store.claim(&j.id, 6).await.unwrap());
        assert_eq!(store.active_count().await.unwrap(), 1);
        let loaded = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Downloading);
        assert_eq!(loaded.started_at, Some(5));
        assert_eq!(loaded.heartbeat_at, Some(5));
    }

    #[tokio::test]
    async fn claim_refuses_marked_job() {
        let store = StateManager::open_in_memory().await.unwrap();
        let j = job("rec", "a", 0, 0);
        store.insert(&j).await.unwrap();
        assert_eq!(store.mark_recording_for_deletion("rec", 1).await.unwrap(), 1);
        assert!(!store.claim(&j.id, 2).await.unwrap());
        assert!(store.unmark_for_deletion(&j.id, 3).await.unwrap());
        assert!(store.claim(&j.id, 4).await.unwrap());
    }

    #[tokio::test]
    async fn checkpoint_reports_unwanted_job() {
        let store = StateManager::open_in_memory().await.unwrap();
        let j = job("rec", "a", 0, 0);
        store.insert(&j).await.unwrap();
        assert!(!store.checkpoint(&j.id, 1, 10, 0.1, 1).await.unwrap());
        store.claim(&j.id, 1).await.unwrap();
        assert!(store.checkpoint(&j.id, 5, 10, 0.5, 2).await.unwrap());
        store.mark_recording_for_deletion("rec", 3).await.unwrap();
        assert!(!store.checkpoint(&j.id, 6, 10, 0.6, 4).await.unwrap());
        let loaded = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes_downloaded, 5);
        assert_eq!(loaded.heartbeat_at, Some(2));
    }

    #[tokio::test]
    async fn compare_and_set_keeps_deletion_mark() {
        let store = StateManager::open_in_memory().await.unwrap();
        let mut j = job("rec", "a", 0, 0);
        store.insert(&j).await.unwrap();
        store.claim(&j.id, 1).await.unwrap();
        store.mark_recording_for_deletion("rec", 2).await.unwrap();

        j.status = JobStatus::Completed;
        j.progress = 1.0;
        assert!(!store.compare_and_set(&j, JobStatus::Queued).await.unwrap());
        assert!(store.compare_and_set(&j, JobStatus::Downloading).await.unwrap());
        let loaded = store.get(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.is_marked_for_deletion);
    }

    #[tokio::test]
    async fn maintenance_queries() {
        let store = StateManager::open_in_memory().await.unwrap();
        let mut retryable = job("rec", "retry", 0, 0);
        retryable.status = JobStatus::Failed;
        retryable.retry_count = 1;
        retryable.updated_at = 100;
        let mut exhausted = job("rec", "dead", 0, 0);
        exhausted.status = JobStatus::Failed;
        exhausted.retry_count = 3;
        exhausted.updated_at = 100;
        let mut stale = job("rec", "stale", 0, 0);
        stale.status = JobStatus::Downloading;
        stale.heartbeat_at = Some(50);
        let mut fresh = job("rec", "fresh", 0, 0);
        fresh.status = JobStatus::Downloading;
        fresh.heartbeat_at = Some(500);
        for j in [&retryable, &exhausted, &stale, &fresh] {
            store.upsert(j).await.unwrap();
        }

        let retry = store.failed_retry_candidates(200, 3).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].filename, "retry");
        assert!(store.failed_retry_candidates(50, 3).await.unwrap().is_empty());

        let terminal = store.terminal_before(200, 3).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].filename, "dead");

        let orphans = store.stale_downloading(100).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].filename, "stale");
    }

    #[tokio::test]
    async fn change_feed_reports_recording() {
        let store = StateManager::open_in_memory().await.unwrap();
        let mut rx = store.subscribe();
        let j = job("rec-42", "a", 0, 0);
        store.insert(&j).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "rec-42");
        assert!(store.delete(&j.id).await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "rec-42");
        assert!(!store.delete(&j.id).await.unwrap());
    }
}
