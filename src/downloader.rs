// src/downloader.rs

use crate::client::{RemoteStream, TransferClient};
use crate::integrity::{self, IntegrityError};
use crate::models::{unix_millis, DownloadJob, JobStatus};
use crate::retry::{classify, FailureKind, RetryPolicy};
use crate::state_manager::{JobStore, StoreError};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("HTTP {0}")]
    Http(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("transfer ended early: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("download paused")]
    Paused,
    #[error("download cancelled")]
    Cancelled,
    #[error("job is no longer wanted")]
    Abandoned,
}

impl From<IntegrityError> for TransferError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::Io(e) => TransferError::Io(e),
            IntegrityError::Mismatch { expected, actual } => {
                TransferError::ChecksumMismatch { expected, actual }
            }
        }
    }
}

/// Tuning for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Write buffer size; bytes reach the disk in chunks of at most this size.
    pub chunk_size: usize,
    /// Minimum spacing between persisted progress checkpoints.
    pub checkpoint_interval: Duration,
    /// Abort with a transient error when no bytes arrive for this long.
    pub stall_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            checkpoint_interval: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared between the manager and one running worker: stop signals going in,
/// live byte counters and the finished flag coming out.
#[derive(Debug, Clone, Default)]
pub struct WorkerControl {
    stop: CancellationToken,
    finished: CancellationToken,
    pause_flag: Arc<AtomicBool>,
    downloaded: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop and leave the job `Paused`.
    pub fn pause(&self) {
        self.pause_flag.store(true, Ordering::SeqCst);
        self.stop.cancel();
    }

    /// Ask the worker to stop and leave the job `Cancelled`.
    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait until the worker has written its final state, or `timeout` passes.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.finished.cancelled())
            .await
            .is_ok()
    }

    /// (bytes downloaded, total bytes) as last seen by the worker.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.downloaded.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }

    fn stop_reason(&self) -> TransferError {
        if self.pause_flag.load(Ordering::SeqCst) {
            TransferError::Paused
        } else {
            TransferError::Cancelled
        }
    }
}

/// How a transfer ended. The job store already reflects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed { kind: FailureKind, message: String },
    /// A checkpoint was refused. The row was left as found or handed back to the queue.
    Abandoned,
}

/// Transfer executor: streams one job's file to disk and records the result.
pub struct DownloadWorker {
    store: Arc<dyn JobStore>,
    client: Arc<dyn TransferClient>,
    settings: TransferSettings,
    control: WorkerControl,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn TransferClient>,
        settings: TransferSettings,
        control: WorkerControl,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            control,
        }
    }

    /// Run a claimed (`Downloading`) job to a resting state. Never fails: every
    /// outcome is written to the store.
    pub async fn run(self, mut job: DownloadJob) -> TransferOutcome {
        debug!(job_id = %job.id, recording_id = %job.recording_id, "transfer starting");
        let result = if self.control.stop.is_cancelled() {
            Err(self.control.stop_reason())
        } else {
            self.transfer(&mut job).await
        };
        let outcome = self.record(&mut job, result).await;
        self.control.finished.cancel();
        outcome
    }

    async fn transfer(&self, job: &mut DownloadJob) -> Result<(), TransferError> {
        let temp_path = job.temporary_path();
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut existing = file_len(&temp_path).await?;
        if job.total_bytes > 0 && existing > job.total_bytes {
            info!(job_id = %job.id, existing, total = job.total_bytes, "partial file larger than expected; restarting");
            tokio::fs::remove_file(&temp_path).await?;
            existing = 0;
        }
        if job.total_bytes > 0 && existing == job.total_bytes {
            debug!(job_id = %job.id, "partial file already complete");
            job.bytes_downloaded = existing;
            return self.finish_file(job).await;
        }

        let (remote, offset) = tokio::select! {
            biased;
            _ = self.control.stop.cancelled() => return Err(self.control.stop_reason()),
            opened = self.open_validated(job, existing) => opened?,
        };
        if let Some(total) = remote.total_len {
            job.total_bytes = total;
        }
        job.bytes_downloaded = offset;
        self.control.total.store(job.total_bytes, Ordering::SeqCst);
        self.control.downloaded.store(offset, Ordering::SeqCst);
        self.checkpoint(job).await?;

        let file = if offset == 0 {
            File::create(&temp_path).await?
        } else {
            OpenOptions::new().append(true).open(&temp_path).await?
        };
        let mut writer = BufWriter::with_capacity(self.settings.chunk_size.max(4096), file);

        let pumped = self.pump(job, remote, &mut writer).await;
        // Keep whatever arrived, even on pause or failure, so the next attempt resumes.
        let flushed = writer.flush().await;
        pumped?;
        flushed?;
        writer.get_ref().sync_all().await?;

        if job.total_bytes == 0 {
            job.total_bytes = job.bytes_downloaded;
        } else if job.bytes_downloaded != job.total_bytes {
            return Err(TransferError::Incomplete {
                expected: job.total_bytes,
                received: job.bytes_downloaded,
            });
        }
        self.finish_file(job).await
    }

    /// Open the remote file, resuming at `existing` when the partial file is
    /// still consistent with the server. Returns the stream and its offset.
    async fn open_validated(
        &self,
        job: &DownloadJob,
        existing: u64,
    ) -> Result<(RemoteStream, u64), TransferError> {
        if existing > 0 {
            match self.client.open_stream(&job.url, existing).await {
                Ok(remote) if remote.ranged => {
                    let consistent = job.total_bytes == 0
                        || remote.total_len.map_or(true, |t| t == job.total_bytes);
                    if consistent {
                        debug!(job_id = %job.id, offset = existing, "resuming partial file");
                        return Ok((remote, existing));
                    }
                    info!(job_id = %job.id, "remote size changed; restarting from zero");
                }
                Ok(remote) => {
                    info!(job_id = %job.id, "server ignored range request; restarting from zero");
                    return Ok((remote, 0));
                }
                Err(TransferError::Http(416)) => {
                    info!(job_id = %job.id, "range not satisfiable; restarting from zero");
                }
                Err(e) => return Err(e),
            }
        }
        let remote = self.client.open_stream(&job.url, 0).await?;
        Ok((remote, 0))
    }

    async fn pump(
        &self,
        job: &mut DownloadJob,
        remote: RemoteStream,
        writer: &mut BufWriter<File>,
    ) -> Result<(), TransferError> {
        let mut body = remote.body;
        let mut ticker = tokio::time::interval(self.settings.checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_data = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.control.stop.cancelled() => {
                    return Err(self.control.stop_reason());
                }
                _ = ticker.tick() => {
                    if last_data.elapsed() >= self.settings.stall_timeout {
                        return Err(TransferError::Stalled(self.settings.stall_timeout));
                    }
                    writer.flush().await?;
                    self.checkpoint(job).await?;
                }
                next = body.next() => {
                    let Some(chunk) = next else { return Ok(()) };
                    let bytes = chunk?;
                    if bytes.is_empty() {
                        continue;
                    }
                    writer.write_all(&bytes).await?;
                    job.bytes_downloaded += bytes.len() as u64;
                    self.control.downloaded.store(job.bytes_downloaded, Ordering::SeqCst);
                    last_data = Instant::now();
                    if job.total_bytes > 0 && job.bytes_downloaded > job.total_bytes {
                        return Err(TransferError::Malformed(format!(
                            "received {} bytes, more than the advertised {}",
                            job.bytes_downloaded, job.total_bytes
                        )));
                    }
                }
            }
        }
    }

    /// Persist progress. Fails with `Abandoned` once the store says the job
    /// is no longer ours to finish.
    async fn checkpoint(&self, job: &mut DownloadJob) -> Result<(), TransferError> {
        let now = unix_millis();
        let progress = DownloadJob::progress_for(job.bytes_downloaded, job.total_bytes);
        let wanted = self
            .store
            .checkpoint(&job.id, job.bytes_downloaded, job.total_bytes, progress, now)
            .await?;
        if !wanted {
            return Err(TransferError::Abandoned);
        }
        job.progress = progress;
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    /// Verify and move the completed partial file into place.
    async fn finish_file(&self, job: &mut DownloadJob) -> Result<(), TransferError> {
        // Last chance to notice a cancel or delete before the file becomes visible.
        self.checkpoint(job).await?;
        let temp_path = job.temporary_path();
        if let Some(expected) = job.expected_sha256.as_deref() {
            if let Err(e) = integrity::verify_sha256(&temp_path, expected).await {
                if matches!(e, IntegrityError::Mismatch { .. }) {
                    // A corrupt file must not be resumed.
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    job.bytes_downloaded = 0;
                }
                return Err(e.into());
            }
        }
        tokio::fs::rename(&temp_path, &job.local_path).await?;
        Ok(())
    }

    /// Translate the transfer result into a guarded store write.
    async fn record(
        &self,
        job: &mut DownloadJob,
        result: Result<(), TransferError>,
    ) -> TransferOutcome {
        let now = unix_millis();
        job.updated_at = now;
        let outcome = match result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.progress = 1.0;
                job.bytes_downloaded = job.total_bytes;
                job.completed_at = Some(now);
                job.error_message = None;
                info!(job_id = %job.id, bytes = job.total_bytes, "transfer completed");
                TransferOutcome::Completed
            }
            Err(TransferError::Abandoned) => return self.release_abandoned(job).await,
            Err(TransferError::Paused) => {
                job.status = JobStatus::Paused;
                job.progress = DownloadJob::progress_for(job.bytes_downloaded, job.total_bytes);
                info!(job_id = %job.id, bytes = job.bytes_downloaded, "transfer paused");
                TransferOutcome::Paused
            }
            Err(TransferError::Cancelled) => {
                if let Err(e) = remove_if_exists(&job.temporary_path()).await {
                    warn!(job_id = %job.id, error = %e, "failed to remove partial file");
                }
                job.status = JobStatus::Cancelled;
                job.bytes_downloaded = 0;
                job.progress = 0.0;
                info!(job_id = %job.id, "transfer cancelled");
                TransferOutcome::Cancelled
            }
            Err(e) => {
                let kind = classify(&e);
                let policy = &self.settings.retry;
                job.status = JobStatus::Failed;
                job.retry_count = policy.count_after_failure(job.retry_count, kind);
                job.error_message = Some(e.to_string());
                job.progress = DownloadJob::progress_for(job.bytes_downloaded, job.total_bytes);
                warn!(
                    job_id = %job.id,
                    error = %e,
                    ?kind,
                    retry_count = job.retry_count,
                    terminal = policy.is_exhausted(job.retry_count),
                    "transfer failed"
                );
                TransferOutcome::Failed {
                    kind,
                    message: e.to_string(),
                }
            }
        };

        match self.store.compare_and_set(job, JobStatus::Downloading).await {
            Ok(true) => outcome,
            Ok(false) => {
                info!(job_id = %job.id, status = job.status.as_str(), "final state not written; job changed underneath");
                TransferOutcome::Abandoned
            }
            Err(e) => {
                // The row stays Downloading; the orphan sweep will recover it.
                warn!(job_id = %job.id, error = %e, "failed to persist final transfer state");
                outcome
            }
        }
    }

    /// A checkpoint was refused. A row someone else moved out of
    /// `Downloading` is theirs. A row still `Downloading` has no executor
    /// left once we return, so settle it: `Cancelled` if it is marked for
    /// deletion, otherwise back to `Queued` with its partial file.
    async fn release_abandoned(&self, job: &DownloadJob) -> TransferOutcome {
        let mut current = match self.store.get(&job.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                info!(job_id = %job.id, "job removed during transfer; stopping");
                return TransferOutcome::Abandoned;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to re-read abandoned job");
                return TransferOutcome::Abandoned;
            }
        };
        if current.status != JobStatus::Downloading {
            info!(job_id = %job.id, status = current.status.as_str(), "job changed underneath the transfer; stopping");
            return TransferOutcome::Abandoned;
        }

        let now = unix_millis();
        current.updated_at = now;
        current.heartbeat_at = Some(now);
        let outcome = if current.is_marked_for_deletion {
            if let Err(e) = remove_if_exists(&job.temporary_path()).await {
                warn!(job_id = %job.id, error = %e, "failed to remove partial file");
            }
            current.status = JobStatus::Cancelled;
            current.bytes_downloaded = 0;
            current.progress = 0.0;
            TransferOutcome::Cancelled
        } else {
            current.status = JobStatus::Queued;
            current.bytes_downloaded = job.bytes_downloaded;
            current.progress = DownloadJob::progress_for(job.bytes_downloaded, current.total_bytes);
            TransferOutcome::Abandoned
        };

        match self.store.compare_and_set(&current, JobStatus::Downloading).await {
            Ok(true) => {
                info!(job_id = %job.id, status = current.status.as_str(), "abandoned transfer released");
                outcome
            }
            Ok(false) => TransferOutcome::Abandoned,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to release abandoned job");
                TransferOutcome::Abandoned
            }
        }
    }
}

async fn file_len(path: &Path) -> Result<u64, std::io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success. Returns bytes freed.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<u64, std::io::Error> {
    let len = file_len(path).await?;
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(len),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Remove both the final and the partial file of a job. Returns bytes freed.
pub(crate) async fn remove_job_files(job: &DownloadJob) -> Result<u64, std::io::Error> {
    let freed = remove_if_exists(&job.local_path).await?;
    Ok(freed + remove_if_exists(&job.temporary_path()).await?)
}
