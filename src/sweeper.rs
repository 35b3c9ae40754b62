// src/sweeper.rs

//! Periodic maintenance: orphan recovery, failed-job retry, deletion and
//! retention sweeps, and storage eviction.
//!
//! Every step is independent. A failure in one is logged and the others
//! still run; a failure on one job is logged and the step moves on.

use crate::constraints::Constraints;
use crate::downloader::remove_job_files;
use crate::models::{DownloadJob, JobId, JobStatus};
use crate::retry::{FailureKind, RetryPolicy};
use crate::state_manager::{JobStore, StoreError};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EVICTION_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub retry: RetryPolicy,
    pub deletion_grace: Duration,
    pub retention: Duration,
    pub heartbeat_timeout: Duration,
    pub min_free_storage: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub recovered: usize,
    pub requeued: usize,
    pub deleted: usize,
    pub purged: usize,
    pub evicted: usize,
    pub freed_bytes: u64,
    /// True when another sweep held the guard and this one did nothing.
    pub skipped: bool,
}

pub struct Sweeper {
    store: Arc<dyn JobStore>,
    constraints: Arc<dyn Constraints>,
    settings: SweepSettings,
    download_root: PathBuf,
    cycle: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        constraints: Arc<dyn Constraints>,
        settings: SweepSettings,
        download_root: PathBuf,
    ) -> Self {
        Self {
            store,
            constraints,
            settings,
            download_root,
            cycle: Mutex::new(()),
        }
    }

    /// One full maintenance pass. `live` holds the ids of jobs with a worker
    /// running in this process; those are never treated as orphans or swept.
    pub async fn sweep(&self, now: i64, live: &HashSet<JobId>) -> SweepReport {
        let Ok(_guard) = self.cycle.try_lock() else {
            debug!("maintenance already running; skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };

        let mut report = SweepReport::default();
        let orphan_cutoff = now.saturating_sub(millis(self.settings.heartbeat_timeout));
        match self.recover_orphans(orphan_cutoff, now, live).await {
            Ok(n) => report.recovered = n,
            Err(e) => warn!(error = %e, "orphan recovery failed"),
        }
        match self.retry_failed(now).await {
            Ok(n) => report.requeued = n,
            Err(e) => warn!(error = %e, "auto-retry failed"),
        }
        match self.sweep_deleted(now, live).await {
            Ok((n, bytes)) => {
                report.deleted = n;
                report.freed_bytes += bytes;
            }
            Err(e) => warn!(error = %e, "deletion sweep failed"),
        }
        match self.purge_expired(now, live).await {
            Ok((n, bytes)) => {
                report.purged = n;
                report.freed_bytes += bytes;
            }
            Err(e) => warn!(error = %e, "retention purge failed"),
        }
        match self.evict_for_space(live).await {
            Ok((n, bytes)) => {
                report.evicted = n;
                report.freed_bytes += bytes;
            }
            Err(e) => warn!(error = %e, "storage eviction failed"),
        }

        info!(
            recovered = report.recovered,
            requeued = report.requeued,
            deleted = report.deleted,
            purged = report.purged,
            evicted = report.evicted,
            freed_bytes = report.freed_bytes,
            "maintenance finished"
        );
        report
    }

    /// Requeue (or terminally fail) `Downloading` rows whose heartbeat is
    /// older than `cutoff`. Pass `i64::MAX` at startup to recover them all.
    pub async fn recover_orphans(
        &self,
        cutoff: i64,
        now: i64,
        live: &HashSet<JobId>,
    ) -> Result<usize, StoreError> {
        let policy = &self.settings.retry;
        let mut recovered = 0;
        for mut job in self.store.stale_downloading(cutoff).await? {
            if live.contains(&job.id) {
                continue;
            }
            job.retry_count = policy.count_after_failure(job.retry_count, FailureKind::Transient);
            job.updated_at = now;
            job.heartbeat_at = None;
            if policy.is_exhausted(job.retry_count) {
                job.status = JobStatus::Failed;
                job.error_message = Some("transfer interrupted too many times".to_string());
            } else {
                job.status = JobStatus::Queued;
                job.error_message = None;
            }
            match self.store.compare_and_set(&job, JobStatus::Downloading).await {
                Ok(true) => {
                    info!(job_id = %job.id, status = job.status.as_str(), retry_count = job.retry_count, "recovered orphaned transfer");
                    recovered += 1;
                }
                Ok(false) => debug!(job_id = %job.id, "orphan changed before recovery"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to recover orphan"),
            }
        }
        Ok(recovered)
    }

    /// Re-queue retryable failed jobs whose backoff has elapsed.
    pub async fn retry_failed(&self, now: i64) -> Result<usize, StoreError> {
        let policy = &self.settings.retry;
        let cutoff = now.saturating_sub(millis(policy.base_delay));
        let mut requeued = 0;
        for mut job in self
            .store
            .failed_retry_candidates(cutoff, policy.max_retries)
            .await?
        {
            let waited = now.saturating_sub(job.updated_at);
            if waited < millis(policy.backoff(job.retry_count)) {
                continue;
            }
            job.status = JobStatus::Queued;
            job.error_message = None;
            job.updated_at = now;
            match self.store.compare_and_set(&job, JobStatus::Failed).await {
                Ok(true) => {
                    info!(job_id = %job.id, retry_count = job.retry_count, "failed job re-queued");
                    requeued += 1;
                }
                Ok(false) => debug!(job_id = %job.id, "failed job changed before retry"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to re-queue job"),
            }
        }
        Ok(requeued)
    }

    async fn sweep_deleted(&self, now: i64, live: &HashSet<JobId>) -> Result<(usize, u64), StoreError> {
        let cutoff = now.saturating_sub(millis(self.settings.deletion_grace));
        let jobs = self.store.marked_for_deletion_before(cutoff).await?;
        Ok(self.remove_jobs(jobs, live, "deleted").await)
    }

    async fn purge_expired(&self, now: i64, live: &HashSet<JobId>) -> Result<(usize, u64), StoreError> {
        let cutoff = now.saturating_sub(millis(self.settings.retention));
        let jobs = self
            .store
            .terminal_before(cutoff, self.settings.retry.max_retries)
            .await?;
        Ok(self.remove_jobs(jobs, live, "purged").await)
    }

    async fn evict_for_space(&self, live: &HashSet<JobId>) -> Result<(usize, u64), StoreError> {
        let required = self.settings.min_free_storage;
        let available = match self.constraints.available_storage(&self.download_root) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not read free storage; skipping eviction");
                return Ok((0, 0));
            }
        };
        if available >= required {
            return Ok((0, 0));
        }
        let deficit = required - available;
        info!(available, required, deficit, "storage low; evicting least recently used downloads");

        let (mut evicted, mut freed) = (0, 0u64);
        let mut seen = HashSet::new();
        while freed < deficit {
            let batch: Vec<DownloadJob> = self
                .store
                .completed_by_last_access(EVICTION_BATCH)
                .await?
                .into_iter()
                .filter(|j| seen.insert(j.id.clone()))
                .collect();
            if batch.is_empty() {
                break;
            }
            for job in batch {
                if freed >= deficit {
                    break;
                }
                if let Some(bytes) = self.remove_job(&job, live, "evicted").await {
                    evicted += 1;
                    freed += bytes;
                }
            }
        }
        if freed < deficit {
            warn!(freed, deficit, "eviction could not cover the storage deficit");
        }
        Ok((evicted, freed))
    }

    async fn remove_jobs(&self, jobs: Vec<DownloadJob>, live: &HashSet<JobId>, what: &str) -> (usize, u64) {
        let (mut removed, mut freed) = (0, 0);
        for job in jobs {
            if let Some(bytes) = self.remove_job(&job, live, what).await {
                removed += 1;
                freed += bytes;
            }
        }
        (removed, freed)
    }

    /// Remove a job's files, then its row, then its recording directory if
    /// that is now empty. Returns the bytes freed, or `None` if skipped.
    async fn remove_job(&self, job: &DownloadJob, live: &HashSet<JobId>, what: &str) -> Option<u64> {
        if live.contains(&job.id) {
            debug!(job_id = %job.id, "worker still running; removal deferred");
            return None;
        }
        let freed = match remove_job_files(job).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to remove job files");
                return None;
            }
        };
        match self.store.delete(&job.id).await {
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to delete job row");
                return None;
            }
        }
        if let Some(dir) = job.local_path.parent() {
            // Fails harmlessly while other files of the recording remain.
            if tokio::fs::remove_dir(dir).await.is_ok() {
                debug!(recording_id = %job.recording_id, "removed empty recording directory");
            }
        }
        info!(job_id = %job.id, recording_id = %job.recording_id, freed, "job {what}");
        Some(freed)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
