// src/manager.rs

use crate::client::TransferClient;
use crate::config::EngineConfig;
use crate::constraints::Constraints;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::downloader::{remove_if_exists, DownloadWorker, TransferOutcome, WorkerControl};
use crate::models::{unix_millis, DownloadJob, FileRequest, JobId, JobStatus};
use crate::state_manager::{JobStore, StoreError};
use crate::status::{recording_status, RecordingDownloadStatus};
use crate::sweeper::{SweepReport, Sweeper};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long pause/cancel wait for a live worker to record its final state.
const STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("job store error: {0}")]
    State(#[from] StoreError),
    #[error("job with ID {0} not found")]
    JobNotFound(String),
    #[error("job {job_id} is {}", .status.as_str())]
    InvalidState { job_id: String, status: JobStatus },
    #[error("job {0} changed while the request was applied; try again")]
    Conflict(String),
}

struct WorkerHandle {
    control: WorkerControl,
    handle: JoinHandle<TransferOutcome>,
}

/// Public entry point of the engine. Owns the store, the worker registry,
/// and the dispatch and maintenance loops.
pub struct DownloadManager {
    store: Arc<dyn JobStore>,
    client: Arc<dyn TransferClient>,
    config: EngineConfig,
    download_root: PathBuf,
    dispatcher: Dispatcher,
    sweeper: Sweeper,
    workers: Arc<Mutex<HashMap<JobId, WorkerHandle>>>,
    dispatch_trigger: Arc<Notify>,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn TransferClient>,
        constraints: Arc<dyn Constraints>,
        config: EngineConfig,
        download_root: PathBuf,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            store.clone(),
            constraints.clone(),
            config.concurrency_cap,
            config.min_free_storage_bytes,
            download_root.clone(),
        );
        let sweeper = Sweeper::new(
            store.clone(),
            constraints,
            config.sweep_settings(),
            download_root.clone(),
        );
        Self {
            store,
            client,
            config,
            download_root,
            dispatcher,
            sweeper,
            workers: Arc::new(Mutex::new(HashMap::new())),
            dispatch_trigger: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Queue every file of a recording. Re-enqueueing an existing file is
    /// idempotent, undoes a pending deletion, and revives cancelled or
    /// terminally failed jobs.
    pub async fn enqueue(
        &self,
        recording_id: &str,
        files: Vec<FileRequest>,
        priority: i32,
    ) -> Result<Vec<JobId>, ManagerError> {
        let mut ids = Vec::with_capacity(files.len());
        for file in &files {
            let now = unix_millis();
            let job = DownloadJob::new(recording_id, file, priority, &self.download_root, now);
            if self.store.insert(&job).await? {
                info!(job_id = %job.id, recording_id, filename = %job.filename, priority, "job queued");
            } else {
                self.requeue_existing(&job.id, priority, now).await?;
            }
            if !ids.contains(&job.id) {
                ids.push(job.id);
            }
        }
        if !ids.is_empty() {
            self.dispatch_trigger.notify_one();
        }
        Ok(ids)
    }

    async fn requeue_existing(&self, job_id: &str, priority: i32, now: i64) -> Result<(), ManagerError> {
        if self.store.unmark_for_deletion(job_id, now).await? {
            info!(job_id, "pending deletion undone");
        }
        let mut job = self.require_job(job_id).await?;
        let previous = job.status;
        let max_retries = self.config.max_retries;
        let revive = previous == JobStatus::Cancelled || job.is_terminal_failure(max_retries);
        match previous {
            _ if revive => {
                job.status = JobStatus::Queued;
                job.priority = priority;
                job.retry_count = 0;
                job.error_message = None;
                job.completed_at = None;
                job.heartbeat_at = None;
                job.updated_at = now;
                if !self.store.compare_and_set(&job, previous).await? {
                    return Err(ManagerError::Conflict(job_id.to_string()));
                }
                info!(job_id, from = previous.as_str(), "job re-requested");
            }
            JobStatus::Queued if job.priority != priority => {
                job.priority = priority;
                job.updated_at = now;
                if !self.store.compare_and_set(&job, JobStatus::Queued).await? {
                    return Err(ManagerError::Conflict(job_id.to_string()));
                }
                debug!(job_id, priority, "queued job reprioritized");
            }
            _ => debug!(job_id, status = previous.as_str(), "job already known"),
        }
        Ok(())
    }

    /// Stop a job and keep its partial data. A queued job simply stops
    /// being eligible for dispatch.
    pub async fn pause(&self, job_id: &str) -> Result<(), ManagerError> {
        let job = self.require_job(job_id).await?;
        match job.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Queued => self.transition(job, JobStatus::Paused).await,
            JobStatus::Downloading => {
                if let Some(control) = self.live_control(job_id).await {
                    info!(job_id, "pausing live transfer");
                    control.pause();
                    if !control.wait_finished(STOP_WAIT).await {
                        warn!(job_id, "worker did not stop in time");
                    }
                    Ok(())
                } else {
                    // The transfer belongs to another process or died; its
                    // next checkpoint fails and it stops.
                    self.transition(job, JobStatus::Paused).await
                }
            }
            status => Err(ManagerError::InvalidState {
                job_id: job_id.to_string(),
                status,
            }),
        }
    }

    /// Put a paused job back in the queue, keeping its place and bytes.
    pub async fn resume(&self, job_id: &str) -> Result<(), ManagerError> {
        let job = self.require_job(job_id).await?;
        match job.status {
            JobStatus::Paused => {
                self.transition(job, JobStatus::Queued).await?;
                self.dispatch_trigger.notify_one();
                Ok(())
            }
            JobStatus::Queued | JobStatus::Downloading => Ok(()),
            status => Err(ManagerError::InvalidState {
                job_id: job_id.to_string(),
                status,
            }),
        }
    }

    /// Cancel a job and discard its partial file.
    pub async fn cancel(&self, job_id: &str) -> Result<(), ManagerError> {
        let job = self.require_job(job_id).await?;
        match job.status {
            JobStatus::Cancelled => Ok(()),
            JobStatus::Completed => Err(ManagerError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
            }),
            JobStatus::Downloading => {
                if let Some(control) = self.live_control(job_id).await {
                    info!(job_id, "cancelling live transfer");
                    control.cancel();
                    if !control.wait_finished(STOP_WAIT).await {
                        warn!(job_id, "worker did not stop in time");
                    }
                    Ok(())
                } else {
                    self.cancel_at_rest(job).await
                }
            }
            JobStatus::Failed if job.is_terminal_failure(self.config.max_retries) => {
                Err(ManagerError::InvalidState {
                    job_id: job_id.to_string(),
                    status: job.status,
                })
            }
            JobStatus::Queued | JobStatus::Paused | JobStatus::Failed => self.cancel_at_rest(job).await,
        }
    }

    async fn cancel_at_rest(&self, job: DownloadJob) -> Result<(), ManagerError> {
        let temp_path = job.temporary_path();
        self.transition(job, JobStatus::Cancelled).await?;
        if let Err(e) = remove_if_exists(&temp_path).await {
            warn!(path = %temp_path.display(), error = %e, "failed to remove partial file");
        }
        Ok(())
    }

    /// Soft-delete every job of a recording. Files stay until the grace
    /// window passes; enqueueing the recording again undoes the mark.
    pub async fn mark_for_deletion(&self, recording_id: &str) -> Result<usize, ManagerError> {
        let marked = self
            .store
            .mark_recording_for_deletion(recording_id, unix_millis())
            .await?;
        let jobs = self.store.get_by_recording(recording_id).await?;
        let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        let workers = self.workers.lock().await;
        for (id, worker) in workers.iter() {
            if ids.contains(id.as_str()) && !worker.control.is_finished() {
                worker.control.cancel();
            }
        }
        info!(recording_id, marked, "recording marked for deletion");
        Ok(marked)
    }

    pub async fn get_status(&self, recording_id: &str) -> Result<RecordingDownloadStatus, ManagerError> {
        Ok(recording_status(self.store.as_ref(), recording_id, self.config.max_retries).await?)
    }

    /// Status stream for one recording. The receiver sees a new value
    /// whenever a change to the recording's jobs alters the aggregate.
    pub async fn watch_status(
        &self,
        recording_id: &str,
    ) -> Result<watch::Receiver<RecordingDownloadStatus>, ManagerError> {
        // Subscribe before the first read so no change slips in between.
        let mut changes = self.store.subscribe();
        let initial = self.get_status(recording_id).await?;
        let (tx, rx) = watch::channel(initial);

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let recording_id = recording_id.to_string();
        let max_retries = self.config.max_retries;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    changed = changes.recv() => match changed {
                        Ok(id) if id != recording_id => continue,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
                match recording_status(store.as_ref(), &recording_id, max_retries).await {
                    Ok(status) => {
                        tx.send_if_modified(|current| {
                            if *current == status {
                                false
                            } else {
                                *current = status;
                                true
                            }
                        });
                    }
                    Err(e) => warn!(recording_id = %recording_id, error = %e, "status refresh failed"),
                }
            }
        });
        Ok(rx)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<DownloadJob>, ManagerError> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn jobs_for_recording(&self, recording_id: &str) -> Result<Vec<DownloadJob>, ManagerError> {
        Ok(self.store.get_by_recording(recording_id).await?)
    }

    /// Note that a recording was played; eviction removes the least
    /// recently accessed recordings first.
    pub async fn record_access(&self, recording_id: &str) -> Result<(), ManagerError> {
        self.store.touch_recording(recording_id, unix_millis()).await?;
        Ok(())
    }

    /// In-memory (bytes downloaded, total bytes) of a running transfer.
    /// Fresher than the persisted checkpoint.
    pub async fn live_progress(&self, job_id: &str) -> Option<(u64, u64)> {
        let workers = self.workers.lock().await;
        workers
            .get(job_id)
            .filter(|w| !w.control.is_finished())
            .map(|w| w.control.progress())
    }

    /// Run one dispatch cycle now and start workers for claimed jobs.
    pub async fn dispatch_now(&self) -> Result<DispatchReport, ManagerError> {
        self.prune_finished_workers().await;
        if self.shutdown.is_cancelled() {
            return Ok(DispatchReport::default());
        }
        if let Err(e) = self.sweeper.retry_failed(unix_millis()).await {
            warn!(error = %e, "auto-retry before dispatch failed");
        }
        let report = self.dispatcher.dispatch_once().await?;
        for job in &report.claimed {
            self.spawn_worker(job.clone()).await;
        }
        Ok(report)
    }

    /// Run one maintenance pass now.
    pub async fn sweep_now(&self) -> SweepReport {
        self.prune_finished_workers().await;
        let live = self.live_ids().await;
        self.sweeper.sweep(unix_millis(), &live).await
    }

    /// Nothing running in this process and nothing waiting in the queue.
    pub async fn is_idle(&self) -> Result<bool, ManagerError> {
        self.prune_finished_workers().await;
        if !self.workers.lock().await.is_empty() {
            return Ok(false);
        }
        Ok(self.store.active_count().await? == 0 && self.store.queued_by_priority(1).await?.is_empty())
    }

    /// Drive dispatch and maintenance until [`shutdown`](Self::shutdown).
    /// Rows left `Downloading` by a previous process are recovered first.
    pub async fn run(&self) -> Result<(), ManagerError> {
        let live = self.live_ids().await;
        let recovered = self
            .sweeper
            .recover_orphans(i64::MAX, unix_millis(), &live)
            .await?;
        if recovered > 0 {
            info!(recovered, "recovered transfers interrupted by a previous run");
        }
        self.sweep_now().await;

        let mut dispatch_tick = tokio::time::interval(self.config.dispatch_interval());
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.config.maintenance_interval());
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep_tick.tick().await;

        info!(cap = self.config.concurrency_cap, root = %self.download_root.display(), "download manager running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = dispatch_tick.tick() => {}
                _ = self.dispatch_trigger.notified() => {}
                _ = sweep_tick.tick() => {
                    self.sweep_now().await;
                }
            }
            if let Err(e) = self.dispatch_now().await {
                warn!(error = %e, "dispatch cycle failed");
            }
        }

        self.stop_workers().await;
        info!("download manager stopped");
        Ok(())
    }

    /// Stop the loops and pause every live transfer so nothing is left
    /// `Downloading`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_workers().await;
    }

    async fn stop_workers(&self) {
        let drained: Vec<(JobId, WorkerHandle)> = self.workers.lock().await.drain().collect();
        for (_, worker) in &drained {
            worker.control.pause();
        }
        for (job_id, worker) in drained {
            match tokio::time::timeout(STOP_WAIT, worker.handle).await {
                Ok(Ok(outcome)) => debug!(job_id = %job_id, ?outcome, "worker stopped"),
                Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "worker task failed"),
                Err(_) => warn!(job_id = %job_id, "worker did not stop in time"),
            }
        }
    }

    async fn spawn_worker(&self, job: DownloadJob) {
        let control = WorkerControl::new();
        let worker = DownloadWorker::new(
            self.store.clone(),
            self.client.clone(),
            self.config.transfer_settings(),
            control.clone(),
        );
        let trigger = self.dispatch_trigger.clone();
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move {
            let outcome = worker.run(job).await;
            // A slot is free; let the dispatcher look again.
            trigger.notify_one();
            outcome
        });
        self.workers
            .lock()
            .await
            .insert(job_id, WorkerHandle { control, handle });
    }

    async fn prune_finished_workers(&self) {
        let mut workers = self.workers.lock().await;
        workers.retain(|job_id, worker| {
            let running = !worker.handle.is_finished();
            if !running {
                debug!(job_id = %job_id, "pruning finished worker");
            }
            running
        });
    }

    async fn live_ids(&self) -> HashSet<JobId> {
        let workers = self.workers.lock().await;
        workers
            .iter()
            .filter(|(_, w)| !w.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn live_control(&self, job_id: &str) -> Option<WorkerControl> {
        let workers = self.workers.lock().await;
        workers
            .get(job_id)
            .filter(|w| !w.control.is_finished())
            .map(|w| w.control.clone())
    }

    async fn require_job(&self, job_id: &str) -> Result<DownloadJob, ManagerError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| ManagerError::JobNotFound(job_id.to_string()))
    }

    /// Guarded user transition from the job's current status.
    async fn transition(&self, mut job: DownloadJob, to: JobStatus) -> Result<(), ManagerError> {
        let from = job.status;
        job.status = to;
        job.updated_at = unix_millis();
        if to == JobStatus::Cancelled {
            job.bytes_downloaded = 0;
            job.progress = 0.0;
        }
        if !self.store.compare_and_set(&job, from).await? {
            return Err(ManagerError::Conflict(job.id));
        }
        info!(job_id = %job.id, from = from.as_str(), to = to.as_str(), "job state changed");
        Ok(())
    }
}
