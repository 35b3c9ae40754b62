// src/dispatcher.rs

use crate::constraints::Constraints;
use crate::models::{unix_millis, DownloadJob, JobStatus};
use crate::state_manager::{JobStore, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Why a dispatch cycle started nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    CycleInProgress,
    AtCapacity,
    NetworkUnavailable,
    LowStorage { available: u64, required: u64 },
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Jobs this cycle moved to `Downloading`; the caller starts their workers.
    pub claimed: Vec<DownloadJob>,
    pub skipped: Option<SkipReason>,
}

/// Selects queued jobs and claims them up to the concurrency cap.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    constraints: Arc<dyn Constraints>,
    concurrency_cap: usize,
    min_free_storage: u64,
    download_root: PathBuf,
    cycle: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        constraints: Arc<dyn Constraints>,
        concurrency_cap: usize,
        min_free_storage: u64,
        download_root: PathBuf,
    ) -> Self {
        Self {
            store,
            constraints,
            concurrency_cap,
            min_free_storage,
            download_root,
            cycle: Mutex::new(()),
        }
    }

    pub async fn dispatch_once(&self) -> Result<DispatchReport, StoreError> {
        let Ok(_guard) = self.cycle.try_lock() else {
            debug!("dispatch cycle already running; skipping trigger");
            return Ok(skipped(SkipReason::CycleInProgress));
        };

        let running = self.store.active_count().await?;
        let available = self.concurrency_cap.saturating_sub(running);
        if available == 0 {
            debug!(running, cap = self.concurrency_cap, "no free download slots");
            return Ok(skipped(SkipReason::AtCapacity));
        }
        if !self.constraints.network_available() {
            info!("network unavailable; dispatch deferred");
            return Ok(skipped(SkipReason::NetworkUnavailable));
        }
        match self.constraints.available_storage(&self.download_root) {
            Ok(free) if free < self.min_free_storage => {
                warn!(free, required = self.min_free_storage, "storage low; dispatch deferred");
                return Ok(skipped(SkipReason::LowStorage {
                    available: free,
                    required: self.min_free_storage,
                }));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read free storage; dispatching anyway"),
        }

        let candidates = self.store.queued_by_priority(available).await?;
        let mut report = DispatchReport::default();
        for mut job in candidates {
            let now = unix_millis();
            match self.store.claim(&job.id, now).await {
                Ok(true) => {
                    job.status = JobStatus::Downloading;
                    job.started_at = Some(now);
                    job.heartbeat_at = Some(now);
                    job.updated_at = now;
                    job.error_message = None;
                    info!(job_id = %job.id, recording_id = %job.recording_id, priority = job.priority, "job dispatched");
                    report.claimed.push(job);
                }
                Ok(false) => {
                    debug!(job_id = %job.id, "job changed before it could be claimed");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to claim job");
                }
            }
        }
        Ok(report)
    }
}

fn skipped(reason: SkipReason) -> DispatchReport {
    DispatchReport {
        claimed: Vec::new(),
        skipped: Some(reason),
    }
}
