// src/status.rs

use crate::models::{DownloadJob, JobStatus};
use crate::state_manager::{JobStore, StoreError};
use serde::{Deserialize, Serialize};

/// Coarse download status of one recording, derived from its jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordingDownloadStatus {
    NotDownloaded,
    Downloading {
        /// Progress of the file currently transferring, or -1.0 when none is.
        progress: f64,
        bytes_downloaded: u64,
        completed_tracks: usize,
        total_tracks: usize,
    },
    Downloaded,
    Failed {
        message: String,
    },
}

/// Payload-free state name for callers outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Queued,
    Downloading,
    Paused,
    Downloaded,
    Failed,
    Cancelled,
}

impl From<JobStatus> for DownloadState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => DownloadState::Queued,
            JobStatus::Downloading => DownloadState::Downloading,
            JobStatus::Paused => DownloadState::Paused,
            JobStatus::Completed => DownloadState::Downloaded,
            JobStatus::Failed => DownloadState::Failed,
            JobStatus::Cancelled => DownloadState::Cancelled,
        }
    }
}

impl From<&RecordingDownloadStatus> for DownloadState {
    fn from(status: &RecordingDownloadStatus) -> Self {
        match status {
            RecordingDownloadStatus::NotDownloaded => DownloadState::NotDownloaded,
            RecordingDownloadStatus::Downloading { .. } => DownloadState::Downloading,
            RecordingDownloadStatus::Downloaded => DownloadState::Downloaded,
            RecordingDownloadStatus::Failed { .. } => DownloadState::Failed,
        }
    }
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadState::NotDownloaded => "not_downloaded",
            DownloadState::Queued => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Downloaded => "downloaded",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }
}

impl RecordingDownloadStatus {
    pub fn state(&self) -> DownloadState {
        DownloadState::from(self)
    }
}

/// Aggregate the jobs of one recording. The result does not depend on the
/// order of `jobs`. Jobs marked for deletion must already be filtered out.
pub fn aggregate(jobs: &[DownloadJob], max_retries: u32) -> RecordingDownloadStatus {
    if jobs.is_empty() {
        return RecordingDownloadStatus::NotDownloaded;
    }
    if jobs.iter().all(|j| j.status == JobStatus::Completed) {
        return RecordingDownloadStatus::Downloaded;
    }

    let active = jobs
        .iter()
        .any(|j| matches!(j.status, JobStatus::Downloading | JobStatus::Queued));

    if !active {
        // Ties broken by id so the answer is order independent.
        let latest = jobs
            .iter()
            .filter(|j| j.is_terminal_failure(max_retries))
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| b.id.cmp(&a.id)));
        return match latest {
            Some(job) => RecordingDownloadStatus::Failed {
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string()),
            },
            None => RecordingDownloadStatus::NotDownloaded,
        };
    }

    let completed_tracks = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
    let total_tracks = jobs
        .iter()
        .filter(|j| j.status != JobStatus::Cancelled && !j.is_terminal_failure(max_retries))
        .count();
    let current = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Downloading)
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
    let (progress, bytes_downloaded) = match current {
        Some(job) => (job.progress, job.bytes_downloaded),
        None => (-1.0, 0),
    };
    RecordingDownloadStatus::Downloading {
        progress,
        bytes_downloaded,
        completed_tracks,
        total_tracks,
    }
}

/// Current status of a recording, ignoring jobs marked for deletion.
pub async fn recording_status(
    store: &dyn JobStore,
    recording_id: &str,
    max_retries: u32,
) -> Result<RecordingDownloadStatus, StoreError> {
    let jobs: Vec<DownloadJob> = store
        .get_by_recording(recording_id)
        .await?
        .into_iter()
        .filter(|j| !j.is_marked_for_deletion)
        .collect();
    Ok(aggregate(&jobs, max_retries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileRequest;
    use std::path::Path;

    const MAX: u32 = 3;

    fn job(name: &str, status: JobStatus) -> DownloadJob {
        let mut job = DownloadJob::new("rec", &FileRequest::new(name, "http://x"), 0, Path::new("/d"), 0);
        job.status = status;
        job
    }

    fn terminal(name: &str, message: &str, updated_at: i64) -> DownloadJob {
        let mut j = job(name, JobStatus::Failed);
        j.retry_count = MAX;
        j.error_message = Some(message.to_string());
        j.updated_at = updated_at;
        j
    }

    #[test]
    fn empty_is_not_downloaded() {
        assert_eq!(aggregate(&[], MAX), RecordingDownloadStatus::NotDownloaded);
    }

    #[test]
    fn all_completed_is_downloaded() {
        let jobs = [
            job("a", JobStatus::Completed),
            job("b", JobStatus::Completed),
            job("c", JobStatus::Completed),
        ];
        assert_eq!(aggregate(&jobs, MAX), RecordingDownloadStatus::Downloaded);
    }

    #[test]
    fn terminal_failure_without_in_flight_is_failed() {
        let jobs = [job("a", JobStatus::Completed), terminal("b", "HTTP 404", 5)];
        assert_eq!(
            aggregate(&jobs, MAX),
            RecordingDownloadStatus::Failed { message: "HTTP 404".into() }
        );
    }

    #[test]
    fn latest_terminal_failure_wins_in_any_order() {
        let older = terminal("a", "HTTP 404", 5);
        let newer = terminal("b", "sha256 mismatch", 9);
        let expected = RecordingDownloadStatus::Failed { message: "sha256 mismatch".into() };
        assert_eq!(aggregate(&[older.clone(), newer.clone()], MAX), expected);
        assert_eq!(aggregate(&[newer, older], MAX), expected);
    }

    #[test]
    fn queued_work_reports_downloading_with_track_counts() {
        let jobs = [job("a", JobStatus::Completed), job("b", JobStatus::Queued)];
        assert_eq!(
            aggregate(&jobs, MAX),
            RecordingDownloadStatus::Downloading {
                progress: -1.0,
                bytes_downloaded: 0,
                completed_tracks: 1,
                total_tracks: 2,
            }
        );
    }

    #[test]
    fn queued_work_outranks_a_terminal_failure() {
        let mut retrying = job("b", JobStatus::Queued);
        retrying.retry_count = 1;
        let jobs = [job("a", JobStatus::Completed), retrying, terminal("c", "HTTP 404", 1)];
        match aggregate(&jobs, MAX) {
            RecordingDownloadStatus::Downloading { completed_tracks, total_tracks, .. } => {
                assert_eq!(completed_tracks, 1);
                assert_eq!(total_tracks, 2);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn paused_job_does_not_hide_a_terminal_failure() {
        let jobs = [terminal("a", "HTTP 404", 3), job("b", JobStatus::Paused)];
        assert_eq!(
            aggregate(&jobs, MAX),
            RecordingDownloadStatus::Failed { message: "HTTP 404".into() }
        );
    }

    #[test]
    fn retryable_failure_does_not_hide_a_terminal_failure() {
        let mut retrying = job("b", JobStatus::Failed);
        retrying.retry_count = 1;
        let jobs = [terminal("a", "HTTP 404", 3), retrying];
        assert_eq!(
            aggregate(&jobs, MAX),
            RecordingDownloadStatus::Failed { message: "HTTP 404".into() }
        );
    }

    #[test]
    fn paused_without_active_work_is_not_downloaded() {
        let jobs = [job("a", JobStatus::Completed), job("b", JobStatus::Paused)];
        assert_eq!(aggregate(&jobs, MAX), RecordingDownloadStatus::NotDownloaded);
    }

    #[test]
    fn progress_comes_from_highest_priority_transfer() {
        let mut low = job("low", JobStatus::Downloading);
        low.priority = 5;
        low.progress = 0.9;
        low.bytes_downloaded = 900;
        let mut high = job("high", JobStatus::Downloading);
        high.priority = 1;
        high.progress = 0.25;
        high.bytes_downloaded = 250;
        match aggregate(&[low, high], MAX) {
            RecordingDownloadStatus::Downloading { progress, bytes_downloaded, .. } => {
                assert_eq!(progress, 0.25);
                assert_eq!(bytes_downloaded, 250);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn only_cancelled_is_not_downloaded() {
        let jobs = [job("a", JobStatus::Cancelled), job("b", JobStatus::Completed)];
        assert_eq!(aggregate(&jobs, MAX), RecordingDownloadStatus::NotDownloaded);
    }

    #[test]
    fn external_states_map_explicitly() {
        assert_eq!(DownloadState::from(JobStatus::Completed), DownloadState::Downloaded);
        assert_eq!(DownloadState::from(JobStatus::Paused).as_str(), "paused");
        assert_eq!(RecordingDownloadStatus::Downloaded.state(), DownloadState::Downloaded);
        assert_eq!(
            RecordingDownloadStatus::Failed { message: "x".into() }.state(),
            DownloadState::Failed
        );
    }

    #[tokio::test]
    async fn marked_jobs_are_ignored() {
        let store = crate::state_manager::StateManager::open_in_memory().await.unwrap();
        store.upsert(&job("a", JobStatus::Completed)).await.unwrap();
        assert_eq!(
            recording_status(&store, "rec", MAX).await.unwrap(),
            RecordingDownloadStatus::Downloaded
        );
        store.mark_recording_for_deletion("rec", 1).await.unwrap();
        assert_eq!(
            recording_status(&store, "rec", MAX).await.unwrap(),
            RecordingDownloadStatus::NotDownloaded
        );
    }
}
