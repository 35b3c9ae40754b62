// src/models.rs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable job identifier: hex SHA-256 of `recording_id/filename`.
pub type JobId = String;

/// The status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parses the stored form. Unknown values yield `None` so callers can skip
    /// the row instead of guessing a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "downloading" => Some(JobStatus::Downloading),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// One file of a recording, as handed to `DownloadManager::enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub filename: String,
    pub url: String,
    /// Size advertised by the catalog, if any. Used to validate partial files.
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl FileRequest {
    pub fn new(filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            url: url.into(),
            expected_size: None,
            sha256: None,
        }
    }
}

/// Represents the complete, persistent state of a single file download.
/// One row per (recording, file) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadJob {
    pub id: JobId,
    pub recording_id: String,
    pub filename: String,
    pub url: String,
    pub priority: i32,
    pub status: JobStatus,

    pub progress: f64,
    pub bytes_downloaded: u64,
    /// Zero while the size is unknown.
    pub total_bytes: u64,

    /// Final destination. In-flight bytes live at `temporary_path()`.
    pub local_path: PathBuf,
    pub expected_sha256: Option<String>,

    pub error_message: Option<String>,
    pub retry_count: u32,

    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub heartbeat_at: Option<i64>,

    pub is_marked_for_deletion: bool,
    pub deletion_timestamp: Option<i64>,
    pub last_access_timestamp: i64,
}

impl DownloadJob {
    pub fn new(
        recording_id: &str,
        file: &FileRequest,
        priority: i32,
        download_root: &Path,
        now: i64,
    ) -> Self {
        let filename = sanitize_filename(&file.filename);
        Self {
            id: job_id(recording_id, &filename),
            recording_id: recording_id.to_string(),
            local_path: recording_dir(download_root, recording_id).join(&filename),
            filename,
            url: file.url.clone(),
            priority,
            status: JobStatus::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: file.expected_size.unwrap_or(0),
            expected_sha256: file.sha256.clone(),
            error_message: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            heartbeat_at: None,
            is_marked_for_deletion: false,
            deletion_timestamp: None,
            last_access_timestamp: now,
        }
    }

    /// Path of the partial file, e.g. `/root/rec/track01.flac.part`.
    pub fn temporary_path(&self) -> PathBuf {
        let destination_str = self.local_path.to_string_lossy();
        PathBuf::from(format!("{}.part", destination_str))
    }

    /// Fraction in 0.0..1.0 for a transfer in flight. Only completion reaches 1.0.
    pub fn progress_for(bytes_downloaded: u64, total_bytes: u64) -> f64 {
        if total_bytes == 0 {
            return 0.0;
        }
        let fraction = bytes_downloaded as f64 / total_bytes as f64;
        fraction.clamp(0.0, 0.999)
    }

    /// Failed with the retry budget spent. Never picked up by auto-retry.
    pub fn is_terminal_failure(&self, max_retries: u32) -> bool {
        self.status == JobStatus::Failed && self.retry_count >= max_retries
    }
}

/// Deterministic id so re-enqueueing the same file is idempotent.
pub fn job_id(recording_id: &str, filename: &str) -> JobId {
    let mut hasher = Sha256::new();
    hasher.update(recording_id.as_bytes());
    hasher.update(b"/");
    hasher.update(filename.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn recording_dir(download_root: &Path, recording_id: &str) -> PathBuf {
    download_root.join(sanitize_filename(recording_id))
}

/// Reduce a name to a single safe path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "download.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Current time as Unix milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
