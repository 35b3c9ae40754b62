// src/retry.rs

//! Failure classification and retry backoff.
//!
//! Transfers never retry in place: a failed job is written back as `Failed`
//! and the sweeper re-queues it once its backoff has elapsed. This module
//! holds the shared rules for both sides.

use crate::downloader::TransferError;
use std::time::Duration;

/// High-level classification of a transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, dropped connections, 5xx, throttling. Retried with backoff.
    Transient,
    /// 404 and other client errors, malformed responses, local disk errors.
    Permanent,
}

/// Exponential backoff with a bounded number of retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Failures allowed before a job is pinned as terminally failed.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry_count`, capped at `max_delay`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = 1u32 << retry_count.min(20);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Retry count to persist after a failure of the given kind.
    /// Permanent failures spend the whole budget at once.
    pub fn count_after_failure(&self, retry_count: u32, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Transient => retry_count.saturating_add(1).min(self.max_retries),
            FailureKind::Permanent => self.max_retries,
        }
    }
}

/// Classify an HTTP status code.
pub fn classify_http_status(code: u16) -> FailureKind {
    match code {
        408 | 425 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Classify a transfer error. User-initiated stops never reach this point.
pub fn classify(err: &TransferError) -> FailureKind {
    match err {
        TransferError::Network(e) => {
            if e.is_builder() || e.is_redirect() {
                FailureKind::Permanent
            } else if let Some(status) = e.status() {
                classify_http_status(status.as_u16())
            } else {
                FailureKind::Transient
            }
        }
        TransferError::Connection(_)
        | TransferError::Stalled(_)
        | TransferError::Incomplete { .. }
        | TransferError::Store(_) => FailureKind::Transient,
        TransferError::Http(code) => classify_http_status(*code),
        TransferError::Io(_)
        | TransferError::Malformed(_)
        | TransferError::ChecksumMismatch { .. } => FailureKind::Permanent,
        TransferError::Paused | TransferError::Cancelled | TransferError::Abandoned => {
            FailureKind::Permanent
        }
    }
}
