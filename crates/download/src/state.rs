//! Download state machine and progress reporting types.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single artifact download.
///
/// `Downloading` and `Redirecting` are live states; everything else is
/// terminal and moves the entry out of the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Redirecting,
    Complete,
    /// Stream ended early or stalled; the partial file is resumable.
    Incomplete,
    /// Checksum did not match; the partial file was deleted.
    Corrupted,
    Cancelled,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Downloading | Self::Redirecting)
    }
}

/// Snapshot of one in-flight or recently finished download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub filename: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Offset the current session resumed from.
    pub session_start_byte: u64,
    pub started_at: DateTime<Utc>,
    pub status: DownloadStatus,
}

impl DownloadState {
    pub fn new(filename: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            total_bytes,
            downloaded_bytes: 0,
            session_start_byte: 0,
            started_at: Utc::now(),
            status: DownloadStatus::Downloading,
        }
    }
}

/// Progress report handed to download callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub filename: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Bytes per second over this session only.
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
}

impl DownloadProgress {
    /// Compute progress for a session that resumed at `session_start`.
    ///
    /// Speed and ETA only count bytes transferred in this session, so a
    /// resumed download does not report an inflated rate.
    pub fn compute(
        filename: &str,
        total_bytes: u64,
        downloaded_bytes: u64,
        session_start: u64,
        elapsed: Duration,
    ) -> Self {
        let session_bytes = downloaded_bytes.saturating_sub(session_start);
        let secs = elapsed.as_secs_f64();
        let speed_bps = if secs > 0.0 {
            session_bytes as f64 / secs
        } else {
            0.0
        };

        let remaining = total_bytes.saturating_sub(downloaded_bytes);
        let eta_seconds = if speed_bps > 0.0 {
            Some(remaining as f64 / speed_bps)
        } else {
            None
        };

        let percent = if total_bytes > 0 {
            ((downloaded_bytes.min(total_bytes) as f64 / total_bytes as f64) * 100.0)
                .clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            filename: filename.to_string(),
            downloaded_bytes,
            total_bytes,
            percent,
            speed_bps,
            eta_seconds,
        }
    }
}

/// Byte accounting for one HTTP session.
#[derive(Debug)]
pub(crate) struct Session {
    filename: String,
    total_bytes: u64,
    start_byte: u64,
    downloaded: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

impl Session {
    pub fn new(filename: &str, total_bytes: u64, start_byte: u64) -> Self {
        Self {
            filename: filename.to_string(),
            total_bytes,
            start_byte,
            downloaded: start_byte,
            started: Instant::now(),
            last_emit: None,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.downloaded = self.downloaded.saturating_add(bytes);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    /// True at most once per `interval`.
    pub fn should_emit(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress::compute(
            &self.filename,
            self.total_bytes,
            self.downloaded,
            self.start_byte,
            self.started.elapsed(),
        )
    }
}
