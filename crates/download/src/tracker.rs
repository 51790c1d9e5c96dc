//! Tracks active downloads with cancellation support.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{DownloadState, DownloadStatus};

#[derive(Debug)]
struct ActiveDownload {
    token: CancellationToken,
    state: DownloadState,
}

#[derive(Debug, Default)]
struct Downloads {
    active: HashMap<String, ActiveDownload>,
    /// Last terminal state per filename.
    finished: HashMap<String, DownloadState>,
}

/// Registry of in-flight downloads keyed by filename.
#[derive(Debug, Default)]
pub(crate) struct DownloadTracker {
    downloads: RwLock<Downloads>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a download is in progress.
    pub async fn has(&self, name: &str) -> bool {
        self.downloads.read().await.active.contains_key(name)
    }

    /// Register a download unless one is already running for `name`.
    ///
    /// Returns false when the filename is already being downloaded.
    pub async fn try_start(&self, name: &str, total_bytes: u64, token: CancellationToken) -> bool {
        let mut downloads = self.downloads.write().await;
        if downloads.active.contains_key(name) {
            return false;
        }
        downloads.active.insert(
            name.to_string(),
            ActiveDownload {
                token,
                state: DownloadState::new(name, total_bytes),
            },
        );
        true
    }

    /// Cancel a download if it exists.
    ///
    /// Returns true if the download was found. Cancelling twice is harmless.
    pub async fn cancel(&self, name: &str) -> bool {
        let downloads = self.downloads.read().await;
        if let Some(active) = downloads.active.get(name) {
            active.token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn cancel_all(&self) {
        let downloads = self.downloads.read().await;
        for active in downloads.active.values() {
            active.token.cancel();
        }
    }

    pub async fn set_status(&self, name: &str, status: DownloadStatus) {
        let mut downloads = self.downloads.write().await;
        if let Some(active) = downloads.active.get_mut(name) {
            active.state.status = status;
        }
    }

    /// Start a new HTTP session at `offset`.
    pub async fn begin_session(&self, name: &str, offset: u64) {
        let mut downloads = self.downloads.write().await;
        if let Some(active) = downloads.active.get_mut(name) {
            active.state.session_start_byte = offset;
            active.state.downloaded_bytes = offset;
            active.state.status = DownloadStatus::Downloading;
        }
    }

    /// Record bytes on disk. Never moves backwards within a session.
    pub async fn record_progress(&self, name: &str, downloaded_bytes: u64) {
        let mut downloads = self.downloads.write().await;
        if let Some(active) = downloads.active.get_mut(name) {
            active.state.downloaded_bytes = active.state.downloaded_bytes.max(downloaded_bytes);
        }
    }

    /// Mark a download as finished (removes it from the active set).
    pub async fn finish(&self, name: &str, status: DownloadStatus) {
        let mut downloads = self.downloads.write().await;
        if let Some(mut active) = downloads.active.remove(name) {
            active.state.status = status;
            downloads.finished.insert(name.to_string(), active.state);
        }
    }

    /// Active downloads followed by recently finished ones.
    pub async fn snapshot(&self) -> Vec<DownloadState> {
        let downloads = self.downloads.read().await;
        let mut states: Vec<DownloadState> = downloads
            .active
            .values()
            .map(|a| a.state.clone())
            .collect();
        states.extend(
            downloads
                .finished
                .iter()
                .filter(|(name, _)| !downloads.active.contains_key(*name))
                .map(|(_, state)| state.clone()),
        );
        states.sort_by(|a, b| a.filename.cmp(&b.filename));
        states
    }
}
