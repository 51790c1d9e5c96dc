//! Resumable, integrity-checked artifact downloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{StatusCode, Url};
use sift_catalog::{Artifact, Catalog, ResourceType, PARTIAL_SUFFIX};
use sift_system::SystemProbe;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::state::Session;
use crate::tracker::DownloadTracker;
use crate::verify::sha256_file;
use crate::{DownloadError, DownloadProgress, DownloadState, DownloadStatus, Result};

/// Callback receiving throttled progress reports.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Per-call download options.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub on_progress: Option<ProgressCallback>,
    /// Caller-side cancellation. The fetcher derives a child token from it.
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Tunables for the fetcher.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub max_redirects: u32,
    /// Longest wait for the next body chunk before giving up.
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
    /// Fraction of the remaining bytes that must be free on disk.
    pub disk_safety_ratio: f64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            stall_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_millis(100),
            disk_safety_ratio: 0.9,
        }
    }
}

/// Downloads catalog artifacts into a single models directory.
///
/// In-progress bytes live in `<filename>.partial` and are only promoted to
/// the final name after the size and checksum checks pass.
pub struct ArtifactFetcher {
    models_dir: PathBuf,
    catalog: Arc<Catalog>,
    probe: Arc<dyn SystemProbe>,
    client: reqwest::Client,
    tracker: DownloadTracker,
    config: FetcherConfig,
}

impl ArtifactFetcher {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        catalog: Arc<Catalog>,
        probe: Arc<dyn SystemProbe>,
    ) -> Result<Self> {
        Self::with_config(models_dir, catalog, probe, FetcherConfig::default())
    }

    pub fn with_config(
        models_dir: impl Into<PathBuf>,
        catalog: Arc<Catalog>,
        probe: Arc<dyn SystemProbe>,
        config: FetcherConfig,
    ) -> Result<Self> {
        // Redirects are followed by hand so the hop count and status are ours.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            models_dir: models_dir.into(),
            catalog,
            probe,
            client,
            tracker: DownloadTracker::new(),
            config,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(filename)
    }

    pub fn partial_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(format!("{filename}{PARTIAL_SUFFIX}"))
    }

    /// Download a catalog artifact (model or companion) by filename.
    ///
    /// A vision model's companion is fetched afterwards when missing; a
    /// companion failure is logged and does not fail the primary.
    pub async fn download(&self, name: &str, options: DownloadOptions) -> Result<PathBuf> {
        let artifact = self
            .catalog
            .resolve(name)
            .ok_or_else(|| DownloadError::UnknownArtifact(name.to_string()))?;

        let path = self.fetch_artifact(&artifact, &options).await?;

        if artifact.resource_type == ResourceType::Vision {
            if let Some(companion) = &artifact.companion {
                if !self.is_present(&companion.filename).await {
                    self.fetch_companion(&companion.filename, &options).await;
                }
            }
        }

        Ok(path)
    }

    async fn fetch_companion(&self, filename: &str, options: &DownloadOptions) {
        let Some(companion) = self.catalog.resolve(filename) else {
            return;
        };
        tracing::info!(companion = %filename, owner = %companion.owner, "Fetching companion artifact");
        if let Err(e) = self.fetch_artifact(&companion, options).await {
            tracing::warn!(companion = %filename, error = %e, "Companion download failed");
        }
    }

    async fn fetch_artifact(&self, artifact: &Artifact, options: &DownloadOptions) -> Result<PathBuf> {
        let name = artifact.filename.as_str();
        let final_path = self.artifact_path(name);

        if self.is_complete(artifact).await {
            tracing::info!(model = %name, "Skipping download (already exists)");
            return Ok(final_path);
        }

        let token = match &options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        if !self
            .tracker
            .try_start(name, artifact.size_bytes, token.clone())
            .await
        {
            return Err(DownloadError::AlreadyDownloading(name.to_string()));
        }

        let result = self
            .run(artifact, &final_path, &token, options.on_progress.as_ref())
            .await;

        let status = match &result {
            Ok(_) => DownloadStatus::Complete,
            Err(e) => e.terminal_status(),
        };
        self.tracker.finish(name, status).await;

        match &result {
            Ok(path) => tracing::info!(model = %name, path = ?path, "Download complete"),
            Err(DownloadError::Cancelled) => tracing::info!(model = %name, "Download cancelled"),
            Err(e) => tracing::warn!(model = %name, status = ?status, error = %e, "Download failed"),
        }

        result.map(|_| final_path)
    }

    async fn run(
        &self,
        artifact: &Artifact,
        final_path: &Path,
        token: &CancellationToken,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<PathBuf> {
        let name = artifact.filename.as_str();
        let total = artifact.size_bytes;
        let partial = self.partial_path(name);

        tokio::fs::create_dir_all(&self.models_dir).await?;

        let mut offset = file_len(&partial).await;
        if total > 0 && offset >= total {
            tracing::warn!(model = %name, offset, total, "Discarding stale partial download");
            remove_if_exists(&partial).await?;
            offset = 0;
        }

        let resumed_from = offset;
        self.check_disk_space(total.saturating_sub(offset))?;

        let mut range_retried = false;
        let response = loop {
            let response = self.open(artifact, offset, token).await?;
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 && !range_retried {
                tracing::warn!(model = %name, offset, "Range rejected, restarting from zero");
                remove_if_exists(&partial).await?;
                offset = 0;
                range_retried = true;
                continue;
            }
            break response;
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !append {
            tracing::info!(model = %name, offset, "Server ignored range request, restarting");
            offset = 0;
        }
        if append {
            let start = content_range_start(response.headers());
            if start != Some(offset) {
                return Err(DownloadError::UnexpectedRange {
                    expected: offset,
                    actual: start,
                });
            }
        }
        if resumed_from > 0 && offset == 0 {
            // The free-space check above only covered the resumed remainder.
            self.check_disk_space(total)?;
        }
        self.tracker.begin_session(name, offset).await;
        tracing::debug!(model = %name, offset, total, append, "Streaming body");

        let file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await?
        } else {
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&partial)
                .await?
        };

        let mut writer = BufWriter::new(file);
        let mut session = Session::new(name, total, offset);
        let streamed = self
            .stream_body(name, response, &mut writer, &mut session, token, on_progress)
            .await;
        // Keep whatever arrived so a later call can resume from it.
        let flushed = writer.flush().await;
        drop(writer);

        self.tracker.record_progress(name, session.downloaded()).await;
        if let Some(callback) = on_progress {
            callback(session.progress());
        }
        streamed?;
        flushed?;

        let actual = file_len(&partial).await;
        if total > 0 && actual != total {
            remove_if_exists(&partial).await?;
            return Err(DownloadError::SizeMismatch {
                filename: name.to_string(),
                expected: total,
                actual,
            });
        }

        if let Some(expected) = &artifact.sha256 {
            let computed = sha256_file(&partial).await?;
            if !computed.eq_ignore_ascii_case(expected) {
                remove_if_exists(&partial).await?;
                return Err(DownloadError::ChecksumMismatch {
                    filename: name.to_string(),
                    expected: expected.clone(),
                    actual: computed,
                });
            }
            tracing::debug!(model = %name, "Checksum verified");
        }

        tokio::fs::rename(&partial, final_path).await?;
        Ok(final_path.to_path_buf())
    }

    /// Send the request, following redirects up to the configured limit.
    async fn open(
        &self,
        artifact: &Artifact,
        offset: u64,
        token: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let name = artifact.filename.as_str();
        let mut url = Url::parse(&artifact.url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {e}", artifact.url)))?;
        let mut redirects = 0u32;

        loop {
            let mut request = self.client.get(url.clone());
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }

            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                response = request.send() => response?,
            };

            if !response.status().is_redirection() {
                return Ok(response);
            }

            redirects += 1;
            if redirects > self.config.max_redirects {
                return Err(DownloadError::RedirectLimitExceeded {
                    limit: self.config.max_redirects,
                });
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| DownloadError::InvalidUrl(format!("redirect from {url} has no location")))?;
            let next = url
                .join(location)
                .map_err(|e| DownloadError::InvalidUrl(format!("{location}: {e}")))?;

            self.tracker.set_status(name, DownloadStatus::Redirecting).await;
            tracing::debug!(model = %name, hop = redirects, to = %next, "Following redirect");
            url = next;
        }
    }

    async fn stream_body<W: AsyncWrite + Unpin>(
        &self,
        name: &str,
        response: reqwest::Response,
        writer: &mut W,
        session: &mut Session,
        token: &CancellationToken,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let stall = self.config.stall_timeout;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(stall, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(DownloadError::Timeout {
                        seconds: stall.as_secs(),
                    })
                }
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            writer.write_all(&chunk).await?;
            session.advance(chunk.len() as u64);

            if session.should_emit(self.config.progress_interval) {
                self.tracker.record_progress(name, session.downloaded()).await;
                if let Some(callback) = on_progress {
                    callback(session.progress());
                }
            }
        }
    }

    fn check_disk_space(&self, remaining: u64) -> Result<()> {
        let Some(available) = self.probe.available_disk_bytes(&self.models_dir) else {
            tracing::debug!("Free disk space unknown, skipping check");
            return Ok(());
        };
        if (available as f64) < remaining as f64 * self.config.disk_safety_ratio {
            return Err(DownloadError::InsufficientDiskSpace {
                required: remaining,
                available,
            });
        }
        Ok(())
    }

    async fn is_complete(&self, artifact: &Artifact) -> bool {
        match tokio::fs::metadata(self.artifact_path(&artifact.filename)).await {
            Ok(meta) => meta.is_file() && (artifact.size_bytes == 0 || meta.len() == artifact.size_bytes),
            Err(_) => false,
        }
    }

    /// Whether the final file exists. Catalog artifacts must also match
    /// their declared size.
    pub async fn is_present(&self, filename: &str) -> bool {
        match self.catalog.resolve(filename) {
            Some(artifact) => self.is_complete(&artifact).await,
            None => tokio::fs::metadata(self.artifact_path(filename))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
        }
    }

    /// Cancel an in-flight download. Returns false when none is running.
    pub async fn cancel(&self, filename: &str) -> bool {
        self.tracker.cancel(filename).await
    }

    pub async fn cancel_all(&self) {
        self.tracker.cancel_all().await;
    }

    pub async fn is_downloading(&self, filename: &str) -> bool {
        self.tracker.has(filename).await
    }

    /// Active downloads and the last terminal state of finished ones.
    pub async fn status(&self) -> Vec<DownloadState> {
        self.tracker.snapshot().await
    }

    /// Remove the final file and any partial download for `filename`.
    ///
    /// Returns true if anything was removed.
    pub async fn delete(&self, filename: &str) -> Result<bool> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename == "."
            || filename == ".."
        {
            return Err(DownloadError::InvalidFilename(filename.to_string()));
        }

        if self.tracker.cancel(filename).await {
            tracing::info!(model = %filename, "Cancelled active download before delete");
        }

        let removed_final = remove_if_exists(&self.artifact_path(filename)).await?;
        let removed_partial = remove_if_exists(&self.partial_path(filename)).await?;
        if removed_final || removed_partial {
            tracing::info!(model = %filename, "Deleted model files");
        }
        Ok(removed_final || removed_partial)
    }
}

/// First byte of a `Content-Range: bytes <start>-<end>/<total>` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
