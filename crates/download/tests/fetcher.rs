use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use sift_catalog::{Catalog, CompanionArtifact, ModelDescriptor, ResourceType};
use sift_download::{
    ArtifactFetcher, DownloadError, DownloadOptions, DownloadProgress, DownloadStatus,
    FetcherConfig,
};
use sift_system::FixedProbe;
use tokio_util::sync::CancellationToken;

const BODY_LEN: usize = 1000;

#[derive(Clone)]
struct Fixture {
    body: Arc<Vec<u8>>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    bytes_sent: Arc<AtomicU64>,
    ignore_range: Arc<AtomicBool>,
    reject_range: Arc<AtomicBool>,
    /// Answer range requests with 206 from byte 0.
    misreport_range: Arc<AtomicBool>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            body: Arc::new((0..BODY_LEN).map(|i| (i % 251) as u8).collect()),
            ranges: Arc::new(Mutex::new(Vec::new())),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            ignore_range: Arc::new(AtomicBool::new(false)),
            reject_range: Arc::new(AtomicBool::new(false)),
            misreport_range: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(self.body.as_slice()))
    }
}

async fn file(State(fx): State<Fixture>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    fx.ranges.lock().unwrap().push(range.clone());

    if let Some(range) = range {
        if fx.reject_range.load(Ordering::SeqCst) {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }
        if !fx.ignore_range.load(Ordering::SeqCst) {
            let start: usize = if fx.misreport_range.load(Ordering::SeqCst) {
                0
            } else {
                range
                    .trim_start_matches("bytes=")
                    .trim_end_matches('-')
                    .parse()
                    .unwrap()
            };
            if start >= fx.body.len() {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            let slice = fx.body[start..].to_vec();
            fx.bytes_sent.fetch_add(slice.len() as u64, Ordering::SeqCst);
            let content_range = format!("bytes {}-{}/{}", start, fx.body.len() - 1, fx.body.len());
            return (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, content_range)],
                slice,
            )
                .into_response();
        }
    }

    fx.bytes_sent
        .fetch_add(fx.body.len() as u64, Ordering::SeqCst);
    (StatusCode::OK, fx.body.to_vec()).into_response()
}

async fn hop(UrlPath(n): UrlPath<u32>) -> Redirect {
    if n == 0 {
        Redirect::temporary("/file")
    } else {
        Redirect::temporary(&format!("/hop/{}", n - 1))
    }
}

/// Full body in ten chunks, 50 ms apart.
async fn slow(State(fx): State<Fixture>) -> Response {
    let chunks: Vec<Vec<u8>> = fx.body.chunks(BODY_LEN / 10).map(<[u8]>::to_vec).collect();
    let stream = futures::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, Infallible>(chunk)
    });
    Body::from_stream(stream).into_response()
}

/// One chunk, then silence.
async fn stall(State(fx): State<Fixture>) -> Response {
    let first = fx.body[..100].to_vec();
    let stream = futures::stream::iter(vec![first]).chain(futures::stream::once(async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Vec::new()
    }));
    Body::from_stream(stream.map(Ok::<_, Infallible>)).into_response()
}

async fn companion() -> Vec<u8> {
    b"projector".to_vec()
}

async fn serve(fx: Fixture) -> SocketAddr {
    let app = Router::new()
        .route("/file", get(file))
        .route("/hop/{n}", get(hop))
        .route("/slow", get(slow))
        .route("/stall", get(stall))
        .route("/companion", get(companion))
        .with_state(fx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn descriptor(name: &str, url: String, size: u64) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        display_name: name.to_string(),
        resource_type: ResourceType::Text,
        url,
        size_bytes: size,
        sha256: None,
        quantization: "Q8_0".to_string(),
        requires_gpu: false,
        min_ram_gb: 0,
        companion: None,
    }
}

fn fetcher(dir: &Path, entries: Vec<ModelDescriptor>, probe: FixedProbe) -> Arc<ArtifactFetcher> {
    let config = FetcherConfig {
        stall_timeout: Duration::from_millis(300),
        progress_interval: Duration::ZERO,
        ..FetcherConfig::default()
    };
    Arc::new(
        ArtifactFetcher::with_config(dir, Arc::new(Catalog::new(entries)), Arc::new(probe), config)
            .unwrap(),
    )
}

async fn status_of(fetcher: &ArtifactFetcher, name: &str) -> Option<DownloadStatus> {
    fetcher
        .status()
        .await
        .into_iter()
        .find(|s| s.filename == name)
        .map(|s| s.status)
}

#[tokio::test]
async fn test_resumes_from_partial_with_range_request() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let mut entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    entry.sha256 = Some(fx.sha256());
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    // Interrupted earlier after 400 bytes.
    tokio::fs::write(fetcher.partial_path("m.gguf"), &fx.body[..400])
        .await
        .unwrap();

    let reports: Arc<Mutex<Vec<DownloadProgress>>> = Arc::default();
    let sink = reports.clone();
    let options = DownloadOptions {
        on_progress: Some(Arc::new(move |p: DownloadProgress| sink.lock().unwrap().push(p))),
        cancel: None,
    };

    let path = fetcher.download("m.gguf", options).await.unwrap();

    assert_eq!(fx.ranges(), vec![Some("bytes=400-".to_string())]);
    assert_eq!(fx.bytes_sent.load(Ordering::SeqCst), 600);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
    assert!(!fetcher.partial_path("m.gguf").exists());

    let reports = reports.lock().unwrap();
    let last = reports.last().unwrap();
    assert_eq!(last.downloaded_bytes, BODY_LEN as u64);
    assert_eq!(last.percent, 100.0);
    assert!(reports
        .windows(2)
        .all(|w| w[0].downloaded_bytes <= w[1].downloaded_bytes));
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Complete));
}

#[tokio::test]
async fn test_stale_partial_restarts_from_zero() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    tokio::fs::write(fetcher.partial_path("m.gguf"), vec![7u8; BODY_LEN + 200])
        .await
        .unwrap();

    let path = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(fx.ranges(), vec![None]);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
}

#[tokio::test]
async fn test_full_response_to_range_request_truncates() {
    let fx = Fixture::new();
    fx.ignore_range.store(true, Ordering::SeqCst);
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    tokio::fs::write(fetcher.partial_path("m.gguf"), vec![9u8; 400])
        .await
        .unwrap();

    let path = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(fx.ranges(), vec![Some("bytes=400-".to_string())]);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
}

#[tokio::test]
async fn test_restart_from_zero_rechecks_disk_for_full_size() {
    let fx = Fixture::new();
    fx.ignore_range.store(true, Ordering::SeqCst);
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    // Enough for the 600 remaining bytes, not for all 1000.
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0).with_disk(700));

    tokio::fs::write(fetcher.partial_path("m.gguf"), &fx.body[..400])
        .await
        .unwrap();

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::InsufficientDiskSpace {
            required: 1000,
            available: 700
        }
    ));
    assert_eq!(fx.ranges(), vec![Some("bytes=400-".to_string())]);
    assert!(!fetcher.artifact_path("m.gguf").exists());
    let kept = tokio::fs::read(fetcher.partial_path("m.gguf")).await.unwrap();
    assert_eq!(kept, fx.body[..400]);
}

#[tokio::test]
async fn test_partial_content_from_wrong_offset_is_rejected() {
    let fx = Fixture::new();
    fx.misreport_range.store(true, Ordering::SeqCst);
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    tokio::fs::write(fetcher.partial_path("m.gguf"), &fx.body[..400])
        .await
        .unwrap();

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::UnexpectedRange {
            expected: 400,
            actual: Some(0)
        }
    ));
    let kept = tokio::fs::read(fetcher.partial_path("m.gguf")).await.unwrap();
    assert_eq!(kept, fx.body[..400]);
    assert!(!fetcher.artifact_path("m.gguf").exists());
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Error));
}

#[tokio::test]
async fn test_rejected_range_retries_once_from_zero() {
    let fx = Fixture::new();
    fx.reject_range.store(true, Ordering::SeqCst);
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    tokio::fs::write(fetcher.partial_path("m.gguf"), &fx.body[..400])
        .await
        .unwrap();

    let path = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(fx.ranges(), vec![Some("bytes=400-".to_string()), None]);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
}

#[tokio::test]
async fn test_size_mismatch_deletes_partial() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64 + 24);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::SizeMismatch {
            expected: 1024,
            actual: 1000,
            ..
        }
    ));
    assert!(!fetcher.partial_path("m.gguf").exists());
    assert!(!fetcher.artifact_path("m.gguf").exists());
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Incomplete));
}

#[tokio::test]
async fn test_checksum_mismatch_marks_corrupted() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let mut entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    entry.sha256 = Some("0".repeat(64));
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    match err {
        DownloadError::ChecksumMismatch { actual, .. } => assert_eq!(actual, fx.sha256()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!fetcher.partial_path("m.gguf").exists());
    assert!(!fetcher.artifact_path("m.gguf").exists());
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Corrupted));
}

#[tokio::test]
async fn test_follows_up_to_five_redirects() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entries = vec![
        // /hop/4 takes five redirects to reach /file, /hop/5 takes six.
        descriptor("five.gguf", format!("http://{addr}/hop/4"), BODY_LEN as u64),
        descriptor("six.gguf", format!("http://{addr}/hop/5"), BODY_LEN as u64),
    ];
    let fetcher = fetcher(dir.path(), entries, FixedProbe::new(0));

    let path = fetcher
        .download("five.gguf", DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);

    let err = fetcher
        .download("six.gguf", DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::RedirectLimitExceeded { limit: 5 }));
    assert!(!fetcher.artifact_path("six.gguf").exists());
}

#[tokio::test]
async fn test_concurrent_download_of_same_file_is_rejected() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/slow"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let first = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move { fetcher.download("m.gguf", DownloadOptions::default()).await })
    };
    while !fetcher.is_downloading("m.gguf").await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::AlreadyDownloading(_)));

    let path = first.await.unwrap().unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
}

#[tokio::test]
async fn test_double_cancel_rejects_once_and_keeps_partial() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/slow"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let options = DownloadOptions {
        on_progress: Some(Arc::new(move |p: DownloadProgress| {
            let _ = tx.send(p.downloaded_bytes);
        })),
        cancel: None,
    };
    let task = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move { fetcher.download("m.gguf", options).await })
    };

    while rx.recv().await.unwrap() == 0 {}
    assert!(fetcher.cancel("m.gguf").await);
    fetcher.cancel("m.gguf").await;

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!fetcher.artifact_path("m.gguf").exists());

    let kept = tokio::fs::metadata(fetcher.partial_path("m.gguf"))
        .await
        .unwrap()
        .len();
    assert!(kept > 0 && kept < BODY_LEN as u64);
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Cancelled));
    assert!(!fetcher.cancel("m.gguf").await);
}

#[tokio::test]
async fn test_caller_token_cancels_download() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/slow"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let token = CancellationToken::new();
    let options = DownloadOptions {
        on_progress: None,
        cancel: Some(token.clone()),
    };
    let task = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move { fetcher.download("m.gguf", options).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!fetcher.artifact_path("m.gguf").exists());
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/stall"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Timeout { .. }));
    let kept = tokio::fs::metadata(fetcher.partial_path("m.gguf"))
        .await
        .unwrap()
        .len();
    assert_eq!(kept, 100);
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Incomplete));
}

#[tokio::test]
async fn test_insufficient_disk_space_fails_before_request() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0).with_disk(100));

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::InsufficientDiskSpace {
            required: 1000,
            available: 100
        }
    ));
    assert!(fx.ranges().is_empty());
}

#[tokio::test]
async fn test_http_error_status_is_reported() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let entry = descriptor("m.gguf", format!("http://{addr}/nowhere"), BODY_LEN as u64);
    let fetcher = fetcher(dir.path(), vec![entry], FixedProbe::new(0));

    let err = fetcher
        .download("m.gguf", DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    assert_eq!(status_of(&fetcher, "m.gguf").await, Some(DownloadStatus::Error));
}

fn vision(addr: SocketAddr, companion_path: &str) -> ModelDescriptor {
    let mut entry = descriptor("v.gguf", format!("http://{addr}/file"), BODY_LEN as u64);
    entry.resource_type = ResourceType::Vision;
    entry.companion = Some(CompanionArtifact {
        filename: "v-mmproj.gguf".to_string(),
        url: format!("http://{addr}{companion_path}"),
        size_bytes: b"projector".len() as u64,
        sha256: None,
    });
    entry
}

#[tokio::test]
async fn test_vision_download_fetches_companion() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher(dir.path(), vec![vision(addr, "/companion")], FixedProbe::new(0));

    fetcher
        .download("v.gguf", DownloadOptions::default())
        .await
        .unwrap();

    assert!(fetcher.is_present("v.gguf").await);
    assert!(fetcher.is_present("v-mmproj.gguf").await);
    assert_eq!(
        tokio::fs::read(fetcher.artifact_path("v-mmproj.gguf"))
            .await
            .unwrap(),
        b"projector"
    );
}

#[tokio::test]
async fn test_companion_failure_does_not_fail_primary() {
    let fx = Fixture::new();
    let addr = serve(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher(dir.path(), vec![vision(addr, "/gone")], FixedProbe::new(0));

    let path = fetcher
        .download("v.gguf", DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&path).await.unwrap(), *fx.body);
    assert!(!fetcher.is_present("v-mmproj.gguf").await);
    assert_eq!(
        status_of(&fetcher, "v-mmproj.gguf").await,
        Some(DownloadStatus::Error)
    );
}
