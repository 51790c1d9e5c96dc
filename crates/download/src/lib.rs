//! Artifact fetcher for model files.
//!
//! Downloads resume from `.partial` files, follow redirects by hand, and are
//! size- and checksum-verified before they are promoted to their final name.

mod error;
mod fetcher;
mod state;
mod tracker;
mod verify;

pub use error::{DownloadError, Result};
pub use fetcher::{ArtifactFetcher, DownloadOptions, FetcherConfig, ProgressCallback};
pub use state::{DownloadProgress, DownloadState, DownloadStatus};
pub use verify::sha256_file;
