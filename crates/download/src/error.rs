use crate::DownloadStatus;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("invalid model filename: {0}")]
    InvalidFilename(String),

    #[error("download already in progress: {0}")]
    AlreadyDownloading(String),

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("too many redirects (limit {limit})")]
    RedirectLimitExceeded { limit: u32 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("HTTP {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("server resumed at byte {actual:?}, expected {expected}")]
    UnexpectedRange { expected: u64, actual: Option<u64> },

    #[error("size mismatch for {filename}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        filename: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("download stalled for {seconds}s")]
    Timeout { seconds: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Status recorded for the artifact when a download ends with this error.
    pub fn terminal_status(&self) -> DownloadStatus {
        match self {
            Self::Cancelled => DownloadStatus::Cancelled,
            Self::SizeMismatch { .. } | Self::Timeout { .. } => DownloadStatus::Incomplete,
            Self::ChecksumMismatch { .. } => DownloadStatus::Corrupted,
            _ => DownloadStatus::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
