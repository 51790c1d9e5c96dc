use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced to the IPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Model file or its companion is not on disk.
    ModelNotFound,
    /// Native load or parse failure, including corruption.
    ModelLoadFailed,
    Oom,
    InferenceFailed,
    /// Cancelled by the caller.
    Aborted,
    /// The runtime was shut down or never initialized.
    NotInitialized,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::ModelLoadFailed => "MODEL_LOAD_FAILED",
            Self::Oom => "OOM",
            Self::InferenceFailed => "INFERENCE_FAILED",
            Self::Aborted => "ABORTED",
            Self::NotInitialized => "NOT_INITIALIZED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime failure tagged with a stable code.
///
/// Serializes as `{ "code": ..., "message": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelNotFound, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "operation aborted")
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorCode::NotInitialized, "model runtime is not initialized")
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors reading the runtime configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_code_and_message() {
        let err = RuntimeError::new(ErrorCode::Oom, "ggml alloc failed");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "code": "OOM", "message": "ggml alloc failed" })
        );
    }

    #[test]
    fn test_error_display_includes_code() {
        let err = RuntimeError::model_not_found("missing.gguf");
        assert_eq!(err.to_string(), "MODEL_NOT_FOUND: missing.gguf");
    }

    #[test]
    fn test_code_names_match_serde() {
        for code in [
            ErrorCode::ModelNotFound,
            ErrorCode::ModelLoadFailed,
            ErrorCode::Oom,
            ErrorCode::InferenceFailed,
            ErrorCode::Aborted,
            ErrorCode::NotInitialized,
        ] {
            assert_eq!(
                serde_json::to_value(code).unwrap(),
                serde_json::Value::String(code.as_str().to_string())
            );
        }
    }
}
