//! Error classification into recovery actions.
//!
//! The native runtime only reports free-form messages, so classification is
//! keyword based over the lowercased text.

use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;

/// Phrases that indicate the device ran out of memory.
pub const OOM_PATTERNS: &[&str] = &[
    "out of memory",
    "cudamalloc failed",
    "cuda error: out of memory",
    "failed to allocate",
    "insufficient memory",
    "not enough memory",
    "out of vram",
    "not enough vram",
    "insufficient vram",
    "ggml_metal_graph_compute: command buffer",
];

/// Bare tokens matched as whole words only.
pub const OOM_WORDS: &[&str] = &["oom"];

/// Phrases that indicate a broken or unreadable model file.
pub const CORRUPT_MODEL_PATTERNS: &[&str] = &[
    "failed to load model",
    "invalid gguf",
    "invalid magic",
    "not a gguf file",
];

/// Phrases that indicate a full disk.
pub const DISK_FULL_PATTERNS: &[&str] = &["enospc", "no space left"];

/// What the application should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryWithCpu,
    RedownloadModel {
        #[serde(rename = "modelType")]
        model_type: Option<ResourceType>,
    },
    CleanupDisk,
    None,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryWithCpu => "retry_with_cpu",
            Self::RedownloadModel { .. } => "redownload_model",
            Self::CleanupDisk => "cleanup_disk",
            Self::None => "none",
        }
    }
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub model_type: Option<ResourceType>,
    pub model_name: Option<String>,
    pub operation: Option<String>,
}

impl ErrorContext {
    pub fn for_model(model_type: ResourceType, model_name: impl Into<String>) -> Self {
        Self {
            model_type: Some(model_type),
            model_name: Some(model_name.into()),
            operation: None,
        }
    }
}

/// Result of [`handle_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResolution {
    pub action: RecoveryAction,
    pub message: String,
    pub should_notify_user: bool,
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == word)
}

/// Map an error message to a recovery action.
pub fn classify_error(message: &str, model_type: Option<ResourceType>) -> RecoveryAction {
    let lower = message.to_lowercase();

    if OOM_PATTERNS.iter().any(|p| lower.contains(p))
        || OOM_WORDS.iter().any(|w| contains_word(&lower, w))
    {
        RecoveryAction::RetryWithCpu
    } else if CORRUPT_MODEL_PATTERNS.iter().any(|p| lower.contains(p)) {
        RecoveryAction::RedownloadModel { model_type }
    } else if DISK_FULL_PATTERNS.iter().any(|p| lower.contains(p)) {
        RecoveryAction::CleanupDisk
    } else {
        RecoveryAction::None
    }
}

/// Classify an error and describe the recovery for the user.
pub fn handle_error(message: &str, context: &ErrorContext) -> ErrorResolution {
    let action = classify_error(message, context.model_type);
    let model = context.model_name.as_deref().unwrap_or("the model");

    let (text, should_notify_user) = match action {
        RecoveryAction::RetryWithCpu => (
            format!("Not enough GPU memory for {model}; falling back to the CPU."),
            true,
        ),
        RecoveryAction::RedownloadModel { .. } => (
            format!("{model} could not be loaded and may be corrupted. Download it again."),
            true,
        ),
        RecoveryAction::CleanupDisk => (
            "The disk is full. Free up space and try again.".to_string(),
            true,
        ),
        RecoveryAction::None => (format!("Operation failed: {message}"), false),
    };

    tracing::warn!(
        action = action.as_str(),
        model_type = ?context.model_type,
        operation = ?context.operation,
        error = %message,
        "Classified runtime error"
    );

    ErrorResolution {
        action,
        message: text,
        should_notify_user,
    }
}
