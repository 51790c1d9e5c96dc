//! Seam to the native inference library.
//!
//! The runtime never links a native binding itself. A host registers a
//! [`BackendProvider`] that knows how to bring up a GPU or CPU backend, and
//! the runtime only talks to the traits below.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;
use sift_system::ComputeBackend;

/// Free-form failure reported by the native library.
///
/// Messages are classified by keyword, so backends should pass the native
/// text through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a backend needs to bring one model into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub resource_type: ResourceType,
    pub model_name: String,
    pub model_path: PathBuf,
    /// Vision projector, when the model declares one.
    pub companion_path: Option<PathBuf>,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub threads: Option<usize>,
}

/// Sampling parameters for text and vision generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
        }
    }
}

/// A model resident in the native library.
///
/// Only the operations matching the model's resource type are called.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn generate_text(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, BackendError> {
        Err(BackendError::new("text generation is not supported by this model"))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::new("embeddings are not supported by this model"))
    }

    async fn analyze_image(
        &self,
        _image_path: &Path,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, BackendError> {
        Err(BackendError::new("image analysis is not supported by this model"))
    }

    /// Free native memory. The handle is not used afterwards.
    async fn release(&self) -> Result<(), BackendError>;
}

/// An initialized native backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> ComputeBackend;

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn LoadedModel>, BackendError>;
}

/// Factory for backends, registered by the host application.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn init(&self, kind: ComputeBackend) -> Result<Arc<dyn InferenceBackend>, BackendError>;
}
