//! Model runtime: owns native model handles and ties together downloads,
//! memory budgeting, access coordination and failure recovery.

mod backend;
mod config;
mod error;
mod events;
mod host;
mod metrics;
mod resilience;
mod runtime;

pub use backend::{
    BackendError, BackendProvider, GenerationParams, InferenceBackend, LoadRequest, LoadedModel,
};
pub use config::{
    default_models_dir, AppliedUpdate, ConfigUpdate, DownloadSettings, RuntimeConfig,
    ALL_GPU_LAYERS, DEFAULT_CONTEXT_SIZE, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_STALL_TIMEOUT_SECS,
};
pub use error::{ConfigError, ErrorCode, Result, RuntimeError};
pub use events::{ModelChangeCallback, ModelChangeEvent, ModelEvents, Subscription};
pub use host::{
    estimated_footprint, ContextId, ModelHost, EMBEDDING_FOOTPRINT_BYTES, TEXT_FOOTPRINT_BYTES,
    VISION_FOOTPRINT_BYTES,
};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use resilience::{is_oom, is_recoverable, is_sequence_exhausted, SEQUENCE_EXHAUSTED_PATTERNS};
pub use runtime::{scan_models_dir, HealthStatus, ModelFileInfo, ModelRuntime, RequestOptions};
