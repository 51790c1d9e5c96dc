//! Owner of native model handles.
//!
//! The budgeter only ever sees a [`ContextId`]; the handle behind it lives
//! here and is released through the backend on unload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use sift_catalog::{Catalog, ResourceType};
use sift_memory::ResidentLoader;
use sift_system::{GIB, MIB};

use crate::backend::{InferenceBackend, LoadRequest, LoadedModel};
use crate::config::RuntimeConfig;
use crate::error::{ErrorCode, RuntimeError};
use crate::metrics::RuntimeMetrics;
use crate::resilience;

/// Fallback footprints for selections outside the catalog.
pub const TEXT_FOOTPRINT_BYTES: u64 = 4 * GIB;
pub const VISION_FOOTPRINT_BYTES: u64 = 5 * GIB;
pub const EMBEDDING_FOOTPRINT_BYTES: u64 = 500 * MIB;

/// Resident size relative to the file size (KV cache and scratch buffers).
const FOOTPRINT_NUMERATOR: u64 = 12;
const FOOTPRINT_DENOMINATOR: u64 = 10;

/// Expected resident size of `model_name` loaded as `resource_type`.
///
/// Catalog models use their file size plus 20%; anything else falls back to
/// a fixed per-type footprint.
pub fn estimated_footprint(catalog: &Catalog, resource_type: ResourceType, model_name: &str) -> u64 {
    match catalog.get(model_name) {
        Some(entry) => entry.size_bytes * FOOTPRINT_NUMERATOR / FOOTPRINT_DENOMINATOR,
        None => match resource_type {
            ResourceType::Text => TEXT_FOOTPRINT_BYTES,
            ResourceType::Vision => VISION_FOOTPRINT_BYTES,
            ResourceType::Embedding => EMBEDDING_FOOTPRINT_BYTES,
        },
    }
}

/// Token identifying one loaded model instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextId {
    pub resource_type: ResourceType,
    pub model_name: String,
    /// Increases with every load, so a reload never reuses an id.
    pub generation: u64,
}

struct Handle {
    generation: u64,
    model: Arc<dyn LoadedModel>,
}

pub struct ModelHost {
    backend: Arc<dyn InferenceBackend>,
    catalog: Arc<Catalog>,
    config: Arc<RwLock<RuntimeConfig>>,
    metrics: Arc<RuntimeMetrics>,
    handles: Mutex<HashMap<ResourceType, Handle>>,
    generation: AtomicU64,
}

impl ModelHost {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        catalog: Arc<Catalog>,
        config: Arc<RwLock<RuntimeConfig>>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            backend,
            catalog,
            config,
            metrics,
            handles: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Native handle for a context, if it is still the resident one.
    pub fn model(&self, context: &ContextId) -> Option<Arc<dyn LoadedModel>> {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .get(&context.resource_type)
            .filter(|h| h.generation == context.generation)
            .map(|h| Arc::clone(&h.model))
    }

    fn load_request(&self, resource_type: ResourceType) -> LoadRequest {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let model_name = config.selected(resource_type).to_string();
        let companion_path = self
            .catalog
            .get(&model_name)
            .and_then(|entry| entry.companion.as_ref())
            .map(|c| config.models_dir.join(&c.filename));

        LoadRequest {
            resource_type,
            model_path: config.models_dir.join(&model_name),
            model_name,
            companion_path,
            gpu_layers: config.gpu_layers,
            context_size: config.context_size,
            threads: config.threads,
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl ResidentLoader for ModelHost {
    type Context = ContextId;
    type Error = RuntimeError;

    async fn load(&self, resource_type: ResourceType) -> Result<ContextId, RuntimeError> {
        let request = self.load_request(resource_type);

        if !exists(&request.model_path).await {
            self.metrics.record_load_failure();
            return Err(RuntimeError::model_not_found(format!(
                "{} model {} is not downloaded",
                resource_type, request.model_name
            )));
        }
        if let Some(companion) = &request.companion_path {
            if !exists(companion).await {
                self.metrics.record_load_failure();
                return Err(RuntimeError::model_not_found(format!(
                    "companion {} for {} is not downloaded",
                    companion.display(),
                    request.model_name
                )));
            }
        }

        let model_name = request.model_name.clone();
        let model = match self.backend.load(request).await {
            Ok(model) => model,
            Err(e) => {
                self.metrics.record_load_failure();
                let code = if resilience::is_oom(&e.message) {
                    ErrorCode::Oom
                } else {
                    ErrorCode::ModelLoadFailed
                };
                return Err(RuntimeError::new(code, e.message));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource_type, Handle { generation, model });
        self.metrics.record_load();
        tracing::debug!(resource = %resource_type, model = %model_name, generation, "Native model loaded");

        Ok(ContextId {
            resource_type,
            model_name,
            generation,
        })
    }

    async fn unload(&self, resource_type: ResourceType, context: ContextId) -> Result<(), RuntimeError> {
        let handle = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            match handles.get(&resource_type) {
                Some(h) if h.generation == context.generation => handles.remove(&resource_type),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            tracing::debug!(resource = %resource_type, generation = context.generation, "No native handle to release");
            return Ok(());
        };

        self.metrics.record_unload();
        handle.model.release().await.map_err(|e| {
            RuntimeError::new(
                ErrorCode::ModelLoadFailed,
                format!("failed to release {}: {}", context.model_name, e.message),
            )
        })
    }

    fn estimated_size(&self, resource_type: ResourceType) -> u64 {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        estimated_footprint(&self.catalog, resource_type, config.selected(resource_type))
    }
}
