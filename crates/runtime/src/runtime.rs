//! Lifecycle orchestration for text, vision and embedding models.
//!
//! Every inference goes through the same path: a coordinator slot for its
//! type, a resident context from the budgeter, the native call, and at most
//! one reload-and-retry for recoverable native failures.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use sift_catalog::{classify_filename, Catalog, ResourceType, MODEL_EXTENSION};
use sift_coordinator::{AccessCoordinator, CoordinatorStatus};
use sift_download::{
    ArtifactFetcher, DownloadError, DownloadOptions, DownloadState, FetcherConfig,
};
use sift_health::{DegradationState, ErrorContext, ErrorResolution, ReadinessMonitor, ReadinessReport};
use sift_memory::{InUse, MemoryBudget, MemoryBudgeter};
use sift_system::{ComputeBackend, SystemProbe};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, BackendProvider, GenerationParams, InferenceBackend, LoadedModel};
use crate::config::{AppliedUpdate, ConfigUpdate, RuntimeConfig};
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::events::{ModelChangeEvent, ModelEvents, Subscription};
use crate::host::ModelHost;
use crate::metrics::{MetricsSnapshot, RuntimeMetrics};
use crate::resilience;

/// Per-call options for inference operations.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Shown in coordinator status; a UUID is generated when absent.
    pub operation_id: Option<String>,
    /// Cancelling rejects the call with `ABORTED`.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            operation_id: None,
            cancel: Some(cancel),
        }
    }
}

/// A `.gguf` file found in the models directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub resource_type: ResourceType,
    /// A vision projector rather than a loadable model.
    pub is_companion: bool,
    pub in_catalog: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub initialized: bool,
    pub gpu_backend: bool,
    pub cpu_fallback: bool,
    pub metrics: MetricsSnapshot,
    pub memory: MemoryBudget,
    pub coordinator: CoordinatorStatus,
    pub degradation: DegradationState,
}

/// Owner of every loaded model.
///
/// Construct once with [`ModelRuntime::initialize`] and share it by `Arc`.
pub struct ModelRuntime {
    config: Arc<RwLock<RuntimeConfig>>,
    catalog: Arc<Catalog>,
    backend: ComputeBackend,
    cpu_fallback: bool,
    fetcher: Arc<ArtifactFetcher>,
    coordinator: AccessCoordinator,
    budgeter: MemoryBudgeter<ModelHost>,
    monitor: ReadinessMonitor,
    events: ModelEvents,
    metrics: Arc<RuntimeMetrics>,
    initialized: AtomicBool,
    /// Serializes configuration updates.
    update_lock: tokio::sync::Mutex<()>,
}

impl ModelRuntime {
    /// Bring up a backend (GPU first, CPU on any failure) and the model stack.
    pub async fn initialize(
        mut config: RuntimeConfig,
        catalog: Arc<Catalog>,
        probe: Arc<dyn SystemProbe>,
        provider: &dyn BackendProvider,
    ) -> Result<Self> {
        if let Some(rejected) = config.enforce_embedding_allow_list() {
            tracing::warn!(model = %rejected, "Embedding model not allowed, using default");
        }

        let (backend, cpu_fallback) = select_backend(provider).await?;
        let backend_kind = backend.kind();

        let fetcher_config = FetcherConfig {
            max_redirects: config.download.max_redirects,
            stall_timeout: config.download.stall_timeout(),
            ..FetcherConfig::default()
        };
        let fetcher = ArtifactFetcher::with_config(
            config.models_dir.clone(),
            Arc::clone(&catalog),
            Arc::clone(&probe),
            fetcher_config,
        )
        .map_err(|e| RuntimeError::new(ErrorCode::NotInitialized, e.to_string()))?;
        let fetcher = Arc::new(fetcher);

        let monitor = ReadinessMonitor::new(Arc::clone(&probe), Arc::clone(&fetcher));
        monitor.set_cpu_fallback(cpu_fallback);

        let config = Arc::new(RwLock::new(config));
        let metrics = Arc::new(RuntimeMetrics::new());
        let coordinator = AccessCoordinator::new();

        let references = coordinator.active_references();
        let in_use: Arc<dyn InUse> = Arc::new(move |ty: ResourceType| references.in_use(ty));
        let host = ModelHost::new(
            backend,
            Arc::clone(&catalog),
            Arc::clone(&config),
            Arc::clone(&metrics),
        );
        let budgeter = MemoryBudgeter::new(host, probe, in_use);

        tracing::info!(backend = %backend_kind, cpu_fallback, "Model runtime initialized");

        Ok(Self {
            config,
            catalog,
            backend: backend_kind,
            cpu_fallback,
            fetcher,
            coordinator,
            budgeter,
            monitor,
            events: ModelEvents::new(),
            metrics,
            initialized: AtomicBool::new(true),
            update_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(RuntimeError::not_initialized())
        }
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn fetcher(&self) -> &ArtifactFetcher {
        &self.fetcher
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply a configuration update.
    ///
    /// Each changed type is locked against loads first, so a load of the old
    /// selection that is already running finishes and is then unloaded. A
    /// resident model is drained (bounded by the drain timeout) and unloaded;
    /// the next request loads the new model. Unload problems are logged, and
    /// a change event is published per changed type regardless.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<AppliedUpdate> {
        self.ensure_initialized()?;
        let _serial = self.update_lock.lock().await;

        let (applied, drain_timeout) = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            (config.apply(update), config.drain_timeout())
        };
        if let Some(rejected) = &applied.rejected_embedding_model {
            tracing::warn!(model = %rejected, "Embedding model not allowed, using default");
        }

        for change in &applied.changes {
            let ty = change.resource_type;
            let _load = self.coordinator.acquire_load_lock(ty).await;
            if self.budgeter.is_resident(ty) {
                if !self.coordinator.wait_for_idle(ty, drain_timeout).await {
                    tracing::warn!(
                        resource = %ty,
                        timeout_secs = drain_timeout.as_secs(),
                        "In-flight operations did not drain, unloading anyway"
                    );
                }
                match self.budgeter.unload(ty).await {
                    Ok(_) => tracing::info!(resource = %ty, model = %change.previous_model, "Unloaded previous model"),
                    Err(e) => tracing::warn!(resource = %ty, error = %e, "Failed to unload previous model"),
                }
            }
            self.events.publish(change);
        }

        Ok(applied)
    }

    pub async fn generate_text(
        &self,
        prompt: &str,
        params: &GenerationParams,
        options: RequestOptions,
    ) -> Result<String> {
        self.run(ResourceType::Text, options, move |model| async move {
            model.generate_text(prompt, params).await
        })
        .await
    }

    pub async fn generate_embedding(&self, text: &str, options: RequestOptions) -> Result<Vec<f32>> {
        self.run(ResourceType::Embedding, options, move |model| async move {
            model.embed(text).await
        })
        .await
    }

    /// Describe an image with the selected vision model.
    ///
    /// Fails fast with `MODEL_NOT_FOUND` when the model's projector is missing.
    pub async fn analyze_image(
        &self,
        image_path: &Path,
        prompt: &str,
        params: &GenerationParams,
        options: RequestOptions,
    ) -> Result<String> {
        self.ensure_initialized()?;
        let selected = self.config().vision_model;
        let companion = self
            .catalog
            .get(&selected)
            .and_then(|entry| entry.companion.as_ref())
            .map(|c| c.filename.clone());
        if let Some(companion) = companion {
            if !self.fetcher.is_present(&companion).await {
                return Err(RuntimeError::model_not_found(format!(
                    "companion {companion} for {selected} is not downloaded"
                )));
            }
        }

        self.run(ResourceType::Vision, options, move |model| async move {
            model.analyze_image(image_path, prompt, params).await
        })
        .await
    }

    async fn run<T, F, Fut>(&self, ty: ResourceType, options: RequestOptions, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn LoadedModel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        self.ensure_initialized()?;
        let cancel = options.cancel.unwrap_or_default();
        let work = self
            .coordinator
            .with_model(ty, options.operation_id, self.resilient(ty, &operation));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.metrics.record_aborted();
                tracing::debug!(resource = %ty, "Operation aborted");
                Err(RuntimeError::aborted())
            }
            result = work => result,
        }
    }

    /// Run once; on a recoverable native failure reload the type and retry
    /// exactly once.
    async fn resilient<T, F, Fut>(&self, ty: ResourceType, operation: &F) -> Result<T>
    where
        F: Fn(Arc<dyn LoadedModel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let model = self.resident_model(ty).await?;
        let err = match self.timed(operation(model)).await {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };
        if !resilience::is_recoverable(&err.message) {
            return Err(self.inference_error(ty, err));
        }

        tracing::warn!(resource = %ty, error = %err.message, "Recoverable native error, reloading model");
        self.metrics.record_retry();
        self.ensure_initialized()?;
        {
            let _load = self.coordinator.acquire_load_lock(ty).await;
            if let Err(e) = self.budgeter.unload(ty).await {
                tracing::warn!(resource = %ty, error = %e, "Unload before retry failed");
            }
        }

        let model = self.resident_model(ty).await?;
        self.timed(operation(model))
            .await
            .map_err(|e| self.inference_error(ty, e))
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> std::result::Result<T, BackendError> {
        let started = Instant::now();
        let result = fut.await;
        if result.is_ok() {
            self.metrics.record_inference(started.elapsed());
        }
        result
    }

    fn inference_error(&self, ty: ResourceType, err: BackendError) -> RuntimeError {
        self.metrics.record_inference_failure();
        let code = if resilience::is_oom(&err.message) {
            ErrorCode::Oom
        } else {
            ErrorCode::InferenceFailed
        };
        tracing::warn!(resource = %ty, code = %code, error = %err.message, "Inference failed");
        RuntimeError::new(code, err.message)
    }

    /// Resident native handle for a type, loading it under the load lock.
    ///
    /// Calls queued before a shutdown must not load once it has started, so
    /// the initialized flag is checked again under the lock.
    async fn resident_model(&self, ty: ResourceType) -> Result<Arc<dyn LoadedModel>> {
        // A forced unload can race the lookup once; the second pass loads.
        for _ in 0..2 {
            self.ensure_initialized()?;
            let context = match self.budgeter.get_loaded_context(ty) {
                Some(context) => context,
                None => {
                    let _load = self.coordinator.acquire_load_lock(ty).await;
                    self.ensure_initialized()?;
                    self.budgeter.ensure_resident(ty).await?
                }
            };
            if let Some(model) = self.budgeter.loader().model(&context) {
                return Ok(model);
            }
        }
        Err(RuntimeError::new(
            ErrorCode::ModelLoadFailed,
            format!("{ty} model was unloaded while starting the operation"),
        ))
    }

    /// Every `.gguf` file in the models directory.
    pub async fn list_models(&self) -> std::io::Result<Vec<ModelFileInfo>> {
        scan_models_dir(self.fetcher.models_dir(), &self.catalog).await
    }

    pub async fn download_model(
        &self,
        name: &str,
        options: DownloadOptions,
    ) -> std::result::Result<PathBuf, DownloadError> {
        self.fetcher.download(name, options).await
    }

    pub async fn cancel_download(&self, name: &str) -> bool {
        self.fetcher.cancel(name).await
    }

    pub async fn download_status(&self) -> Vec<DownloadState> {
        self.fetcher.status().await
    }

    /// Delete a model file. A resident selection using it is unloaded first.
    pub async fn delete_model(&self, name: &str) -> std::result::Result<bool, DownloadError> {
        let drain_timeout = self.config().drain_timeout();
        for (ty, selected) in self.config().selections() {
            if selected != name {
                continue;
            }
            let _load = self.coordinator.acquire_load_lock(ty).await;
            if !self.budgeter.is_resident(ty) {
                continue;
            }
            if !self.coordinator.wait_for_idle(ty, drain_timeout).await {
                tracing::warn!(resource = %ty, "Deleting model with operations still in flight");
            }
            if let Err(e) = self.budgeter.unload(ty).await {
                tracing::warn!(resource = %ty, error = %e, "Failed to unload model before delete");
            }
        }
        self.fetcher.delete(name).await
    }

    pub fn on_model_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModelChangeEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub async fn check_readiness(&self) -> ReadinessReport {
        let selections = self.config().selections();
        self.monitor.check_system_readiness(&selections).await
    }

    pub fn handle_error(&self, message: &str, context: &ErrorContext) -> ErrorResolution {
        sift_health::handle_error(message, context)
    }

    pub fn memory(&self) -> MemoryBudget {
        self.budgeter.snapshot()
    }

    pub fn health_status(&self) -> HealthStatus {
        let initialized = self.is_initialized();
        let degradation = self.monitor.degradation_state();
        HealthStatus {
            healthy: initialized && degradation.missing_models.is_empty(),
            initialized,
            gpu_backend: self.backend == ComputeBackend::Gpu,
            cpu_fallback: self.cpu_fallback,
            metrics: self.metrics.snapshot(),
            memory: self.budgeter.snapshot(),
            coordinator: self.coordinator.status(),
            degradation,
        }
    }

    /// Stop accepting work, cancel downloads, drain and unload every type.
    ///
    /// Later calls fail with `NOT_INITIALIZED`.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down model runtime");

        self.fetcher.cancel_all().await;

        let drain_timeout = self.config().drain_timeout();
        for ty in ResourceType::ALL {
            let _load = self.coordinator.acquire_load_lock(ty).await;
            if !self.coordinator.wait_for_idle(ty, drain_timeout).await {
                tracing::warn!(resource = %ty, "Operations still running at shutdown");
            }
            if let Err(e) = self.budgeter.unload(ty).await {
                tracing::warn!(resource = %ty, error = %e, "Failed to unload model at shutdown");
            }
        }
        tracing::info!("Model runtime stopped");
    }
}

async fn select_backend(
    provider: &dyn BackendProvider,
) -> Result<(Arc<dyn InferenceBackend>, bool)> {
    match provider.init(ComputeBackend::Gpu).await {
        Ok(backend) => return Ok((backend, false)),
        Err(e) => tracing::warn!(error = %e, "GPU backend unavailable, falling back to CPU"),
    }
    provider
        .init(ComputeBackend::Cpu)
        .await
        .map(|backend| (backend, true))
        .map_err(|e| {
            RuntimeError::new(
                ErrorCode::NotInitialized,
                format!("no inference backend available: {e}"),
            )
        })
}

/// Scan a models directory for `.gguf` files. In-progress downloads are
/// excluded and a missing directory is empty.
pub async fn scan_models_dir(
    models_dir: &Path,
    catalog: &Catalog,
) -> std::io::Result<Vec<ModelFileInfo>> {
    let mut entries = match tokio::fs::read_dir(models_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut models = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let artifact = catalog.resolve(&name);
        models.push(ModelFileInfo {
            resource_type: artifact
                .as_ref()
                .map(|a| a.resource_type)
                .unwrap_or_else(|| classify_filename(&name)),
            is_companion: artifact.as_ref().is_some_and(|a| a.is_companion()),
            in_catalog: artifact.is_some(),
            size_bytes: metadata.len(),
            name,
            path,
        });
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}
