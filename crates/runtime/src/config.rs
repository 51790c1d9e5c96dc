//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_catalog::{
    is_allowed_embedding_model, ResourceType, DEFAULT_EMBEDDING_MODEL, DEFAULT_TEXT_MODEL,
    DEFAULT_VISION_MODEL,
};

use crate::error::ConfigError;
use crate::events::ModelChangeEvent;

/// Offload every layer to the GPU.
pub const ALL_GPU_LAYERS: u32 = 999;

pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Default wait for in-flight operations before a forced unload.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;

/// Default models directory: `<data_local_dir>/sift/models`.
pub fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sift")
        .join("models")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadSettings {
    pub stall_timeout_secs: u64,
    pub max_redirects: u32,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            max_redirects: 5,
        }
    }
}

impl DownloadSettings {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub text_model: String,
    pub vision_model: String,
    pub embedding_model: String,
    pub gpu_layers: u32,
    pub context_size: u32,
    /// Inference threads; `None` lets the backend decide.
    pub threads: Option<usize>,
    pub models_dir: PathBuf,
    pub drain_timeout_secs: u64,
    pub download: DownloadSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            gpu_layers: ALL_GPU_LAYERS,
            context_size: DEFAULT_CONTEXT_SIZE,
            threads: None,
            models_dir: default_models_dir(),
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            download: DownloadSettings::default(),
        }
    }
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub text_model: Option<String>,
    pub vision_model: Option<String>,
    pub embedding_model: Option<String>,
    pub gpu_layers: Option<u32>,
    pub context_size: Option<u32>,
    pub threads: Option<usize>,
}

/// Outcome of applying a [`ConfigUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedUpdate {
    pub changes: Vec<ModelChangeEvent>,
    /// Embedding model that was requested but is not allowed.
    pub rejected_embedding_model: Option<String>,
}

impl AppliedUpdate {
    pub fn embedding_downgraded(&self) -> bool {
        self.rejected_embedding_model.is_some()
    }
}

impl RuntimeConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?path, "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut config: Self = serde_json::from_str(&contents)?;
        if let Some(rejected) = config.enforce_embedding_allow_list() {
            tracing::warn!(model = %rejected, "Embedding model not allowed, using default");
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn selected(&self, resource_type: ResourceType) -> &str {
        match resource_type {
            ResourceType::Text => &self.text_model,
            ResourceType::Vision => &self.vision_model,
            ResourceType::Embedding => &self.embedding_model,
        }
    }

    fn selected_mut(&mut self, resource_type: ResourceType) -> &mut String {
        match resource_type {
            ResourceType::Text => &mut self.text_model,
            ResourceType::Vision => &mut self.vision_model,
            ResourceType::Embedding => &mut self.embedding_model,
        }
    }

    /// Every selection, in [`ResourceType::ALL`] order.
    pub fn selections(&self) -> Vec<(ResourceType, String)> {
        ResourceType::ALL
            .into_iter()
            .map(|ty| (ty, self.selected(ty).to_string()))
            .collect()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Replace a disallowed embedding model with the default.
    ///
    /// Returns the rejected name.
    pub(crate) fn enforce_embedding_allow_list(&mut self) -> Option<String> {
        if is_allowed_embedding_model(&self.embedding_model) {
            return None;
        }
        Some(std::mem::replace(
            &mut self.embedding_model,
            DEFAULT_EMBEDDING_MODEL.to_string(),
        ))
    }

    /// Apply a partial update and report which selections changed.
    pub fn apply(&mut self, update: ConfigUpdate) -> AppliedUpdate {
        let previous: Vec<(ResourceType, String)> = self.selections();

        let requested = [
            (ResourceType::Text, update.text_model),
            (ResourceType::Vision, update.vision_model),
            (ResourceType::Embedding, update.embedding_model),
        ];
        for (ty, name) in requested {
            if let Some(name) = name {
                *self.selected_mut(ty) = name;
            }
        }
        let rejected_embedding_model = self.enforce_embedding_allow_list();

        if let Some(gpu_layers) = update.gpu_layers {
            self.gpu_layers = gpu_layers;
        }
        if let Some(context_size) = update.context_size {
            self.context_size = context_size;
        }
        if update.threads.is_some() {
            self.threads = update.threads;
        }

        let changes = previous
            .into_iter()
            .filter(|(ty, old)| self.selected(*ty) != old)
            .map(|(ty, old)| ModelChangeEvent {
                resource_type: ty,
                previous_model: old,
                new_model: self.selected(ty).to_string(),
            })
            .collect();

        AppliedUpdate {
            changes,
            rejected_embedding_model,
        }
    }
}
