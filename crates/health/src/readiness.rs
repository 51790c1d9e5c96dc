//! System readiness checks and the cached degradation snapshot.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;
use sift_download::ArtifactFetcher;
use sift_system::{GpuInfo, SystemProbe, GIB};

/// Free disk space below which a warning is raised.
pub const MIN_FREE_DISK_BYTES: u64 = 2 * GIB;

/// Follow-up the UI can offer for a blocking issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    DownloadModels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessIssue {
    pub message: String,
    pub action: IssueAction,
}

/// A selected model (or its companion file) that is not on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingModel {
    pub name: String,
    pub resource_type: ResourceType,
    /// Set when `name` is a companion of the selected model.
    pub companion_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub issues: Vec<ReadinessIssue>,
    pub warnings: Vec<String>,
    pub gpu_info: GpuInfo,
    pub missing_models: Vec<MissingModel>,
}

/// Snapshot for display, rebuilt on every readiness check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationState {
    pub gpu_available: bool,
    pub using_cpu_fallback: bool,
    pub missing_models: Vec<String>,
    pub warnings: Vec<String>,
}

/// Readiness and degradation monitor.
pub struct ReadinessMonitor {
    probe: Arc<dyn SystemProbe>,
    fetcher: Arc<ArtifactFetcher>,
    min_free_disk_bytes: u64,
    state: RwLock<DegradationState>,
}

impl ReadinessMonitor {
    pub fn new(probe: Arc<dyn SystemProbe>, fetcher: Arc<ArtifactFetcher>) -> Self {
        Self {
            probe,
            fetcher,
            min_free_disk_bytes: MIN_FREE_DISK_BYTES,
            state: RwLock::new(DegradationState::default()),
        }
    }

    pub fn with_min_free_disk(mut self, bytes: u64) -> Self {
        self.min_free_disk_bytes = bytes;
        self
    }

    /// Check GPU, disk space and the presence of every selected model.
    pub async fn check_system_readiness(
        &self,
        selected: &[(ResourceType, String)],
    ) -> ReadinessReport {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut missing_models = Vec::new();

        let gpu_info = self.probe.gpu();
        if !gpu_info.is_available() {
            warnings.push("No GPU detected; models will run on the CPU.".to_string());
        }

        for (resource_type, name) in selected {
            if !self.fetcher.is_present(name).await {
                missing_models.push(MissingModel {
                    name: name.clone(),
                    resource_type: *resource_type,
                    companion_of: None,
                });
                continue;
            }

            let companion = self
                .fetcher
                .catalog()
                .get(name)
                .and_then(|entry| entry.companion.as_ref())
                .map(|c| c.filename.clone());
            if let Some(companion) = companion {
                if !self.fetcher.is_present(&companion).await {
                    missing_models.push(MissingModel {
                        name: companion,
                        resource_type: *resource_type,
                        companion_of: Some(name.clone()),
                    });
                }
            }
        }

        for missing in &missing_models {
            let message = match &missing.companion_of {
                Some(owner) => format!(
                    "Companion file {} for {} model {} is missing",
                    missing.name, missing.resource_type, owner
                ),
                None => format!(
                    "Selected {} model {} is not downloaded",
                    missing.resource_type, missing.name
                ),
            };
            issues.push(ReadinessIssue {
                message,
                action: IssueAction::DownloadModels,
            });
        }

        match self.probe.available_disk_bytes(self.fetcher.models_dir()) {
            Some(available) if available < self.min_free_disk_bytes => {
                warnings.push(format!(
                    "Low disk space: {:.1} GB free",
                    available as f64 / GIB as f64
                ));
            }
            Some(_) => {}
            None => tracing::debug!("Free disk space unknown"),
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            *state = DegradationState {
                gpu_available: gpu_info.is_available(),
                using_cpu_fallback: state.using_cpu_fallback,
                missing_models: missing_models.iter().map(|m| m.name.clone()).collect(),
                warnings: warnings.clone(),
            };
        }

        let ready = issues.is_empty();
        tracing::info!(
            ready,
            issues = issues.len(),
            warnings = warnings.len(),
            "System readiness checked"
        );

        ReadinessReport {
            ready,
            issues,
            warnings,
            gpu_info,
            missing_models,
        }
    }

    pub fn degradation_state(&self) -> DegradationState {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record whether inference runs on the CPU backend after GPU failure.
    pub fn set_cpu_fallback(&self, using_cpu_fallback: bool) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .using_cpu_fallback = using_cpu_fallback;
    }
}
