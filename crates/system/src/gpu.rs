use std::fmt;

use serde::{Deserialize, Serialize};

/// GPU vendor as reported by the external GPU probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    /// No usable GPU; inference runs on the CPU.
    Cpu,
    Nvidia,
    Amd,
    Apple,
    Intel,
    Other,
}

/// Output of the GPU detection probe. Read-only input to this subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    #[serde(rename = "type")]
    pub vendor: GpuVendor,
    #[serde(default)]
    pub vram_mb: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

impl GpuInfo {
    pub fn cpu_only() -> Self {
        Self {
            vendor: GpuVendor::Cpu,
            vram_mb: None,
            name: None,
        }
    }

    pub fn new(vendor: GpuVendor, vram_mb: u64, name: impl Into<String>) -> Self {
        Self {
            vendor,
            vram_mb: Some(vram_mb),
            name: Some(name.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.vendor != GpuVendor::Cpu
    }

    /// VRAM in bytes, only when a GPU is present and reported its memory.
    pub fn vram_bytes(&self) -> Option<u64> {
        if !self.is_available() {
            return None;
        }
        self.vram_mb
            .filter(|mb| *mb > 0)
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

impl Default for GpuInfo {
    fn default() -> Self {
        Self::cpu_only()
    }
}

/// Compute backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    Gpu,
    Cpu,
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("gpu"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}
