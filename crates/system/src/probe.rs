//! Live system facts behind a trait so budgeting can be tested without a host.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sysinfo::{Disks, System};

use crate::GpuInfo;

/// Source of memory, disk and GPU facts.
///
/// Implementations must read live values on every call; callers rely on this
/// to avoid stale budgets.
pub trait SystemProbe: Send + Sync {
    /// Memory currently available to new allocations, in bytes.
    fn free_memory_bytes(&self) -> u64;

    fn total_memory_bytes(&self) -> u64;

    /// Free space on the volume holding `path`. `None` when unknown.
    fn available_disk_bytes(&self, path: &Path) -> Option<u64>;

    fn gpu(&self) -> GpuInfo;
}

/// Probe backed by `sysinfo`.
///
/// GPU detection is external; its result is handed in with [`HostProbe::with_gpu`].
#[derive(Debug, Default)]
pub struct HostProbe {
    gpu: RwLock<GpuInfo>,
}

impl HostProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpu(gpu: GpuInfo) -> Self {
        Self {
            gpu: RwLock::new(gpu),
        }
    }

    /// Replace the GPU facts, e.g. after the external probe re-ran.
    pub fn set_gpu(&self, gpu: GpuInfo) {
        let mut lock = self.gpu.write().unwrap_or_else(|e| e.into_inner());
        *lock = gpu;
    }
}

impl SystemProbe for HostProbe {
    fn free_memory_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory()
    }

    fn total_memory_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory()
    }

    fn available_disk_bytes(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path);
        let disks = Disks::new_with_refreshed_list();

        // The volume is the disk with the longest mount point prefixing the path.
        let disk = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;

        tracing::trace!(
            path = ?target,
            mount = ?disk.mount_point(),
            available = disk.available_space(),
            "Resolved disk for path"
        );
        Some(disk.available_space())
    }

    fn gpu(&self) -> GpuInfo {
        self.gpu.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Closest existing ancestor of `path`, canonicalized when possible.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
        }
        current = p.parent();
    }
    path.to_path_buf()
}

/// Probe with caller-controlled values.
///
/// Used by tests and by headless tools that want deterministic budgets.
#[derive(Debug)]
pub struct FixedProbe {
    free_memory: AtomicU64,
    total_memory: AtomicU64,
    /// `u64::MAX` means unknown.
    disk: AtomicU64,
    gpu: RwLock<GpuInfo>,
}

impl FixedProbe {
    pub fn new(free_memory_bytes: u64) -> Self {
        Self {
            free_memory: AtomicU64::new(free_memory_bytes),
            total_memory: AtomicU64::new(free_memory_bytes),
            disk: AtomicU64::new(u64::MAX),
            gpu: RwLock::new(GpuInfo::cpu_only()),
        }
    }

    pub fn with_gpu(self, gpu: GpuInfo) -> Self {
        self.set_gpu(gpu);
        self
    }

    pub fn with_disk(self, available_bytes: u64) -> Self {
        self.set_disk(Some(available_bytes));
        self
    }

    pub fn set_free_memory(&self, bytes: u64) {
        self.free_memory.store(bytes, Ordering::SeqCst);
    }

    pub fn set_total_memory(&self, bytes: u64) {
        self.total_memory.store(bytes, Ordering::SeqCst);
    }

    pub fn set_disk(&self, available_bytes: Option<u64>) {
        self.disk
            .store(available_bytes.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn set_gpu(&self, gpu: GpuInfo) {
        let mut lock = self.gpu.write().unwrap_or_else(|e| e.into_inner());
        *lock = gpu;
    }
}

impl SystemProbe for FixedProbe {
    fn free_memory_bytes(&self) -> u64 {
        self.free_memory.load(Ordering::SeqCst)
    }

    fn total_memory_bytes(&self) -> u64 {
        self.total_memory.load(Ordering::SeqCst)
    }

    fn available_disk_bytes(&self, _path: &Path) -> Option<u64> {
        match self.disk.load(Ordering::SeqCst) {
            u64::MAX => None,
            bytes => Some(bytes),
        }
    }

    fn gpu(&self) -> GpuInfo {
        self.gpu.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
