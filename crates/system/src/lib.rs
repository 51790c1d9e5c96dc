//! Host facts (free memory, disk space, GPU) consumed by the model runtime.

mod gpu;
mod probe;

pub use gpu::{ComputeBackend, GpuInfo, GpuVendor};
pub use probe::{FixedProbe, HostProbe, SystemProbe};

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;
