use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;
use sift_system::GIB;

/// Percentage of free system RAM a model set may occupy.
pub const RAM_PERCENT: u64 = 70;

/// Absolute ceiling for the RAM-derived budget.
pub const RAM_CAP_BYTES: u64 = 16 * GIB;

/// Percentage of dedicated VRAM a model set may occupy.
pub const VRAM_PERCENT: u64 = 80;

/// Maximum bytes resident models may use.
///
/// `min(0.7 × free_ram, 16 GiB)`, or `0.8 × vram` when that is larger.
pub fn compute_budget(free_ram_bytes: u64, vram_bytes: Option<u64>) -> u64 {
    let ram_budget = percent_of(free_ram_bytes, RAM_PERCENT).min(RAM_CAP_BYTES);
    match vram_bytes {
        Some(vram) => ram_budget.max(percent_of(vram, VRAM_PERCENT)),
        None => ram_budget,
    }
}

fn percent_of(bytes: u64, percent: u64) -> u64 {
    (bytes as u128 * percent as u128 / 100) as u64
}

/// One resident model as seen from outside the budgeter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentInfo {
    pub resource_type: ResourceType,
    pub estimated_size_bytes: u64,
    /// Milliseconds since the model was last handed out.
    pub idle_ms: u64,
}

/// Budget snapshot, recomputed from live probe values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBudget {
    pub max_usable_bytes: u64,
    pub current_usage_bytes: u64,
    pub resident: Vec<ResidentInfo>,
}

impl MemoryBudget {
    pub fn available_bytes(&self) -> u64 {
        self.max_usable_bytes
            .saturating_sub(self.current_usage_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_system::MIB;

    #[test]
    fn test_ram_budget_is_seventy_percent() {
        assert_eq!(compute_budget(10 * GIB, None), 7 * GIB);
    }

    #[test]
    fn test_ram_budget_is_capped() {
        assert_eq!(compute_budget(64 * GIB, None), 16 * GIB);
    }

    #[test]
    fn test_vram_wins_when_larger() {
        // 0.8 × 6400 MiB = 5 GiB, above 0.7 × 1 GiB.
        assert_eq!(compute_budget(GIB, Some(6400 * MIB)), 5 * GIB);
    }

    #[test]
    fn test_ram_wins_when_vram_is_small() {
        assert_eq!(compute_budget(10 * GIB, Some(GIB)), 7 * GIB);
    }

    #[test]
    fn test_available_bytes_saturates() {
        let budget = MemoryBudget {
            max_usable_bytes: 10,
            current_usage_bytes: 25,
            resident: vec![],
        };
        assert_eq!(budget.available_bytes(), 0);
    }
}
