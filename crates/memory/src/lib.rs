//! Memory budgeting for resident models.

mod budget;
mod budgeter;

pub use budget::{
    compute_budget, MemoryBudget, ResidentInfo, RAM_CAP_BYTES, RAM_PERCENT, VRAM_PERCENT,
};
pub use budgeter::{InUse, MemoryBudgeter, ResidentLoader};
