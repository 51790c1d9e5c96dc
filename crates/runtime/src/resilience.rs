//! Native errors that are worth one reload and retry.

use sift_health::{classify_error, RecoveryAction};

/// Phrases the native library uses when a context ran out of sequences.
pub const SEQUENCE_EXHAUSTED_PATTERNS: &[&str] = &[
    "no sequences left",
    "sequence exhausted",
    "sequences exhausted",
    "no free sequence",
    "kv cache is full",
];

pub fn is_sequence_exhausted(message: &str) -> bool {
    let lower = message.to_lowercase();
    SEQUENCE_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p))
}

pub fn is_oom(message: &str) -> bool {
    classify_error(message, None) == RecoveryAction::RetryWithCpu
}

/// True when a fresh context may fix the failure.
pub fn is_recoverable(message: &str) -> bool {
    is_sequence_exhausted(message) || is_oom(message)
}
