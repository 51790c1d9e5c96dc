//! Readiness checks and degradation handling for the model runtime.

mod readiness;
mod recovery;

pub use readiness::{
    DegradationState, IssueAction, MissingModel, ReadinessIssue, ReadinessMonitor,
    ReadinessReport, MIN_FREE_DISK_BYTES,
};
pub use recovery::{
    classify_error, handle_error, ErrorContext, ErrorResolution, RecoveryAction,
    CORRUPT_MODEL_PATTERNS, DISK_FULL_PATTERNS, OOM_PATTERNS, OOM_WORDS,
};
