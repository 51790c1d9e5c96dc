//! Access coordination for resident models.

mod coordinator;
mod references;

pub use coordinator::{AccessCoordinator, CoordinatorStatus, OperationInfo, TypeStatus};
pub use references::{ActiveReferences, ReferenceGuard};
