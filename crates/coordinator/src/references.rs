use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sift_catalog::ResourceType;
use tokio::sync::Notify;

/// Count of in-flight operations per resource type.
///
/// A type with a positive count must not be evicted.
#[derive(Debug, Default)]
pub struct ActiveReferences {
    counts: [AtomicUsize; 3],
    idle: Notify,
}

impl ActiveReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.counts[resource_type.index()].load(Ordering::SeqCst)
    }

    pub fn in_use(&self, resource_type: ResourceType) -> bool {
        self.count(resource_type) > 0
    }

    /// Take a reference that is released when the guard drops.
    pub fn acquire(self: &Arc<Self>, resource_type: ResourceType) -> ReferenceGuard {
        self.counts[resource_type.index()].fetch_add(1, Ordering::SeqCst);
        ReferenceGuard {
            references: Arc::clone(self),
            resource_type,
        }
    }

    fn release(&self, resource_type: ResourceType) {
        let previous = self.counts[resource_type.index()].fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no operation holds `resource_type`.
    ///
    /// Returns false if references remain after `timeout`.
    pub async fn wait_for_idle(&self, resource_type: ResourceType, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if !self.in_use(resource_type) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.in_use(resource_type);
            }
        }
    }
}

/// Releases one reference on drop, including when the owning future is
/// cancelled.
#[derive(Debug)]
pub struct ReferenceGuard {
    references: Arc<ActiveReferences>,
    resource_type: ResourceType,
}

impl ReferenceGuard {
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }
}

impl Drop for ReferenceGuard {
    fn drop(&mut self) {
        self.references.release(self.resource_type);
    }
}
