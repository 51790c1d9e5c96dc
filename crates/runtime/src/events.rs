//! Model selection change notifications.
//!
//! Subscribers are plain callbacks. Each call is isolated so one panicking
//! subscriber cannot starve the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;

/// A selected model that changed for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelChangeEvent {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub previous_model: String,
    pub new_model: String,
}

/// Shared callback invoked for every published change.
pub type ModelChangeCallback = Arc<dyn Fn(&ModelChangeEvent) + Send + Sync>;

type Subscribers = Mutex<HashMap<u64, ModelChangeCallback>>;

/// Publisher for [`ModelChangeEvent`]s.
#[derive(Default)]
pub struct ModelEvents {
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
}

impl ModelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It stays registered until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModelChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver an event to every subscriber.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panic is logged and the remaining subscribers still run.
    pub fn publish(&self, event: &ModelChangeEvent) {
        let callbacks: Vec<(u64, ModelChangeCallback)> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        tracing::debug!(
            resource = %event.resource_type,
            previous = %event.previous_model,
            current = %event.new_model,
            subscribers = callbacks.len(),
            "Publishing model change"
        );

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(subscriber = id, "Model change subscriber panicked");
            }
        }
    }
}

/// Handle returned by [`ModelEvents::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    /// Stop receiving events. Returns false if the publisher is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let removed = subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        removed.is_some()
    }
}
