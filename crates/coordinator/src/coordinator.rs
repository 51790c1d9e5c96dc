//! Serializes loads and inferences per resource type.
//!
//! Loads and inferences use independent locks, so a running inference on a
//! type does not block preparing another type, and types never block each
//! other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_catalog::ResourceType;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::ActiveReferences;

/// An operation registered with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub id: String,
    pub resource_type: ResourceType,
    pub started_at: DateTime<Utc>,
    /// False while queued behind another inference of the same type.
    pub running: bool,
}

/// Per-type counters in a status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatus {
    pub resource_type: ResourceType,
    pub active_references: usize,
    pub loading: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub active_operations: Vec<OperationInfo>,
    pub types: Vec<TypeStatus>,
}

/// Access coordinator for resident models.
#[derive(Debug, Default)]
pub struct AccessCoordinator {
    references: Arc<ActiveReferences>,
    load_locks: [Arc<tokio::sync::Mutex<()>>; 3],
    inference_locks: [tokio::sync::Mutex<()>; 3],
    operations: Mutex<HashMap<u64, OperationInfo>>,
    next_operation: AtomicU64,
}

impl AccessCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared reference counts, consulted before eviction.
    pub fn active_references(&self) -> Arc<ActiveReferences> {
        Arc::clone(&self.references)
    }

    /// Exclusive right to load or unload a type. Released on drop.
    pub async fn acquire_load_lock(&self, resource_type: ResourceType) -> OwnedMutexGuard<()> {
        Arc::clone(&self.load_locks[resource_type.index()])
            .lock_owned()
            .await
    }

    /// Run `operation` as the only inference on `resource_type`.
    ///
    /// The type counts as in use from before the wait for the inference lock
    /// until the operation finishes or is dropped.
    pub async fn with_model<F, T>(
        &self,
        resource_type: ResourceType,
        operation_id: Option<String>,
        operation: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let _reference = self.references.acquire(resource_type);
        let id = operation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let registration = self.register(id, resource_type);

        let _inference = self.inference_locks[resource_type.index()].lock().await;
        registration.mark_running();
        tracing::debug!(operation = %registration.id(), resource = %resource_type, "Operation started");

        operation.await
    }

    pub async fn wait_for_idle(&self, resource_type: ResourceType, timeout: Duration) -> bool {
        self.references.wait_for_idle(resource_type, timeout).await
    }

    pub fn status(&self) -> CoordinatorStatus {
        let mut active_operations: Vec<OperationInfo> = self
            .operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        active_operations.sort_by_key(|op| op.started_at);

        let types = ResourceType::ALL
            .into_iter()
            .map(|ty| TypeStatus {
                resource_type: ty,
                active_references: self.references.count(ty),
                loading: self.load_locks[ty.index()].try_lock().is_err(),
            })
            .collect();

        CoordinatorStatus {
            active_operations,
            types,
        }
    }

    fn register(&self, id: String, resource_type: ResourceType) -> Registration<'_> {
        let key = self.next_operation.fetch_add(1, Ordering::Relaxed);
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key,
                OperationInfo {
                    id: id.clone(),
                    resource_type,
                    started_at: Utc::now(),
                    running: false,
                },
            );
        Registration {
            operations: &self.operations,
            key,
            id,
        }
    }
}

/// Removes an operation from the active table on drop.
struct Registration<'a> {
    operations: &'a Mutex<HashMap<u64, OperationInfo>>,
    key: u64,
    id: String,
}

impl Registration<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn mark_running(&self) {
        let mut operations = self.operations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(op) = operations.get_mut(&self.key) {
            op.running = true;
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.operations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
