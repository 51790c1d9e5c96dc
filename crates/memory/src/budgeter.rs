//! Memory budgeter.
//!
//! Keeps at most one resident model per resource type, computes the budget
//! from live probe values before every load, and evicts least recently used
//! models that no operation is holding.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use sift_catalog::ResourceType;
use sift_system::SystemProbe;

use crate::{compute_budget, MemoryBudget, ResidentInfo};

/// Loads and releases the native resources behind each resource type.
#[async_trait]
pub trait ResidentLoader: Send + Sync {
    /// Handle stored for a resident model.
    type Context: Clone + Send + Sync + 'static;
    type Error: Display + Send + 'static;

    async fn load(&self, resource_type: ResourceType) -> Result<Self::Context, Self::Error>;

    async fn unload(
        &self,
        resource_type: ResourceType,
        context: Self::Context,
    ) -> Result<(), Self::Error>;

    /// Expected resident size of the currently selected model for a type.
    fn estimated_size(&self, resource_type: ResourceType) -> u64;
}

/// Answers whether a resource type has in-flight operations.
pub trait InUse: Send + Sync {
    fn in_use(&self, resource_type: ResourceType) -> bool;
}

impl<F> InUse for F
where
    F: Fn(ResourceType) -> bool + Send + Sync,
{
    fn in_use(&self, resource_type: ResourceType) -> bool {
        self(resource_type)
    }
}

#[derive(Debug)]
struct ResidentEntry<C> {
    context: C,
    last_used_at: Instant,
    estimated_size_bytes: u64,
}

#[derive(Debug)]
struct Resident<C> {
    entries: HashMap<ResourceType, ResidentEntry<C>>,
    usage_bytes: u64,
}

/// Budget-aware owner of resident model contexts.
pub struct MemoryBudgeter<L: ResidentLoader> {
    loader: L,
    probe: Arc<dyn SystemProbe>,
    in_use: Arc<dyn InUse>,
    resident: Mutex<Resident<L::Context>>,
    /// Per-type load gate; held while a type loads or unloads.
    gates: [tokio::sync::Mutex<()>; 3],
}

impl<L: ResidentLoader> MemoryBudgeter<L> {
    pub fn new(loader: L, probe: Arc<dyn SystemProbe>, in_use: Arc<dyn InUse>) -> Self {
        Self {
            loader,
            probe,
            in_use,
            resident: Mutex::new(Resident {
                entries: HashMap::new(),
                usage_bytes: 0,
            }),
            gates: Default::default(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn lock(&self) -> MutexGuard<'_, Resident<L::Context>> {
        self.resident.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current budget from live probe values.
    pub fn max_usable_bytes(&self) -> u64 {
        compute_budget(self.probe.free_memory_bytes(), self.probe.gpu().vram_bytes())
    }

    pub fn current_usage_bytes(&self) -> u64 {
        self.lock().usage_bytes
    }

    pub fn is_resident(&self, resource_type: ResourceType) -> bool {
        self.lock().entries.contains_key(&resource_type)
    }

    /// Resident context for a type, if any. Refreshes its LRU timestamp.
    ///
    /// Never waits on a load in progress.
    pub fn get_loaded_context(&self, resource_type: ResourceType) -> Option<L::Context> {
        let mut resident = self.lock();
        let entry = resident.entries.get_mut(&resource_type)?;
        entry.last_used_at = Instant::now();
        Some(entry.context.clone())
    }

    /// Return the resident context for a type, loading it if needed.
    ///
    /// Concurrent callers for the same type share a single load. When the
    /// budget cannot be met by evicting idle models the load proceeds anyway.
    pub async fn ensure_resident(&self, resource_type: ResourceType) -> Result<L::Context, L::Error> {
        if let Some(context) = self.get_loaded_context(resource_type) {
            return Ok(context);
        }

        let _gate = self.gates[resource_type.index()].lock().await;
        if let Some(context) = self.get_loaded_context(resource_type) {
            return Ok(context);
        }

        let estimate = self.loader.estimated_size(resource_type);
        self.make_room(resource_type, estimate).await;

        tracing::info!(resource = %resource_type, estimate, "Loading model");
        let started = Instant::now();
        let context = match self.loader.load(resource_type).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(resource = %resource_type, error = %e, "Model load failed");
                return Err(e);
            }
        };

        let usage = {
            let mut resident = self.lock();
            resident.entries.insert(
                resource_type,
                ResidentEntry {
                    context: context.clone(),
                    last_used_at: Instant::now(),
                    estimated_size_bytes: estimate,
                },
            );
            resident.usage_bytes = resident.usage_bytes.saturating_add(estimate);
            resident.usage_bytes
        };
        tracing::info!(
            resource = %resource_type,
            usage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model resident"
        );

        Ok(context)
    }

    /// Evict idle models in LRU order until `needed` bytes fit.
    async fn make_room(&self, requested: ResourceType, needed: u64) {
        let budget = self.max_usable_bytes();
        let mut skipped = HashSet::new();

        loop {
            let (usage, victim) = {
                let resident = self.lock();
                let victim = resident
                    .entries
                    .iter()
                    .filter(|(ty, _)| **ty != requested && !skipped.contains(*ty))
                    .min_by_key(|(_, entry)| entry.last_used_at)
                    .map(|(ty, _)| *ty);
                (resident.usage_bytes, victim)
            };

            if usage.saturating_add(needed) <= budget {
                return;
            }

            let Some(victim) = victim else {
                tracing::warn!(
                    resource = %requested,
                    needed,
                    usage,
                    budget,
                    "Over memory budget with nothing evictable, loading anyway"
                );
                return;
            };
            skipped.insert(victim);

            if self.in_use.in_use(victim) {
                tracing::debug!(victim = %victim, "Skipping eviction of model in use");
                continue;
            }

            // A gate held elsewhere means the victim is mid load or unload.
            let Ok(_victim_gate) = self.gates[victim.index()].try_lock() else {
                tracing::debug!(victim = %victim, "Skipping eviction of model being loaded");
                continue;
            };

            self.evict(victim).await;
        }
    }

    /// Remove the entry first, then re-check references so an operation that
    /// raced the selection keeps its model.
    async fn evict(&self, victim: ResourceType) {
        let removed = self.lock().entries.remove(&victim);
        let Some(entry) = removed else {
            return;
        };

        if self.in_use.in_use(victim) {
            tracing::debug!(victim = %victim, "Model acquired during eviction, keeping it");
            self.lock().entries.insert(victim, entry);
            return;
        }

        tracing::info!(victim = %victim, size = entry.estimated_size_bytes, "Evicting model");
        let _ = self.release(victim, entry).await;
    }

    async fn release(
        &self,
        resource_type: ResourceType,
        entry: ResidentEntry<L::Context>,
    ) -> Result<(), L::Error> {
        let result = self.loader.unload(resource_type, entry.context).await;
        let mut resident = self.lock();
        resident.usage_bytes = resident
            .usage_bytes
            .saturating_sub(entry.estimated_size_bytes);
        if let Err(e) = &result {
            tracing::warn!(resource = %resource_type, error = %e, "Unload reported an error");
        }
        result
    }

    /// Unload a resident type. Returns false when nothing was resident.
    ///
    /// Usage is released even when the loader reports an error.
    pub async fn unload(&self, resource_type: ResourceType) -> Result<bool, L::Error> {
        let _gate = self.gates[resource_type.index()].lock().await;
        let removed = self.lock().entries.remove(&resource_type);
        let Some(entry) = removed else {
            return Ok(false);
        };
        tracing::info!(resource = %resource_type, "Unloading model");
        self.release(resource_type, entry).await?;
        Ok(true)
    }

    /// Unload every resident type. Errors are logged and skipped.
    pub async fn unload_all(&self) {
        for resource_type in ResourceType::ALL {
            let _ = self.unload(resource_type).await;
        }
    }

    pub fn snapshot(&self) -> MemoryBudget {
        let max_usable_bytes = self.max_usable_bytes();
        let resident = self.lock();
        let mut entries: Vec<ResidentInfo> = resident
            .entries
            .iter()
            .map(|(ty, entry)| ResidentInfo {
                resource_type: *ty,
                estimated_size_bytes: entry.estimated_size_bytes,
                idle_ms: entry.last_used_at.elapsed().as_millis() as u64,
            })
            .collect();
        entries.sort_by_key(|info| info.resource_type);

        MemoryBudget {
            max_usable_bytes,
            current_usage_bytes: resident.usage_bytes,
            resident: entries,
        }
    }
}
