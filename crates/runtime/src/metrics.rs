//! Lock-free runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    loads: AtomicU64,
    load_failures: AtomicU64,
    unloads: AtomicU64,
    inferences: AtomicU64,
    inference_failures: AtomicU64,
    retries: AtomicU64,
    aborted: AtomicU64,
    inference_ms: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference(&self, elapsed: Duration) {
        self.inferences.fetch_add(1, Ordering::Relaxed);
        self.inference_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inferences = self.inferences.load(Ordering::Relaxed);
        let inference_ms = self.inference_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            unloads: self.unloads.load(Ordering::Relaxed),
            inferences,
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            inference_ms,
            avg_inference_ms: if inferences == 0 {
                0
            } else {
                inference_ms / inferences
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub loads: u64,
    pub load_failures: u64,
    pub unloads: u64,
    pub inferences: u64,
    pub inference_failures: u64,
    pub retries: u64,
    pub aborted: u64,
    pub inference_ms: u64,
    pub avg_inference_ms: u64,
}
