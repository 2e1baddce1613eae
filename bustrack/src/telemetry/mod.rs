//! Engine counters.
//!
//! Plain atomics bumped on the hot paths and read as a coherent-enough
//! snapshot on demand. No external metrics pipeline; callers export the
//! snapshot however they like.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters bumped by the engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    updates_accepted: AtomicU64,
    updates_rejected: AtomicU64,
    anomalies_flagged: AtomicU64,
    trips_started: AtomicU64,
    trips_completed: AtomicU64,
    trips_expired: AtomicU64,
    viz_cache_hits: AtomicU64,
    viz_cache_misses: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_accepted(&self) {
        self.updates_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_rejected(&self) {
        self.updates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn anomalies_flagged(&self, count: u64) {
        if count > 0 {
            self.anomalies_flagged.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn trip_started(&self) {
        self.trips_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trip_completed(&self) {
        self.trips_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trips_expired(&self, count: u64) {
        if count > 0 {
            self.trips_expired.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn viz_cache_hit(&self) {
        self.viz_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn viz_cache_miss(&self) {
        self.viz_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            anomalies_flagged: self.anomalies_flagged.load(Ordering::Relaxed),
            trips_started: self.trips_started.load(Ordering::Relaxed),
            trips_completed: self.trips_completed.load(Ordering::Relaxed),
            trips_expired: self.trips_expired.load(Ordering::Relaxed),
            viz_cache_hits: self.viz_cache_hits.load(Ordering::Relaxed),
            viz_cache_misses: self.viz_cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub anomalies_flagged: u64,
    pub trips_started: u64,
    pub trips_completed: u64,
    pub trips_expired: u64,
    pub viz_cache_hits: u64,
    pub viz_cache_misses: u64,
}
