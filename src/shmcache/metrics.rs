//! Shared Cache Metrics
//!
//! Process-local counters. Every attached process keeps its own; the segment
//! itself only records what it needs for correctness.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    in_progress_hits: AtomicU64,
    owner_elections: AtomicU64,
    reelections: AtomicU64,
    waits: AtomicU64,
    evictions: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
    bypassed: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Found an entry some other owner is still resolving
    pub fn record_in_progress_hit(&self) {
        self.in_progress_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_owner_election(&self) {
        self.owner_elections.fetch_add(1, Ordering::Relaxed);
    }

    /// Took over an abandoned resolution
    pub fn record_reelection(&self) {
        self.reelections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            in_progress_hits: self.in_progress_hits.load(Ordering::Relaxed),
            owner_elections: self.owner_elections.load(Ordering::Relaxed),
            reelections: self.reelections.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub in_progress_hits: u64,
    pub owner_elections: u64,
    pub reelections: u64,
    pub waits: u64,
    pub evictions: u64,
    pub exhausted: u64,
    pub abandoned: u64,
    pub bypassed: u64,
    pub hit_ratio: f64,
}
