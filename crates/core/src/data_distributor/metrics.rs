//! Per-device distributor metrics.
//!
//! Tracks step outcomes, key traffic and shape cache hit rates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one device's distribution steps.
///
/// Thread-safe so a driver can read them while the device thread runs.
pub struct DistributorMetrics {
    /// Steps that completed on every device
    steps: AtomicU64,
    /// Steps that returned an error
    aborted_steps: AtomicU64,
    /// Model-parallel keys sent to peers (self included)
    keys_sent: AtomicU64,
    /// Model-parallel keys received from peers (self included)
    keys_received: AtomicU64,
    /// Data-parallel keys kept local
    dp_keys: AtomicU64,
    /// Steps that reused the cached bucket structure
    cache_hits: AtomicU64,
    /// Steps that recomputed the bucket structure
    cache_misses: AtomicU64,
}

impl Default for DistributorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributorMetrics {
    pub fn new() -> Self {
        Self {
            steps: AtomicU64::new(0),
            aborted_steps: AtomicU64::new(0),
            keys_sent: AtomicU64::new(0),
            keys_received: AtomicU64::new(0),
            dp_keys: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Record a committed step and the keys it moved.
    pub fn record_step(&self, sent: usize, received: usize, dp_keys: usize) {
        self.steps.fetch_add(1, Ordering::Relaxed);
        self.keys_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.keys_received
            .fetch_add(received as u64, Ordering::Relaxed);
        self.dp_keys.fetch_add(dp_keys as u64, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborted_steps.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a shape cache lookup.
    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    pub fn aborted_steps(&self) -> u64 {
        self.aborted_steps.load(Ordering::Relaxed)
    }

    pub fn keys_sent(&self) -> u64 {
        self.keys_sent.load(Ordering::Relaxed)
    }

    pub fn keys_received(&self) -> u64 {
        self.keys_received.load(Ordering::Relaxed)
    }

    pub fn dp_keys(&self) -> u64 {
        self.dp_keys.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Shape cache hit rate (0.0 to 1.0).
    ///
    /// Returns `None` before the first step.
    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.steps.store(0, Ordering::Relaxed);
        self.aborted_steps.store(0, Ordering::Relaxed);
        self.keys_sent.store(0, Ordering::Relaxed);
        self.keys_received.store(0, Ordering::Relaxed);
        self.dp_keys.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            steps: self.steps(),
            aborted_steps: self.aborted_steps(),
            keys_sent: self.keys_sent(),
            keys_received: self.keys_received(),
            dp_keys: self.dp_keys(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            hit_rate: self.hit_rate(),
        }
    }
}

impl std::fmt::Debug for DistributorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub steps: u64,
    pub aborted_steps: u64,
    pub keys_sent: u64,
    pub keys_received: u64,
    pub dp_keys: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: Option<f64>,
}
