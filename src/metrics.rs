// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the tiered store.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tiered_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size metrics
//!
//! # Labels
//! - `tier`: heap, offheap, disk (or `store` for whole-store events)
//! - `operation`: get, put, remove, demote, clear
//! - `status`: hit, miss, success, error, dropped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store or tier operation outcome.
pub fn record_tier_op(tier: &str, operation: &str, status: &str) {
    counter!(
        "tiered_store_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tiered_store_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record entries evicted out of a tier (demoted or dropped outright).
pub fn record_eviction(tier: &str, count: u64) {
    counter!(
        "tiered_store_evictions_total",
        "tier" => tier.to_string()
    )
    .increment(count);
}

/// Record a promotion into the fastest tier (read-triggered move).
pub fn record_promotion(from_tier: &str) {
    counter!(
        "tiered_store_promotions_total",
        "from" => from_tier.to_string()
    )
    .increment(1);
}

/// Record a demotion into a slower tier (capacity-triggered move).
pub fn record_demotion(to_tier: &str) {
    counter!(
        "tiered_store_demotions_total",
        "to" => to_tier.to_string()
    )
    .increment(1);
}

/// Record bytes written to a tier.
pub fn record_bytes_written(tier: &str, bytes: u64) {
    counter!(
        "tiered_store_bytes_written_total",
        "tier" => tier.to_string()
    )
    .increment(bytes);
}

/// Record bytes read from a tier.
pub fn record_bytes_read(tier: &str, bytes: u64) {
    counter!(
        "tiered_store_bytes_read_total",
        "tier" => tier.to_string()
    )
    .increment(bytes);
}

/// Record a disk segment compaction and the bytes it reclaimed.
pub fn record_compaction(tier: &str, reclaimed_bytes: u64) {
    counter!(
        "tiered_store_compactions_total",
        "tier" => tier.to_string()
    )
    .increment(1);
    counter!(
        "tiered_store_compaction_reclaimed_bytes_total",
        "tier" => tier.to_string()
    )
    .increment(reclaimed_bytes);
}

/// Set current entry count for a tier.
pub fn set_tier_entries(tier: &str, count: usize) {
    gauge!(
        "tiered_store_tier_entries",
        "tier" => tier.to_string()
    )
    .set(count as f64);
}

/// Set current byte usage for a tier.
pub fn set_tier_bytes(tier: &str, bytes: u64) {
    gauge!(
        "tiered_store_tier_bytes",
        "tier" => tier.to_string()
    )
    .set(bytes as f64);
}

/// A timing guard that records latency on drop.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer.
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
