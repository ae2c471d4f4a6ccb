// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for record-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `record_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: list, get, create, update, delete
//! - `status`: success, or a [`RemoteError`](crate::RemoteError) kind
//! - `target`: sync target name

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE - Request pipeline
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished remote request (after retries)
pub fn record_request(operation: &str, status: &str) {
    counter!(
        "record_sync_requests_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record remote request latency, retries and pacing included
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "record_sync_request_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a request that hit the overall timeout
pub fn record_timeout(operation: &str) {
    counter!(
        "record_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record one retry of a transient failure
pub fn record_retry(operation: &str) {
    counter!(
        "record_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record time spent waiting for the request rate limiter
pub fn record_rate_limit_wait(waited: Duration) {
    histogram!("record_sync_rate_limit_wait_seconds").record(waited.as_secs_f64());
}

/// Record pages drained by one list call
pub fn record_list_pages(pages: usize) {
    histogram!("record_sync_list_pages").record(pages as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Query result cache
// ═══════════════════════════════════════════════════════════════════════════

/// Record a fetch outcome: hit, success, error, discarded
pub fn record_fetch(outcome: &str) {
    counter!(
        "record_sync_fetches_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set number of live cache entries
pub fn set_cache_entries(count: usize) {
    gauge!("record_sync_cache_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// MUTATIONS - Optimistic writes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a mutation outcome: committed, rolled_back
pub fn record_mutation(kind: &str, outcome: &str) {
    counter!(
        "record_sync_mutations_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set number of mutations awaiting the server
pub fn set_pending_mutations(count: usize) {
    gauge!("record_sync_pending_mutations").set(count as f64);
}

/// Record a rollback that could not restore the cache
pub fn record_rollback_failure() {
    counter!("record_sync_rollback_failures_total").increment(1);
}

/// Record a mutation that gave up waiting behind another on the same id
pub fn record_queue_timeout() {
    counter!("record_sync_queue_timeouts_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC - Periodic refresh
// ═══════════════════════════════════════════════════════════════════════════

/// Record a refresh run of a sync target: success, failure, skipped
pub fn record_sync_run(target: &str, outcome: &str) {
    counter!(
        "record_sync_target_runs_total",
        "target" => target.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set number of registered sync targets
pub fn set_sync_targets(count: usize) {
    gauge!("record_sync_targets").set(count as f64);
}

/// Record circuit breaker state (0 = active, 1 = cooling)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "record_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "record_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A timing guard that records a histogram sample on drop
pub struct LatencyTimer {
    name: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start timing the named phase
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "record_sync_phase_seconds",
            "phase" => self.name
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
