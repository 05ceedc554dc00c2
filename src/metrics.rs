// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Rows read, routed and dropped per channel
//! - Routing policy failures
//! - Gap lifecycle (opened, filled, expired, open count, oldest age)
//! - Batch closes and acknowledgments
//! - Pass outcomes and unrouted backlog
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `routing_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use change_router::metrics;
//! use std::time::Duration;
//!
//! metrics::record_rows_read("sales", 42);
//! metrics::record_pass("sales", "completed", Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Scan and Routing Metrics
// =============================================================================

/// Record change rows read for a channel (own channel only).
pub fn record_rows_read(channel_id: &str, count: usize) {
    counter!("routing_rows_read_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record row placements into batches (one row to N nodes counts N).
pub fn record_rows_routed(channel_id: &str, placements: usize) {
    counter!("routing_rows_routed_total", "channel_id" => channel_id.to_string())
        .increment(placements as u64);
}

/// Record rows that reached no node, by reason.
pub fn record_rows_dropped(channel_id: &str, reason: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "routing_rows_dropped_total",
        "channel_id" => channel_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Record a routing policy failure (transient).
pub fn record_policy_error(policy: &str, kind: &str) {
    counter!(
        "routing_policy_errors_total",
        "policy" => policy.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record policy evaluation latency.
pub fn record_policy_latency(policy: &str, duration: Duration) {
    histogram!("routing_policy_duration_seconds", "policy" => policy.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Gap Metrics
// =============================================================================

pub fn record_gap_opened(channel_id: &str) {
    counter!("routing_gaps_opened_total", "channel_id" => channel_id.to_string()).increment(1);
}

pub fn record_gap_filled(channel_id: &str) {
    counter!("routing_gaps_filled_total", "channel_id" => channel_id.to_string()).increment(1);
}

/// Record a gap closed as a permanent hole.
pub fn record_gap_expired(channel_id: &str, missing_ids: u64) {
    counter!("routing_gaps_expired_total", "channel_id" => channel_id.to_string()).increment(1);
    counter!("routing_gap_ids_expired_total", "channel_id" => channel_id.to_string())
        .increment(missing_ids);
}

/// Set the gauge of rows queued for another routing attempt.
pub fn set_retry_rows(channel_id: &str, rows: usize) {
    gauge!("routing_retry_rows", "channel_id" => channel_id.to_string()).set(rows as f64);
}

/// Set open gap gauges for a channel.
pub fn set_open_gaps(channel_id: &str, open: usize, oldest_age: Option<Duration>) {
    gauge!("routing_open_gaps", "channel_id" => channel_id.to_string()).set(open as f64);
    gauge!("routing_oldest_gap_age_seconds", "channel_id" => channel_id.to_string())
        .set(oldest_age.map(|a| a.as_secs_f64()).unwrap_or(0.0));
}

// =============================================================================
// Batch Metrics
// =============================================================================

/// Record a batch closing, with its size.
pub fn record_batch_closed(channel_id: &str, reason: &str, rows: usize) {
    counter!(
        "routing_batches_closed_total",
        "channel_id" => channel_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    histogram!("routing_batch_size", "channel_id" => channel_id.to_string()).record(rows as f64);
}

/// Record batches handed to the sink.
pub fn record_batches_published(count: usize, republished: bool) {
    let kind = if republished { "retry" } else { "first" };
    counter!("routing_batches_published_total", "kind" => kind).increment(count as u64);
}

/// Record a sink refusal.
pub fn record_sink_error() {
    counter!("routing_sink_errors_total").increment(1);
}

/// Record an acknowledgment by outcome.
pub fn record_ack(outcome: &str) {
    counter!("routing_acks_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record batches marked ERROR because no acknowledgment arrived in time.
pub fn record_ack_timeouts(count: usize) {
    if count > 0 {
        counter!("routing_ack_timeouts_total").increment(count as u64);
    }
}

// =============================================================================
// Pass Metrics
// =============================================================================

/// Record a channel pass outcome and duration.
pub fn record_pass(channel_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "routing_passes_total",
        "channel_id" => channel_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("routing_pass_duration_seconds", "channel_id" => channel_id.to_string())
        .record(duration.as_secs_f64());
}

/// Set the unrouted backlog for a channel.
pub fn set_unrouted_backlog(channel_id: &str, count: u64) {
    gauge!("routing_unrouted_rows", "channel_id" => channel_id.to_string()).set(count as f64);
}

/// Record routing store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("routing_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for router state.
pub fn set_router_state(state: &str) {
    // Encoded numerically for alerting.
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Stopping" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("routing_router_state").set(value);
}
