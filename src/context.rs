// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pass routing state.
//!
//! A [`RouterContext`] lives for exactly one channel pass. It carries the
//! pass counters, per-row routing failures, memoized lookup tables, the
//! batches closed so far and the early-termination checks. Nothing in it
//! outlives the pass; durable state goes through the routing store.

use crate::batch::Batch;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rows kept in [`RouterContext::issues`] before only counting.
const MAX_RECORDED_ISSUES: usize = 100;

/// Counters for one channel pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    /// Rows read on this channel (including gap rescans).
    pub rows_read: usize,
    /// Rows placed in at least one batch.
    pub rows_routed: usize,
    /// Row-to-node placements.
    pub placements: usize,
    /// Rows whose policy returned no target.
    pub rows_unrouted: usize,
    /// Rows no node was eligible for (disabled table, loop prevention, load window).
    pub rows_filtered: usize,
    /// Rows dropped for this pass because their policy failed.
    pub policy_errors: usize,
    /// Failed rows queued to be read again next pass.
    pub rows_retried: usize,
    /// Failed rows given up on after the retry budget.
    pub rows_abandoned: usize,
    pub gaps_opened: usize,
    pub gaps_filled: usize,
    pub gaps_expired: usize,
    pub batches_closed: usize,
}

/// A row whose routing failed this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingIssue {
    pub row_id: u64,
    pub policy: String,
    pub message: String,
}

/// Lookup table memoized for one pass: key value -> target external ids.
pub type LookupMap = HashMap<String, Vec<String>>;

/// Mutable state for one channel pass.
pub struct RouterContext {
    channel_id: String,
    started: Instant,
    stop: Arc<AtomicBool>,
    max_rows: usize,
    pub stats: PassStats,
    issues: Vec<RoutingIssue>,
    lookups: HashMap<String, Arc<LookupMap>>,
    ready: Vec<Batch>,
}

impl RouterContext {
    pub fn new(channel_id: &str, stop: Arc<AtomicBool>, max_rows: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            started: Instant::now(),
            stop,
            max_rows,
            stats: PassStats::default(),
            issues: Vec::new(),
            lookups: HashMap::new(),
            ready: Vec::new(),
        }
    }

    /// Standalone context (no stop signal, no row budget).
    pub fn detached(channel_id: &str) -> Self {
        Self::new(channel_id, Arc::new(AtomicBool::new(false)), usize::MAX)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// The router asked running passes to wind down.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The pass has read as many rows as it is allowed to.
    pub fn budget_exhausted(&self) -> bool {
        self.stats.rows_read >= self.max_rows
    }

    /// Either early-termination condition holds.
    pub fn should_yield(&self) -> bool {
        self.stop_requested() || self.budget_exhausted()
    }

    /// Record a transient routing failure for a row.
    pub fn record_issue(&mut self, row_id: u64, policy: &str, message: impl Into<String>) {
        self.stats.policy_errors += 1;
        if self.issues.len() < MAX_RECORDED_ISSUES {
            self.issues.push(RoutingIssue {
                row_id,
                policy: policy.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn issues(&self) -> &[RoutingIssue] {
        &self.issues
    }

    /// A lookup table already loaded this pass.
    pub fn lookup(&self, key: &str) -> Option<Arc<LookupMap>> {
        self.lookups.get(key).cloned()
    }

    pub fn remember_lookup(&mut self, key: &str, map: LookupMap) -> Arc<LookupMap> {
        let map = Arc::new(map);
        self.lookups.insert(key.to_string(), Arc::clone(&map));
        map
    }

    /// Take ownership of batches that just closed.
    pub fn push_ready(&mut self, batches: Vec<Batch>) {
        self.stats.batches_closed += batches.len();
        self.ready.extend(batches);
    }

    pub fn ready(&self) -> &[Batch] {
        &self.ready
    }

    /// Consume the context, returning closed batches, stats and issues.
    pub fn finish(self) -> (Vec<Batch>, PassStats, Vec<RoutingIssue>) {
        (self.ready, self.stats, self.issues)
    }
}
