// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router state types.
//!
//! # Service Lifecycle
//!
//! ```text
//!            start()                 stop()
//! Created ───────────▶ Running ───────────────▶ Stopping ──────▶ Stopped
//!    │                                                             ▲
//!    └──────────────────────── stop() ─────────────────────────────┘
//! ```
//!
//! Passes can be forced with `route_data` in `Created` and `Running`; the
//! background loop only runs in `Running`.
//!
//! # Channel Pass Lifecycle
//!
//! ```text
//! Idle ──▶ Running ──▶ Completed
//!                 ├──▶ Failed     (systemic error, nothing committed)
//!                 └──▶ Stopped    (stop requested, committed at a row boundary)
//! ```

use crate::context::{PassStats, RoutingIssue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// State of the router service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouterState {
    /// Constructed; passes may be forced but nothing runs in the background.
    Created,
    /// Background pass loop and acknowledgment task running.
    Running,
    /// `stop()` called. Running passes finish their current row.
    Stopping,
    /// Open batches flushed and the store closed.
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterState::Created => write!(f, "Created"),
            RouterState::Running => write!(f, "Running"),
            RouterState::Stopping => write!(f, "Stopping"),
            RouterState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// State of one channel's routing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl PassState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassState::Idle => "idle",
            PassState::Running => "running",
            PassState::Completed => "completed",
            PassState::Failed => "failed",
            PassState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one channel pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub channel_id: String,
    /// `Completed`, `Failed` or `Stopped`.
    pub state: PassState,
    pub stats: PassStats,
    /// Rows whose policy failed (first few only; see `stats.policy_errors`).
    pub issues: Vec<RoutingIssue>,
    /// READY batches handed to the sink after the commit.
    pub batches_published: usize,
    pub duration: Duration,
    /// Error that failed the pass.
    pub error: Option<String>,
}

impl PassOutcome {
    pub fn rows_routed(&self) -> usize {
        self.stats.rows_routed
    }
}

/// Per-channel health.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub channel_id: String,
    pub routable: bool,
    pub pass_state: PassState,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: usize,
    /// Open and overdue capture gaps after the last committed pass.
    pub open_gaps: usize,
    /// Rows queued for another attempt after their routing failed.
    pub retry_rows: usize,
    pub oldest_gap_age: Option<Duration>,
    /// Backlog measured by the last `unrouted_data_count` call.
    pub unrouted: Option<u64>,
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached per-channel state plus one batch count query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: RouterState,
    /// Running, and no channel's last pass failed.
    pub healthy: bool,
    pub channels: Vec<ChannelHealth>,
    /// Channel passes holding a concurrency permit right now.
    pub passes_in_flight: usize,
    /// Batch counts keyed by status name.
    pub batches: BTreeMap<String, u64>,
}
