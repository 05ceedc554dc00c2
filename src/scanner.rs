// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change scanner.
//!
//! Reads the change log for one channel in two phases:
//!
//! 1. **Rescan**: every OPEN/OVERDUE gap range known at scan start is read
//!    again. Rows that materialized since are handed out (late, below rows
//!    already routed).
//! 2. **Forward**: from `floor + 1` up to the log watermark captured at scan
//!    start, so a scan is finite even while capture keeps writing.
//!
//! Ids are one shared sequence, so every row in range is observed by the
//! channel's [`GapTracker`]; only the channel's own rows are returned.
//! A row is observed when it is handed out, never when it is merely
//! buffered, so stopping early leaves the tracker at a row boundary and a
//! fresh scan from persisted state reproduces the same sequence.

use crate::config::{ChannelConfig, NodeConfig};
use crate::context::RouterContext;
use crate::error::Result;
use crate::gap::{GapKind, GapTracker, Observation, Requeue};
use crate::metrics;
use crate::model::ChangeRow;
use crate::policy::ResolvedPolicy;
use crate::source::ChangeLogSource;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Reads change rows for channel passes.
#[derive(Clone)]
pub struct ChangeScanner {
    source: Arc<dyn ChangeLogSource>,
    page_size: usize,
}

impl ChangeScanner {
    pub fn new(source: Arc<dyn ChangeLogSource>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    pub fn source(&self) -> &Arc<dyn ChangeLogSource> {
        &self.source
    }

    /// Start a scan for the tracker's channel.
    pub async fn scan<'a>(&'a self, tracker: &'a mut GapTracker) -> Result<ScanCursor<'a>> {
        let ranges: VecDeque<(u64, u64)> = tracker
            .open_gaps()
            .iter()
            .map(|gap| (gap.start_id, gap.end_id))
            .collect();
        let watermark = self.source.max_id().await?;

        debug!(
            channel_id = %tracker.channel_id(),
            floor = tracker.floor(),
            watermark,
            rescan_ranges = ranges.len(),
            "Starting scan"
        );

        let phase = match ranges.front() {
            Some((start, end)) => Phase::Rescan {
                next_id: *start,
                end_id: *end,
            },
            None => Phase::Forward,
        };

        Ok(ScanCursor {
            source: self.source.as_ref(),
            tracker,
            page_size: self.page_size,
            pending: ranges,
            rescanned: Vec::new(),
            phase,
            buffer: VecDeque::new(),
            watermark,
            now: Utc::now(),
            interrupted: false,
        })
    }

    /// Whether `row` may go to `node` on `channel` at all.
    ///
    /// Checked before the routing policy runs. Initial-load rows bypass the
    /// table's sync flag. While a node's initial load is in progress,
    /// incremental rows committed before the load started are skipped for
    /// that node; the load snapshot already carries them.
    pub fn should_route(
        row: &ChangeRow,
        node: &NodeConfig,
        channel: &ChannelConfig,
        route: &ResolvedPolicy,
        initial_load: bool,
    ) -> bool {
        if !channel.is_routable() || !node.enabled {
            return false;
        }
        if !node.channels.iter().any(|c| *c == channel.channel_id) {
            return false;
        }
        if !initial_load && !route.sync_enabled {
            return false;
        }
        if !route.loop_back && row.source_node_id.as_deref() == Some(node.node_id.as_str()) {
            return false;
        }
        if !initial_load {
            if let Some(window) = node.initial_load.as_ref().filter(|w| w.in_progress()) {
                if row.committed_at < window.started_at {
                    return false;
                }
            }
        }
        true
    }
}

enum Phase {
    Rescan { next_id: u64, end_id: u64 },
    Forward,
    Done,
}

/// What a finished scan did to the gap set.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Gap ranges read to the end during this scan.
    pub rescanned: Vec<(u64, u64)>,
    /// The scan stopped early (stop signal or row budget).
    pub interrupted: bool,
    pub watermark: u64,
}

/// A lazy, finite pass over one channel's rows.
pub struct ScanCursor<'a> {
    source: &'a dyn ChangeLogSource,
    tracker: &'a mut GapTracker,
    page_size: usize,
    pending: VecDeque<(u64, u64)>,
    rescanned: Vec<(u64, u64)>,
    phase: Phase,
    buffer: VecDeque<ChangeRow>,
    watermark: u64,
    now: DateTime<Utc>,
    interrupted: bool,
}

impl ScanCursor<'_> {
    /// Timestamp observations are recorded with.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Hand a row back so the next scan reads it again.
    pub fn requeue(&mut self, id: u64) -> Requeue {
        self.tracker.requeue(id, self.now)
    }

    /// The next row of this channel, or `None` when the scan is over.
    pub async fn next(&mut self, ctx: &mut RouterContext) -> Result<Option<ChangeRow>> {
        loop {
            if ctx.should_yield() {
                self.interrupted = true;
                return Ok(None);
            }

            if let Some(row) = self.buffer.pop_front() {
                let observation = self.tracker.record_observed(row.id, self.now);
                self.note(&observation, ctx);
                if observation == Observation::AlreadySeen {
                    trace!(row_id = row.id, "Skipping row already read");
                    continue;
                }
                if row.channel_id != self.tracker.channel_id() {
                    continue;
                }
                ctx.stats.rows_read += 1;
                return Ok(Some(row));
            }

            if !self.fill_buffer().await? {
                return Ok(None);
            }
        }
    }

    /// Load the next page. Returns false once both phases are exhausted.
    async fn fill_buffer(&mut self) -> Result<bool> {
        loop {
            match self.phase {
                Phase::Rescan { next_id, end_id } => {
                    if next_id >= end_id {
                        self.finish_range();
                        continue;
                    }
                    let rows = self.source.read_range(next_id, end_id, self.page_size).await?;
                    let resume = if rows.len() < self.page_size {
                        end_id
                    } else {
                        rows.last().map(|r| r.id.saturating_add(1)).unwrap_or(end_id)
                    };
                    self.phase = Phase::Rescan {
                        next_id: resume,
                        end_id,
                    };
                    if !rows.is_empty() {
                        self.buffer.extend(rows);
                        return Ok(true);
                    }
                }
                Phase::Forward => {
                    let start = self.tracker.next_read_id();
                    if start > self.watermark {
                        self.phase = Phase::Done;
                        continue;
                    }
                    let rows = self
                        .source
                        .read_range(start, self.watermark.saturating_add(1), self.page_size)
                        .await?;
                    if rows.is_empty() {
                        self.phase = Phase::Done;
                        continue;
                    }
                    self.buffer.extend(rows);
                    return Ok(true);
                }
                Phase::Done => return Ok(false),
            }
        }
    }

    fn finish_range(&mut self) {
        if let Some(range) = self.pending.pop_front() {
            self.rescanned.push(range);
        }
        self.phase = match self.pending.front() {
            Some((start, end)) => Phase::Rescan {
                next_id: *start,
                end_id: *end,
            },
            None => Phase::Forward,
        };
    }

    fn note(&self, observation: &Observation, ctx: &mut RouterContext) {
        let channel_id = self.tracker.channel_id();
        match observation {
            Observation::GapOpened { start_id, end_id } => {
                ctx.stats.gaps_opened += 1;
                metrics::record_gap_opened(channel_id);
                debug!(channel_id = %channel_id, start_id, end_id, "Gap opened");
            }
            Observation::GapFilled {
                start_id,
                end_id,
                kind: GapKind::Retry,
                ..
            } => {
                debug!(channel_id = %channel_id, start_id, end_id, "Retrying row");
            }
            Observation::GapFilled {
                start_id,
                end_id,
                closed,
                ..
            } => {
                if *closed {
                    ctx.stats.gaps_filled += 1;
                    metrics::record_gap_filled(channel_id);
                }
                debug!(channel_id = %channel_id, start_id, end_id, closed, "Gap row arrived");
            }
            Observation::Advanced | Observation::AlreadySeen => {}
        }
    }

    /// End the scan, releasing the tracker.
    pub fn finish(self) -> ScanSummary {
        ScanSummary {
            rescanned: self.rescanned,
            interrupted: self.interrupted,
            watermark: self.watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InitialLoadWindow, TableRouteConfig};
    use crate::gap::{GapBudget, GapResolution, GapStatus};
    use crate::model::EventKind;
    use crate::policy::RoutingPolicy;
    use crate::source::MemoryChangeLog;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn budget() -> GapBudget {
        GapBudget {
            max_rescans: 2,
            expire_after: Duration::ZERO,
            max_retries: 3,
        }
    }

    fn row(id: u64, channel: &str) -> ChangeRow {
        ChangeRow::new(id, "orders", channel, EventKind::Insert)
    }

    async fn drain(
        scanner: &ChangeScanner,
        tracker: &mut GapTracker,
        ctx: &mut RouterContext,
    ) -> (Vec<u64>, ScanSummary) {
        let mut cursor = scanner.scan(tracker).await.unwrap();
        let mut ids = Vec::new();
        while let Some(row) = cursor.next(ctx).await.unwrap() {
            ids.push(row.id);
        }
        (ids, cursor.finish())
    }

    #[tokio::test]
    async fn test_forward_scan_opens_gap() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all([1, 2, 4, 5].map(|id| row(id, "sales")));
        let scanner = ChangeScanner::new(log.clone(), 2);
        let mut tracker = GapTracker::new("sales", budget());
        let mut ctx = RouterContext::detached("sales");

        let (ids, summary) = drain(&scanner, &mut tracker, &mut ctx).await;
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert!(!summary.interrupted);
        assert_eq!(tracker.floor(), 5);
        let gaps = tracker.open_gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].start_id, gaps[0].end_id), (3, 4));
        assert_eq!(ctx.stats.gaps_opened, 1);
    }

    #[tokio::test]
    async fn test_rescan_returns_late_row_first() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all([1, 2, 4, 5].map(|id| row(id, "sales")));
        let scanner = ChangeScanner::new(log.clone(), 10);
        let mut tracker = GapTracker::new("sales", budget());
        drain(&scanner, &mut tracker, &mut RouterContext::detached("sales")).await;

        log.insert(row(3, "sales"));
        log.insert(row(6, "sales"));
        let mut ctx = RouterContext::detached("sales");
        let (ids, summary) = drain(&scanner, &mut tracker, &mut ctx).await;

        assert_eq!(ids, vec![3, 6]);
        assert_eq!(summary.rescanned, vec![(3, 4)]);
        assert!(tracker.open_gaps().is_empty());
        assert_eq!(
            tracker.closed_gaps()[0].status,
            GapStatus::Closed(GapResolution::Filled)
        );
        assert_eq!(ctx.stats.gaps_filled, 1);
    }

    #[tokio::test]
    async fn test_other_channels_observed_not_returned() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all([row(1, "sales"), row(2, "config"), row(3, "sales")]);
        let scanner = ChangeScanner::new(log, 10);
        let mut tracker = GapTracker::new("sales", budget());
        let mut ctx = RouterContext::detached("sales");

        let (ids, _) = drain(&scanner, &mut tracker, &mut ctx).await;
        assert_eq!(ids, vec![1, 3]);
        assert!(tracker.open_gaps().is_empty());
        assert_eq!(ctx.stats.rows_read, 2);
    }

    #[tokio::test]
    async fn test_second_scan_without_captures_is_empty() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all((1..=5).map(|id| row(id, "sales")));
        let scanner = ChangeScanner::new(log, 2);
        let mut tracker = GapTracker::new("sales", budget());
        drain(&scanner, &mut tracker, &mut RouterContext::detached("sales")).await;

        let (ids, _) = drain(&scanner, &mut tracker, &mut RouterContext::detached("sales")).await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_budget_stops_at_row_boundary() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all((1..=10).map(|id| row(id, "sales")));
        let scanner = ChangeScanner::new(log, 4);
        let mut tracker = GapTracker::new("sales", budget());
        let mut ctx = RouterContext::new("sales", Arc::new(AtomicBool::new(false)), 3);

        let (ids, summary) = drain(&scanner, &mut tracker, &mut ctx).await;
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(summary.interrupted);
        assert_eq!(tracker.floor(), 3);

        let (rest, _) = drain(&scanner, &mut tracker, &mut RouterContext::detached("sales")).await;
        assert_eq!(rest, (4..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_restart_from_snapshot_reproduces_sequence() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all([1, 2, 5, 6, 8].map(|id| row(id, "sales")));
        let scanner = ChangeScanner::new(log, 3);

        let snapshot = GapTracker::new("sales", budget());
        let mut first = snapshot.clone();
        let mut second = snapshot.clone();
        let (a, _) = drain(&scanner, &mut first, &mut RouterContext::detached("sales")).await;
        let (b, _) = drain(&scanner, &mut second, &mut RouterContext::detached("sales")).await;
        assert_eq!(a, b);
        assert_eq!(first.all_gaps().len(), second.all_gaps().len());
    }

    fn resolved(sync_enabled: bool, loop_back: bool) -> ResolvedPolicy {
        let route = TableRouteConfig {
            sync_enabled,
            loop_back,
            ..TableRouteConfig::for_testing("orders", "sales", "default")
        };
        ResolvedPolicy {
            name: route.router.clone(),
            policy: Arc::new(RoutingPolicy::Default),
            sync_enabled: route.sync_enabled,
            loop_back: route.loop_back,
        }
    }

    #[test]
    fn test_should_route_filters() {
        let channel = ChannelConfig::for_testing("sales", 10);
        let node = NodeConfig::for_testing("A", &["sales"]);
        let route = resolved(true, false);
        let plain = row(1, "sales");

        assert!(ChangeScanner::should_route(&plain, &node, &channel, &route, false));

        let mut suspended = channel.clone();
        suspended.suspended = true;
        assert!(!ChangeScanner::should_route(&plain, &node, &suspended, &route, false));

        let other = NodeConfig::for_testing("B", &["config"]);
        assert!(!ChangeScanner::should_route(&plain, &other, &channel, &route, false));

        let echo = row(2, "sales").from_node("A");
        assert!(!ChangeScanner::should_route(&echo, &node, &channel, &route, false));
        assert!(ChangeScanner::should_route(&echo, &node, &channel, &resolved(true, true), false));
    }

    #[test]
    fn test_initial_load_bypasses_sync_flag() {
        let channel = ChannelConfig::for_testing("sales", 10);
        let node = NodeConfig::for_testing("A", &["sales"]);
        let disabled = resolved(false, false);
        let plain = row(1, "sales");
        assert!(!ChangeScanner::should_route(&plain, &node, &channel, &disabled, false));
        assert!(ChangeScanner::should_route(&plain, &node, &channel, &disabled, true));
    }

    #[test]
    fn test_load_window_skips_older_incremental_rows() {
        let channel = ChannelConfig::for_testing("sales", 10);
        let started = Utc::now();
        let mut node = NodeConfig::for_testing("A", &["sales"]);
        node.initial_load = Some(InitialLoadWindow {
            started_at: started,
            ended_at: None,
        });
        let route = resolved(true, false);

        let before = row(1, "sales").committed(started - ChronoDuration::seconds(5));
        let after = row(2, "sales").committed(started + ChronoDuration::seconds(5));
        assert!(!ChangeScanner::should_route(&before, &node, &channel, &route, false));
        assert!(ChangeScanner::should_route(&after, &node, &channel, &route, false));
        assert!(ChangeScanner::should_route(&before, &node, &channel, &route, true));

        node.initial_load = Some(InitialLoadWindow {
            started_at: started,
            ended_at: Some(started),
        });
        assert!(ChangeScanner::should_route(&before, &node, &channel, &route, false));
    }
}
