// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One channel routing pass.
//!
//! ```text
//! load state (first pass / after failure)
//!        │
//!        ▼
//! scan ──▶ resolve ──▶ should_route ──▶ evaluate ──▶ append ──▶ (closed batches)
//!   ▲                                                   │
//!   └───────────────── next row ────────────────────────┘
//!        │
//!        ▼
//! gap upkeep ──▶ close due/forced ──▶ commit (one transaction) ──▶ publish
//! ```
//!
//! Any error before the commit abandons the pass: nothing is written, the
//! in-memory channel state is dropped and reloaded from the store on the
//! next pass, so routing resumes at the last committed batch boundary.

use super::types::{PassOutcome, PassState};
use super::{ack, Inner};
use crate::batch::{Batch, BatchAssembler};
use crate::config::{ChannelConfig, NodeConfig};
use crate::context::{PassStats, RouterContext, RoutingIssue};
use crate::error::{Result, RouterError};
use crate::gap::{GapBudget, GapTracker, Requeue};
use crate::metrics;
use crate::policy::TargetNode;
use crate::scanner::ChangeScanner;
use crate::store::{ChannelProgress, PassCommit};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Routing state kept in memory between passes.
struct LoadedChannel {
    tracker: GapTracker,
    assembler: BatchAssembler,
    last_routed_id: u64,
}

/// Guarded by the channel's routing lock.
#[derive(Default)]
pub(super) struct ChannelWork {
    loaded: Option<LoadedChannel>,
}

/// Cached status, readable without the routing lock.
#[derive(Debug, Clone)]
pub(super) struct ChannelStatus {
    pub(super) pass_state: PassState,
    pub(super) last_pass_at: Option<DateTime<Utc>>,
    pub(super) last_error: Option<String>,
    pub(super) consecutive_failures: usize,
    pub(super) backoff_until: Option<Instant>,
    pub(super) open_gaps: usize,
    pub(super) retry_rows: usize,
    pub(super) oldest_gap_age: Option<Duration>,
    pub(super) unrouted: Option<u64>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            pass_state: PassState::Idle,
            last_pass_at: None,
            last_error: None,
            consecutive_failures: 0,
            backoff_until: None,
            open_gaps: 0,
            retry_rows: 0,
            oldest_gap_age: None,
            unrouted: None,
        }
    }
}

/// One configured channel.
pub(super) struct ChannelRuntime {
    pub(super) config: ChannelConfig,
    /// The per-channel routing lock. Held for the whole pass.
    work: tokio::sync::Mutex<ChannelWork>,
    status: std::sync::Mutex<ChannelStatus>,
}

impl ChannelRuntime {
    pub(super) fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            work: tokio::sync::Mutex::new(ChannelWork::default()),
            status: std::sync::Mutex::new(ChannelStatus::default()),
        }
    }

    pub(super) fn status(&self) -> ChannelStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(super) fn update_status(&self, f: impl FnOnce(&mut ChannelStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    fn in_backoff(&self) -> bool {
        self.status()
            .backoff_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

/// What a successful pass produced, before publishing.
struct PassResult {
    state: PassState,
    stats: PassStats,
    issues: Vec<RoutingIssue>,
    ready: Vec<Batch>,
    open_gaps: usize,
    retry_rows: usize,
    oldest_gap_age: Option<Duration>,
}

/// Run a pass on every routable channel, in parallel.
///
/// Channels already mid-pass are skipped. With `honor_backoff`, channels
/// whose recent passes failed are skipped until their backoff elapses.
pub(super) async fn route_all(inner: &Arc<Inner>, force: bool, honor_backoff: bool) -> Vec<PassOutcome> {
    let mut set = JoinSet::new();

    for channel in &inner.channels {
        if !channel.config.is_routable() {
            continue;
        }
        if honor_backoff && channel.in_backoff() {
            debug!(channel_id = %channel.config.channel_id, "Channel in failure backoff, skipping");
            continue;
        }

        let inner = Arc::clone(inner);
        let channel = Arc::clone(channel);
        set.spawn(async move {
            let _permit = match inner.bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(channel_id = %channel.config.channel_id, error = %e, "No pass slot");
                    return None;
                }
            };
            run_pass(&inner, &channel, force).await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(outcome)) => outcomes.push(outcome),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Channel pass task panicked"),
        }
    }
    outcomes.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    outcomes
}

/// Run one pass on one channel. `None` if the channel is already mid-pass.
pub(super) async fn run_pass(inner: &Inner, channel: &ChannelRuntime, force: bool) -> Option<PassOutcome> {
    let channel_id = channel.config.channel_id.clone();
    let Ok(mut work) = channel.work.try_lock() else {
        debug!(channel_id = %channel_id, "Channel pass already running, skipping");
        return None;
    };

    let started = Instant::now();
    channel.update_status(|s| s.pass_state = PassState::Running);

    let result = route_channel(inner, &channel.config, &mut work, force)
        .instrument(info_span!("route_channel", channel_id = %channel_id))
        .await;

    let outcome = match result {
        Ok(pass) => {
            let published = ack::publish(inner, pass.ready, false).await;
            let duration = started.elapsed();
            record_stats(&channel_id, &pass.stats);
            metrics::record_pass(&channel_id, pass.state.as_str(), duration);
            metrics::set_open_gaps(&channel_id, pass.open_gaps, pass.oldest_gap_age);
            metrics::set_retry_rows(&channel_id, pass.retry_rows);
            channel.update_status(|s| {
                s.pass_state = pass.state;
                s.last_pass_at = Some(Utc::now());
                s.last_error = None;
                s.consecutive_failures = 0;
                s.backoff_until = None;
                s.open_gaps = pass.open_gaps;
                s.retry_rows = pass.retry_rows;
                s.oldest_gap_age = pass.oldest_gap_age;
            });
            if pass.stats.rows_read > 0 || published > 0 {
                info!(
                    channel_id = %channel_id,
                    rows_read = pass.stats.rows_read,
                    rows_routed = pass.stats.rows_routed,
                    batches_published = published,
                    duration_ms = duration.as_millis() as u64,
                    "Routing pass finished"
                );
            }
            PassOutcome {
                channel_id,
                state: pass.state,
                stats: pass.stats,
                issues: pass.issues,
                batches_published: published,
                duration,
                error: None,
            }
        }
        Err(e) => {
            work.loaded = None;
            let duration = started.elapsed();
            metrics::record_pass(&channel_id, PassState::Failed.as_str(), duration);
            let mut failures = 0;
            channel.update_status(|s| {
                s.consecutive_failures += 1;
                failures = s.consecutive_failures;
                s.backoff_until = Some(Instant::now() + inner.retry.delay_for_attempt(failures));
                s.pass_state = PassState::Failed;
                s.last_pass_at = Some(Utc::now());
                s.last_error = Some(e.to_string());
            });
            error!(
                channel_id = %channel_id,
                error = %e,
                consecutive_failures = failures,
                "Routing pass failed, nothing committed"
            );
            PassOutcome {
                channel_id,
                state: PassState::Failed,
                stats: PassStats::default(),
                issues: Vec::new(),
                batches_published: 0,
                duration,
                error: Some(e.to_string()),
            }
        }
    };
    Some(outcome)
}

fn record_stats(channel_id: &str, stats: &PassStats) {
    metrics::record_rows_read(channel_id, stats.rows_read);
    metrics::record_rows_routed(channel_id, stats.placements);
    metrics::record_rows_dropped(channel_id, "no_target", stats.rows_unrouted);
    metrics::record_rows_dropped(channel_id, "filtered", stats.rows_filtered);
    metrics::record_rows_dropped(channel_id, "policy_error", stats.policy_errors);
    metrics::record_rows_dropped(channel_id, "abandoned", stats.rows_abandoned);
}

async fn load(inner: &Inner, config: &ChannelConfig) -> Result<LoadedChannel> {
    let channel_id = &config.channel_id;
    let progress = inner.store.load_progress(channel_id).await?.unwrap_or_default();
    let gaps = inner.store.load_gaps(channel_id).await?;
    let open = inner.store.load_open_batches(channel_id).await?;

    let tracker = GapTracker::restore(
        channel_id,
        progress.floor_id,
        gaps,
        GapBudget::from(&inner.config.settings.gap),
    );
    let assembler = BatchAssembler::restore(config, Arc::clone(&inner.ids), open);

    info!(
        channel_id = %channel_id,
        floor_id = tracker.floor(),
        open_gaps = tracker.open_gaps().len(),
        open_batches = assembler.open_count(),
        "Loaded channel routing state"
    );

    Ok(LoadedChannel {
        tracker,
        assembler,
        last_routed_id: progress.last_routed_id,
    })
}

async fn route_channel(
    inner: &Inner,
    config: &ChannelConfig,
    work: &mut ChannelWork,
    force: bool,
) -> Result<PassResult> {
    if work.loaded.is_none() {
        work.loaded = Some(load(inner, config).await?);
    }
    let LoadedChannel {
        tracker,
        assembler,
        last_routed_id,
    } = work
        .loaded
        .as_mut()
        .ok_or_else(|| RouterError::Internal("channel state not loaded".to_string()))?;

    let channel_id = config.channel_id.as_str();
    let settings = &inner.config.settings;
    let mut ctx = RouterContext::new(channel_id, Arc::clone(&inner.stop), settings.pass.max_rows_per_pass);
    let subscribers: Vec<&NodeConfig> = inner.config.subscribers(channel_id);
    assembler.begin_pass();

    let mut cursor = inner.scanner.scan(tracker).await?;
    let now = cursor.now();

    while let Some(row) = cursor.next(&mut ctx).await? {
        let Some(resolved) = inner.registry.resolve(&row.table, channel_id)? else {
            ctx.stats.rows_filtered += 1;
            continue;
        };

        let initial_load = row.is_initial_load();
        let eligible: Vec<TargetNode> = subscribers
            .iter()
            .filter(|node| ChangeScanner::should_route(&row, node, config, &resolved, initial_load))
            .map(|node| TargetNode::from(*node))
            .collect();
        if eligible.is_empty() {
            ctx.stats.rows_filtered += 1;
            continue;
        }

        let failures = ctx.stats.policy_errors;
        let decision = inner.registry.evaluate(&resolved, &row, &eligible, &mut ctx).await?;
        if ctx.stats.policy_errors > failures {
            match cursor.requeue(row.id) {
                Requeue::Queued => ctx.stats.rows_retried += 1,
                Requeue::Abandoned(gap) => {
                    ctx.stats.rows_abandoned += 1;
                    warn!(
                        channel_id = %channel_id,
                        row_id = row.id,
                        retries = gap.rescans,
                        "Routing kept failing, row abandoned"
                    );
                }
                Requeue::Ignored => {}
            }
            continue;
        }
        if decision.is_empty() {
            ctx.stats.rows_unrouted += 1;
            continue;
        }

        for node_id in &decision.targets {
            let closed = assembler.append(node_id, &row, decision.initial_load, now);
            ctx.push_ready(closed);
            ctx.stats.placements += 1;
        }
        ctx.stats.rows_routed += 1;
        *last_routed_id = (*last_routed_id).max(row.id);
    }
    let summary = cursor.finish();
    if summary.interrupted {
        debug!(
            channel_id = %channel_id,
            rows_read = ctx.stats.rows_read,
            watermark = summary.watermark,
            "Pass yielded before reaching the watermark"
        );
    }

    // Gap upkeep. Overdue gaps closed here got their final rescan above.
    for gap in tracker.close_overdue(&summary.rescanned, now) {
        ctx.stats.gaps_expired += 1;
        metrics::record_gap_expired(channel_id, gap.len());
        warn!(
            channel_id = %channel_id,
            start_id = gap.start_id,
            end_id = gap.end_id,
            rescans = gap.rescans,
            "Gap expired, ids treated as a permanent hole"
        );
    }
    tracker.record_rescan(&summary.rescanned);
    for gap in tracker.expire_due(now) {
        info!(
            channel_id = %channel_id,
            start_id = gap.start_id,
            end_id = gap.end_id,
            "Gap overdue, one final rescan left"
        );
    }
    let pruned = tracker.prune_closed(now, settings.gap.closed_retention_duration());
    if pruned > 0 {
        debug!(channel_id = %channel_id, pruned, "Pruned closed gaps");
    }

    let state = if ctx.stop_requested() {
        PassState::Stopped
    } else {
        PassState::Completed
    };
    ctx.push_ready(assembler.close_all_due(now));
    if force || state == PassState::Stopped {
        ctx.push_ready(assembler.force_close_all(now));
    }

    assembler.end_pass();

    let (ready, stats, issues) = ctx.finish();
    for batch in &ready {
        let reason = batch.close_reason.map(|r| r.as_str()).unwrap_or("unknown");
        metrics::record_batch_closed(channel_id, reason, batch.len());
    }

    let mut touched: Vec<&Batch> = ready.iter().collect();
    touched.extend(assembler.open_batches());
    inner
        .store
        .commit_pass(&PassCommit {
            channel_id,
            progress: ChannelProgress {
                floor_id: tracker.floor(),
                last_routed_id: *last_routed_id,
            },
            gaps: tracker.all_gaps(),
            batches: touched,
            sequences: inner.ids.high_water_marks(),
        })
        .await?;

    let retry_rows = tracker.retry_ids().len();
    Ok(PassResult {
        state,
        stats,
        issues,
        ready,
        open_gaps: tracker.open_gaps().len().saturating_sub(retry_rows),
        retry_rows,
        oldest_gap_age: tracker.oldest_gap_age(now),
    })
}

/// Close and publish every open batch on a channel, without reading rows.
///
/// Runs once per channel on shutdown. Returns the batches closed.
pub(super) async fn flush_channel(inner: &Inner, channel: &ChannelRuntime) -> Result<usize> {
    let mut work = channel.work.lock().await;
    let result = flush_locked(inner, &channel.config, &mut work).await;
    match result {
        Ok(ready) => {
            let closed = ready.len();
            ack::publish(inner, ready, false).await;
            Ok(closed)
        }
        Err(e) => {
            work.loaded = None;
            Err(e)
        }
    }
}

async fn flush_locked(inner: &Inner, config: &ChannelConfig, work: &mut ChannelWork) -> Result<Vec<Batch>> {
    if work.loaded.is_none() {
        work.loaded = Some(load(inner, config).await?);
    }
    let Some(loaded) = work.loaded.as_mut() else {
        return Err(RouterError::Internal("channel state not loaded".to_string()));
    };

    let ready = loaded.assembler.force_close_all(Utc::now());
    if ready.is_empty() {
        return Ok(ready);
    }
    for batch in &ready {
        metrics::record_batch_closed(&config.channel_id, "forced", batch.len());
    }

    inner
        .store
        .commit_pass(&PassCommit {
            channel_id: &config.channel_id,
            progress: ChannelProgress {
                floor_id: loaded.tracker.floor(),
                last_routed_id: loaded.last_routed_id,
            },
            gaps: loaded.tracker.all_gaps(),
            batches: ready.iter().collect(),
            sequences: inner.ids.high_water_marks(),
        })
        .await?;

    info!(channel_id = %config.channel_id, batches = ready.len(), "Flushed open batches");
    Ok(ready)
}
