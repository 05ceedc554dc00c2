// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequence and gap tracking.
//!
//! Change ids come from one shared sequence, but concurrent transactions
//! commit out of order, so at read time the visible ids can have holes.
//! The [`GapTracker`] keeps, per channel:
//!
//! - `floor`: the highest id the scanner has read past. Every id at or below
//!   the floor is either observed, inside an OPEN/OVERDUE gap, or inside a
//!   gap that was CLOSED as expired.
//! - the OPEN/OVERDUE gaps below the floor, keyed by start id.
//!
//! # Gap Lifecycle
//!
//! ```text
//!  observe id > floor+1           retries + age exhausted        final rescan
//! ───────────────────▶  OPEN  ───────────────────────────▶ OVERDUE ──────────▶ CLOSED(Expired)
//!                        │                                    │
//!                        │ missing id observed                │ missing id observed
//!                        ▼                                    ▼
//!                 split / CLOSED(Filled)               split / CLOSED(Filled)
//! ```
//!
//! Rescanning is bounded: a gap is rescanned once per pass and becomes
//! overdue after `max_rescans` rescans once it is also older than
//! `expire_after`. An overdue gap gets one more rescan on the next pass and
//! then closes as a permanent hole (a rolled-back transaction that reserved
//! ids but never committed).
//!
//! # Retry Gaps
//!
//! A row that was read but whose routing policy failed is put back as a
//! one-id [`GapKind::Retry`] gap, so the next pass reads it again. Retry gaps
//! never go overdue; they count attempts instead and close as
//! [`GapResolution::Abandoned`] once `max_retries` retries have failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::GapConfig;

/// How a closed gap was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapResolution {
    /// Every missing id showed up.
    Filled,
    /// The rescan budget ran out; the ids are treated as a permanent hole.
    Expired,
    /// A row whose routing kept failing was given up on.
    Abandoned,
}

/// State of a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapStatus {
    Open,
    Overdue,
    Closed(GapResolution),
}

impl GapStatus {
    /// Two-letter code persisted in the routing store.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Open => "OP",
            Self::Overdue => "OD",
            Self::Closed(GapResolution::Filled) => "FL",
            Self::Closed(GapResolution::Expired) => "EX",
            Self::Closed(GapResolution::Abandoned) => "AB",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "OP" => Some(Self::Open),
            "OD" => Some(Self::Overdue),
            "FL" => Some(Self::Closed(GapResolution::Filled)),
            "EX" => Some(Self::Closed(GapResolution::Expired)),
            "AB" => Some(Self::Closed(GapResolution::Abandoned)),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl fmt::Display for GapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Overdue => write!(f, "OVERDUE"),
            Self::Closed(GapResolution::Filled) => write!(f, "CLOSED(filled)"),
            Self::Closed(GapResolution::Expired) => write!(f, "CLOSED(expired)"),
            Self::Closed(GapResolution::Abandoned) => write!(f, "CLOSED(abandoned)"),
        }
    }
}

/// Why an id range is tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind {
    /// Ids not yet visible in the change log.
    #[default]
    Capture,
    /// A visible row whose routing failed, queued for another attempt.
    Retry,
}

impl GapKind {
    /// Label used in the routing store and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Retry => "retry",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "capture" => Some(Self::Capture),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for GapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open range `[start_id, end_id)` of ids not yet confirmed captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGap {
    pub channel_id: String,
    pub start_id: u64,
    pub end_id: u64,
    #[serde(default)]
    pub kind: GapKind,
    pub status: GapStatus,
    /// Completed rescans; failed retries for [`GapKind::Retry`] gaps.
    pub rescans: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl DataGap {
    pub fn new(channel_id: &str, start_id: u64, end_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            start_id,
            end_id,
            kind: GapKind::Capture,
            status: GapStatus::Open,
            rescans: 0,
            created_at: now,
            closed_at: None,
        }
    }

    /// One-id retry gap for a row whose routing failed.
    pub fn retry(channel_id: &str, id: u64, now: DateTime<Utc>) -> Self {
        Self {
            kind: GapKind::Retry,
            ..Self::new(channel_id, id, id + 1, now)
        }
    }

    pub fn is_retry(&self) -> bool {
        self.kind == GapKind::Retry
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start_id && id < self.end_id
    }

    /// Number of ids in the gap.
    pub fn len(&self) -> u64 {
        self.end_id.saturating_sub(self.start_id)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Same gap state, narrower range (used when a fill splits a gap).
    fn fragment(&self, start_id: u64, end_id: u64) -> Self {
        Self {
            start_id,
            end_id,
            ..self.clone()
        }
    }
}

/// What observing an id did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// `id == floor + 1`: the contiguous range grew.
    Advanced,
    /// A forward jump opened a new gap.
    GapOpened { start_id: u64, end_id: u64 },
    /// A row materialized inside a tracked gap.
    GapFilled {
        start_id: u64,
        end_id: u64,
        kind: GapKind,
        /// True when no ids of the original gap remain missing.
        closed: bool,
    },
    /// Already at or below the floor and not in a gap (a re-read).
    AlreadySeen,
}

/// What putting a row back for another attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    /// The row is read again next pass.
    Queued,
    /// Retries are exhausted; the row is dropped and recorded closed.
    Abandoned(DataGap),
    /// The id is above the floor or already tracked.
    Ignored,
}

/// Budget parameters, resolved from [`GapConfig`].
#[derive(Debug, Clone, Copy)]
pub struct GapBudget {
    pub max_rescans: u32,
    pub expire_after: Duration,
    /// Failed retries before a requeued row is abandoned.
    pub max_retries: u32,
}

impl From<&GapConfig> for GapBudget {
    fn from(config: &GapConfig) -> Self {
        Self {
            max_rescans: config.max_rescans,
            expire_after: config.expire_after_duration(),
            max_retries: config.max_policy_retries,
        }
    }
}

/// Per-channel view of which id ranges are fully visible.
#[derive(Debug, Clone)]
pub struct GapTracker {
    channel_id: String,
    floor: u64,
    /// OPEN and OVERDUE gaps keyed by start id.
    gaps: BTreeMap<u64, DataGap>,
    /// Gaps closed since the last prune, retained for audit.
    closed: Vec<DataGap>,
    budget: GapBudget,
}

impl GapTracker {
    /// A tracker that has seen nothing yet.
    pub fn new(channel_id: &str, budget: GapBudget) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            floor: 0,
            gaps: BTreeMap::new(),
            closed: Vec::new(),
            budget,
        }
    }

    /// Rebuild a tracker from persisted state.
    pub fn restore(
        channel_id: &str,
        floor: u64,
        gaps: impl IntoIterator<Item = DataGap>,
        budget: GapBudget,
    ) -> Self {
        let mut tracker = Self::new(channel_id, budget);
        tracker.floor = floor;
        for gap in gaps {
            if gap.status.is_closed() {
                tracker.closed.push(gap);
            } else {
                tracker.gaps.insert(gap.start_id, gap);
            }
        }
        tracker
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Highest id read past.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Next id the scanner should read.
    pub fn next_read_id(&self) -> u64 {
        self.floor.saturating_add(1)
    }

    /// OPEN and OVERDUE gaps, ascending by start id.
    pub fn open_gaps(&self) -> Vec<&DataGap> {
        self.gaps.values().collect()
    }

    /// Closed gaps still retained.
    pub fn closed_gaps(&self) -> &[DataGap] {
        &self.closed
    }

    /// Every gap the tracker knows about, for persistence.
    pub fn all_gaps(&self) -> Vec<DataGap> {
        self.closed
            .iter()
            .chain(self.gaps.values())
            .cloned()
            .collect()
    }

    fn gap_containing(&self, id: u64) -> Option<u64> {
        self.gaps
            .range(..=id)
            .next_back()
            .filter(|(_, gap)| gap.contains(id))
            .map(|(start, _)| *start)
    }

    /// Record that `id` is visible in the change log.
    pub fn record_observed(&mut self, id: u64, now: DateTime<Utc>) -> Observation {
        let expected = self.next_read_id();

        if id == expected {
            self.floor = id;
            return Observation::Advanced;
        }

        if id > expected {
            let gap = DataGap::new(&self.channel_id, expected, id, now);
            self.gaps.insert(expected, gap);
            self.floor = id;
            return Observation::GapOpened {
                start_id: expected,
                end_id: id,
            };
        }

        match self.gap_containing(id) {
            Some(start) => self.fill(start, id, now),
            None => Observation::AlreadySeen,
        }
    }

    /// Remove `id` from the gap starting at `start`, splitting it if needed.
    fn fill(&mut self, start: u64, id: u64, now: DateTime<Utc>) -> Observation {
        let Some(gap) = self.gaps.remove(&start) else {
            return Observation::AlreadySeen;
        };

        if gap.start_id < id {
            self.gaps.insert(gap.start_id, gap.fragment(gap.start_id, id));
        }
        if id + 1 < gap.end_id {
            self.gaps.insert(id + 1, gap.fragment(id + 1, gap.end_id));
        }

        let closed = gap.len() == 1;
        if closed {
            let mut done = gap.clone();
            done.status = GapStatus::Closed(GapResolution::Filled);
            done.closed_at = Some(now);
            self.closed.push(done);
        }

        Observation::GapFilled {
            start_id: gap.start_id,
            end_id: gap.end_id,
            kind: gap.kind,
            closed,
        }
    }

    /// Count one rescan against every capture gap starting inside the given
    /// ranges.
    ///
    /// Fragments produced by fills during the rescan keep their start inside
    /// the original range, so they are counted too. Gaps opened after the
    /// rescan snapshot are not. Retry gaps count attempts in [`Self::requeue`].
    pub fn record_rescan(&mut self, ranges: &[(u64, u64)]) {
        for gap in self.gaps.values_mut().filter(|gap| !gap.is_retry()) {
            if ranges
                .iter()
                .any(|(start, end)| gap.start_id >= *start && gap.start_id < *end)
            {
                gap.rescans = gap.rescans.saturating_add(1);
            }
        }
    }

    /// Move a gap to OVERDUE. Returns false if no such open gap exists.
    pub fn mark_overdue(&mut self, start_id: u64) -> bool {
        match self.gaps.get_mut(&start_id) {
            Some(gap) if gap.status == GapStatus::Open => {
                gap.status = GapStatus::Overdue;
                true
            }
            _ => false,
        }
    }

    /// Close a tracked gap with the given resolution.
    pub fn close_gap(
        &mut self,
        start_id: u64,
        resolution: GapResolution,
        now: DateTime<Utc>,
    ) -> Option<DataGap> {
        let mut gap = self.gaps.remove(&start_id)?;
        gap.status = GapStatus::Closed(resolution);
        gap.closed_at = Some(now);
        self.closed.push(gap.clone());
        Some(gap)
    }

    /// Mark OPEN capture gaps that exhausted their budget as OVERDUE.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<DataGap> {
        let due: Vec<u64> = self
            .gaps
            .values()
            .filter(|gap| gap.status == GapStatus::Open && !gap.is_retry())
            .filter(|gap| gap.rescans >= self.budget.max_rescans)
            .filter(|gap| gap.age(now) >= self.budget.expire_after)
            .map(|gap| gap.start_id)
            .collect();

        let mut overdue = Vec::with_capacity(due.len());
        for start in due {
            if self.mark_overdue(start) {
                if let Some(gap) = self.gaps.get(&start) {
                    overdue.push(gap.clone());
                }
            }
        }
        overdue
    }

    /// Close OVERDUE gaps that got their final rescan as expired.
    ///
    /// Only gaps starting inside `rescanned` are closed; an overdue gap the
    /// scan never reached stays overdue until a pass rescans it.
    pub fn close_overdue(&mut self, rescanned: &[(u64, u64)], now: DateTime<Utc>) -> Vec<DataGap> {
        let overdue: Vec<u64> = self
            .gaps
            .values()
            .filter(|gap| gap.status == GapStatus::Overdue)
            .filter(|gap| {
                rescanned
                    .iter()
                    .any(|(start, end)| gap.start_id >= *start && gap.start_id < *end)
            })
            .map(|gap| gap.start_id)
            .collect();

        overdue
            .into_iter()
            .filter_map(|start| self.close_gap(start, GapResolution::Expired, now))
            .collect()
    }

    /// Put an already-read id back as a one-id retry gap so the next scan
    /// reads it again. Used for rows whose routing failed this pass.
    ///
    /// If the id just filled a gap at `now`, that closed record is dropped.
    /// A filled retry gap passes on its attempt count plus one; once that
    /// reaches `max_retries` the row is abandoned instead of queued.
    pub fn requeue(&mut self, id: u64, now: DateTime<Utc>) -> Requeue {
        if id == 0 || id > self.floor || self.gap_containing(id).is_some() {
            return Requeue::Ignored;
        }
        let mut gap = DataGap::retry(&self.channel_id, id, now);
        if let Some(index) = self.closed.iter().rposition(|closed| {
            closed.status == GapStatus::Closed(GapResolution::Filled)
                && closed.closed_at == Some(now)
                && closed.contains(id)
        }) {
            let filled = self.closed.remove(index);
            gap.created_at = filled.created_at;
            if filled.is_retry() {
                gap.rescans = filled.rescans.saturating_add(1);
            }
        }

        if gap.rescans >= self.budget.max_retries {
            gap.status = GapStatus::Closed(GapResolution::Abandoned);
            gap.closed_at = Some(now);
            self.closed.push(gap.clone());
            return Requeue::Abandoned(gap);
        }
        self.gaps.insert(id, gap);
        Requeue::Queued
    }

    /// Ids of retry gaps still queued.
    pub fn retry_ids(&self) -> Vec<u64> {
        self.gaps
            .values()
            .filter(|gap| gap.is_retry())
            .map(|gap| gap.start_id)
            .collect()
    }

    /// Drop closed gaps older than the retention window. Returns how many.
    pub fn prune_closed(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.closed.len();
        self.closed.retain(|gap| {
            gap.closed_at
                .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO) < retention)
                .unwrap_or(true)
        });
        before - self.closed.len()
    }

    /// Ids still possibly in flight.
    pub fn missing_ids(&self) -> u64 {
        self.gaps.values().map(DataGap::len).sum()
    }

    /// Age of the oldest tracked gap.
    pub fn oldest_gap_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.gaps.values().map(|gap| gap.age(now)).max()
    }

    /// Verify the tracked ranges are well formed.
    ///
    /// Open gaps are non-empty, sorted, non-overlapping and lie inside
    /// `[1, floor]`. Returns a description of the first violation.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut previous_end = 1u64;
        for (start, gap) in &self.gaps {
            if *start != gap.start_id {
                return Err(format!("gap keyed {} starts at {}", start, gap.start_id));
            }
            if gap.is_empty() {
                return Err(format!("empty gap at {}", gap.start_id));
            }
            if gap.start_id < previous_end {
                return Err(format!(
                    "gap [{}, {}) overlaps previous range ending {}",
                    gap.start_id, gap.end_id, previous_end
                ));
            }
            if gap.end_id > self.floor.saturating_add(1) {
                return Err(format!(
                    "gap [{}, {}) extends past floor {}",
                    gap.start_id, gap.end_id, self.floor
                ));
            }
            previous_end = gap.end_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(max_rescans: u32) -> GapBudget {
        GapBudget {
            max_rescans,
            expire_after: Duration::ZERO,
            max_retries: 2,
        }
    }

    fn tracker() -> GapTracker {
        GapTracker::new("sales", budget(2))
    }

    #[test]
    fn test_contiguous_ids_advance_floor() {
        let mut t = tracker();
        let now = Utc::now();
        for id in 1..=5 {
            assert_eq!(t.record_observed(id, now), Observation::Advanced);
        }
        assert_eq!(t.floor(), 5);
        assert_eq!(t.next_read_id(), 6);
        assert!(t.open_gaps().is_empty());
    }

    #[test]
    fn test_jump_opens_gap() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(2, now);
        assert_eq!(
            t.record_observed(4, now),
            Observation::GapOpened { start_id: 3, end_id: 4 }
        );
        t.record_observed(5, now);

        let gaps = t.open_gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].start_id, gaps[0].end_id), (3, 4));
        assert_eq!(gaps[0].status, GapStatus::Open);
        assert_eq!(t.floor(), 5);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_first_id_above_one_opens_gap() {
        let mut t = tracker();
        let obs = t.record_observed(10, Utc::now());
        assert_eq!(obs, Observation::GapOpened { start_id: 1, end_id: 10 });
        assert_eq!(t.missing_ids(), 9);
    }

    #[test]
    fn test_fill_single_id_closes_gap() {
        let mut t = tracker();
        let now = Utc::now();
        for id in [1, 2, 4, 5] {
            t.record_observed(id, now);
        }
        let obs = t.record_observed(3, now);
        assert_eq!(
            obs,
            Observation::GapFilled {
                start_id: 3,
                end_id: 4,
                kind: GapKind::Capture,
                closed: true,
            }
        );
        assert!(t.open_gaps().is_empty());
        assert_eq!(t.closed_gaps().len(), 1);
        assert_eq!(
            t.closed_gaps()[0].status,
            GapStatus::Closed(GapResolution::Filled)
        );
    }

    #[test]
    fn test_fill_middle_splits_gap() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(10, now); // gap [2, 10)
        t.record_observed(5, now);

        let ranges: Vec<_> = t.open_gaps().iter().map(|g| (g.start_id, g.end_id)).collect();
        assert_eq!(ranges, vec![(2, 5), (6, 10)]);
        assert!(t.check_invariants().is_ok());
    }

    #[test]
    fn test_fill_edges_shrink_gap() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(5, now); // gap [2, 5)
        t.record_observed(2, now);
        t.record_observed(4, now);

        let ranges: Vec<_> = t.open_gaps().iter().map(|g| (g.start_id, g.end_id)).collect();
        assert_eq!(ranges, vec![(3, 4)]);
    }

    #[test]
    fn test_reread_below_floor_is_already_seen() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(2, now);
        assert_eq!(t.record_observed(1, now), Observation::AlreadySeen);
    }

    #[test]
    fn test_gap_expires_after_budget() {
        let mut t = tracker();
        let now = Utc::now();
        for id in [1, 2, 4, 5] {
            t.record_observed(id, now);
        }
        let ranges = vec![(3, 4)];

        // One rescan: still under budget.
        t.record_rescan(&ranges);
        assert!(t.expire_due(now).is_empty());

        // Second rescan: overdue.
        t.record_rescan(&ranges);
        let overdue = t.expire_due(now);
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].status, GapStatus::Overdue);

        // Final close.
        let closed = t.close_overdue(&ranges, now);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, GapStatus::Closed(GapResolution::Expired));
        assert!(t.open_gaps().is_empty());
    }

    #[test]
    fn test_gap_not_expired_while_young() {
        let mut t = GapTracker::new(
            "sales",
            GapBudget {
                max_rescans: 1,
                expire_after: Duration::from_secs(3600),
                max_retries: 2,
            },
        );
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(3, now);
        t.record_rescan(&[(2, 3)]);
        t.record_rescan(&[(2, 3)]);
        assert!(t.expire_due(now).is_empty());
    }

    #[test]
    fn test_overdue_gap_can_still_fill() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(3, now);
        assert!(t.mark_overdue(2));
        let obs = t.record_observed(2, now);
        assert!(matches!(obs, Observation::GapFilled { closed: true, .. }));
        assert!(t.close_overdue(&[(2, 3)], now).is_empty());
    }

    #[test]
    fn test_rescan_ignores_gaps_outside_ranges() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(3, now); // [2,3)
        t.record_observed(6, now); // [4,6)
        t.record_rescan(&[(2, 3)]);
        let rescans: Vec<_> = t.open_gaps().iter().map(|g| g.rescans).collect();
        assert_eq!(rescans, vec![1, 0]);
    }

    #[test]
    fn test_close_overdue_requires_final_rescan() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(3, now); // [2,3)
        assert!(t.mark_overdue(2));
        assert!(t.close_overdue(&[], now).is_empty());
        assert_eq!(t.close_overdue(&[(2, 3)], now).len(), 1);
    }

    #[test]
    fn test_expire_due_marks_every_due_gap() {
        let mut t = tracker();
        let now = Utc::now();
        for id in [1, 3, 5] {
            t.record_observed(id, now);
        }
        let ranges = vec![(2, 3), (4, 5)];
        t.record_rescan(&ranges);
        t.record_rescan(&ranges);

        let overdue = t.expire_due(now);
        let starts: Vec<_> = overdue.iter().map(|g| g.start_id).collect();
        assert_eq!(starts, vec![2, 4]);
        assert!(overdue.iter().all(|g| g.status == GapStatus::Overdue));
        assert!(t.expire_due(now).is_empty());
    }

    #[test]
    fn test_requeue_reopens_read_id() {
        let mut t = tracker();
        let now = Utc::now();
        for id in 1..=4 {
            t.record_observed(id, now);
        }
        assert_eq!(t.requeue(2, now), Requeue::Queued);
        assert_eq!(t.requeue(2, now), Requeue::Ignored);
        assert_eq!(t.requeue(9, now), Requeue::Ignored);
        let ranges: Vec<_> = t.open_gaps().iter().map(|g| (g.start_id, g.end_id)).collect();
        assert_eq!(ranges, vec![(2, 3)]);
        assert_eq!(t.open_gaps()[0].kind, GapKind::Retry);
        assert_eq!(t.retry_ids(), vec![2]);
        assert!(t.check_invariants().is_ok());

        // Reading it again fills the gap; requeueing again keeps one record.
        t.record_observed(2, now);
        assert_eq!(t.requeue(2, now), Requeue::Queued);
        assert!(t.closed_gaps().is_empty());
        assert_eq!(t.open_gaps().len(), 1);
        assert_eq!(t.open_gaps()[0].rescans, 1);
    }

    #[test]
    fn test_requeue_abandons_after_max_retries() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        assert_eq!(t.requeue(1, now), Requeue::Queued);

        // Two failed retries exhaust the budget of two.
        t.record_observed(1, now);
        assert_eq!(t.requeue(1, now), Requeue::Queued);
        t.record_observed(1, now);
        let Requeue::Abandoned(gap) = t.requeue(1, now) else {
            panic!("expected the row to be abandoned");
        };
        assert_eq!(gap.status, GapStatus::Closed(GapResolution::Abandoned));
        assert_eq!(gap.kind, GapKind::Retry);
        assert!(t.open_gaps().is_empty());
        assert_eq!(t.closed_gaps().len(), 1);
    }

    #[test]
    fn test_retry_gaps_never_expire() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(1, now);
        t.record_observed(2, now);
        t.requeue(2, now);
        t.record_rescan(&[(2, 3)]);
        t.record_rescan(&[(2, 3)]);
        t.record_rescan(&[(2, 3)]);
        assert_eq!(t.open_gaps()[0].rescans, 0);
        assert!(t.expire_due(now).is_empty());
    }

    #[test]
    fn test_filled_capture_gap_requeued_as_retry() {
        let mut t = tracker();
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        let now = Utc::now();
        t.record_observed(1, earlier);
        t.record_observed(3, earlier); // [2,3)
        t.record_rescan(&[(2, 3)]);
        t.record_observed(2, now);
        assert_eq!(t.requeue(2, now), Requeue::Queued);

        let gap = t.open_gaps()[0].clone();
        assert_eq!(gap.kind, GapKind::Retry);
        assert_eq!(gap.rescans, 0);
        assert_eq!(gap.created_at, earlier);
    }

    #[test]
    fn test_mark_overdue_unknown_gap() {
        let mut t = tracker();
        assert!(!t.mark_overdue(99));
    }

    #[test]
    fn test_restore_splits_open_and_closed() {
        let now = Utc::now();
        let open = DataGap::new("sales", 3, 4, now);
        let mut closed = DataGap::new("sales", 7, 8, now);
        closed.status = GapStatus::Closed(GapResolution::Expired);
        closed.closed_at = Some(now);

        let t = GapTracker::restore("sales", 10, vec![open, closed], budget(2));
        assert_eq!(t.floor(), 10);
        assert_eq!(t.open_gaps().len(), 1);
        assert_eq!(t.closed_gaps().len(), 1);
        assert_eq!(t.all_gaps().len(), 2);
    }

    #[test]
    fn test_prune_closed() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_observed(2, now);
        t.close_gap(1, GapResolution::Expired, now - chrono::Duration::hours(2));
        assert_eq!(t.prune_closed(now, Duration::from_secs(3600)), 1);
        assert!(t.closed_gaps().is_empty());
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            GapStatus::Open,
            GapStatus::Overdue,
            GapStatus::Closed(GapResolution::Filled),
            GapStatus::Closed(GapResolution::Expired),
            GapStatus::Closed(GapResolution::Abandoned),
        ] {
            assert_eq!(GapStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(GapStatus::from_code("??"), None);
        assert_eq!(GapKind::parse("retry"), Some(GapKind::Retry));
        assert_eq!(GapKind::parse("other"), None);
    }

    #[test]
    fn test_oldest_gap_age() {
        let mut t = tracker();
        let then = Utc::now() - chrono::Duration::seconds(30);
        t.record_observed(3, then);
        let age = t.oldest_gap_age(Utc::now()).unwrap();
        assert!(age >= Duration::from_secs(29));
    }
}
