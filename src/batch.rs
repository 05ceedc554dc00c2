// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch assembly.
//!
//! Routed rows are grouped into batches per `(node, channel)`, the unit the
//! transmission layer sends and acknowledges.
//!
//! # Design
//!
//! ```text
//! routed row ──▶ BatchAssembler ──┬──▶ lane (node, incremental) ──▶ [10, 11, 12]  → READY
//!  (node set)                     │                              └▶ [13]          open
//!                                 └──▶ lane (node, initial load)
//! ```
//!
//! Each `(node, initial_load)` pair may have up to `concurrency` open lanes.
//! A row goes to the open lane with the highest last id still below the row's
//! id, so ids are strictly increasing inside every batch. Rows that arrive
//! late (gap rescans) land in a fresh lane; with a single lane that means the
//! current batch closes first and the late row starts the next batch.
//!
//! Batch ids come from a per-node sequence shared by all channels, allocated
//! at creation and never reused.

use crate::config::ChannelConfig;
use crate::model::ChangeRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// When a batch closes relative to transaction boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAlgorithm {
    /// Close at max size, but only on a transaction boundary.
    #[default]
    Default,
    /// Close exactly at max size.
    NonTransactional,
    /// One transaction per batch.
    Transactional,
}

impl BatchAlgorithm {
    pub const ALL: [BatchAlgorithm; 3] = [
        BatchAlgorithm::Default,
        BatchAlgorithm::NonTransactional,
        BatchAlgorithm::Transactional,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::NonTransactional => "nontransactional",
            Self::Transactional => "transactional",
        }
    }
}

impl fmt::Display for BatchAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Batch lifecycle.
///
/// ```text
/// NEW ──▶ ROUTING ──▶ READY ──▶ OK
///                       │ ▲
///                       ▼ │ republish
///                     ERROR          IGNORED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Open, persisted between passes.
    New,
    /// Open, being appended to by the running pass.
    Routing,
    /// Closed and handed to the transmission layer.
    Ready,
    /// Delivery acknowledged.
    Ok,
    /// Delivery failed or acknowledgment timed out. Eligible for retransmission.
    Error,
    /// Target chose to skip the batch.
    Ignored,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            Self::New => "NE",
            Self::Routing => "RT",
            Self::Ready => "RQ",
            Self::Ok => "OK",
            Self::Error => "ER",
            Self::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NE" => Some(Self::New),
            "RT" => Some(Self::Routing),
            "RQ" => Some(Self::Ready),
            "OK" => Some(Self::Ok),
            "ER" => Some(Self::Error),
            "IG" => Some(Self::Ignored),
            _ => None,
        }
    }

    /// Still accepting rows.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::Routing)
    }

    /// No further transitions expected.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Ok | Self::Ignored)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Routing => "ROUTING",
            Self::Ready => "READY",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Ignored => "IGNORED",
        };
        write!(f, "{}", name)
    }
}

/// Why a batch closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Reached the channel's max batch size.
    Full,
    /// Older than the channel's max batch age.
    Aged,
    /// The next row belongs to a different transaction.
    TransactionBoundary,
    /// A late row needed a lane and this one was the oldest.
    LaneRotated,
    /// End of pass force-flush or shutdown.
    Forced,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Aged => "aged",
            Self::TransactionBoundary => "transaction_boundary",
            Self::LaneRotated => "lane_rotated",
            Self::Forced => "forced",
        }
    }
}

/// Ordered rows for one node on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: u64,
    pub node_id: String,
    pub channel_id: String,
    /// Bulk reload traffic, kept apart from incremental batches.
    pub initial_load: bool,
    pub status: BatchStatus,
    pub rows: Vec<ChangeRow>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    /// Last time the batch was handed to the sink.
    pub published_at: Option<DateTime<Utc>>,
    /// Times the batch was marked ERROR.
    pub error_count: u32,
}

impl Batch {
    pub fn new(
        batch_id: u64,
        node_id: &str,
        channel_id: &str,
        initial_load: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            initial_load,
            status: BatchStatus::New,
            rows: Vec::new(),
            created_at: now,
            closed_at: None,
            close_reason: None,
            published_at: None,
            error_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_id(&self) -> Option<u64> {
        self.rows.first().map(|r| r.id)
    }

    pub fn last_id(&self) -> Option<u64> {
        self.rows.last().map(|r| r.id)
    }

    pub fn data_ids(&self) -> Vec<u64> {
        self.rows.iter().map(|r| r.id).collect()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn last_transaction(&self) -> Option<&str> {
        self.rows.last().and_then(|r| r.transaction_id.as_deref())
    }

    /// True if `row` continues the transaction of the last row in the batch.
    fn continues_transaction(&self, row: &ChangeRow) -> bool {
        match (self.last_transaction(), row.transaction_id.as_deref()) {
            (Some(current), Some(next)) => current == next,
            _ => false,
        }
    }

    /// Ids strictly increasing.
    pub fn is_ordered(&self) -> bool {
        self.rows.windows(2).all(|pair| pair[0].id < pair[1].id)
    }

    fn close(&mut self, reason: CloseReason, now: DateTime<Utc>) {
        self.status = BatchStatus::Ready;
        self.closed_at = Some(now);
        self.close_reason = Some(reason);
    }
}

/// Per-node batch id sequence, shared across channels.
#[derive(Debug, Default)]
pub struct BatchIdAllocator {
    next: Mutex<HashMap<String, u64>>,
}

impl BatchIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted high-water marks (`node -> last allocated id`).
    pub fn seeded(last_ids: impl IntoIterator<Item = (String, u64)>) -> Self {
        let next = last_ids
            .into_iter()
            .map(|(node, last)| (node, last.saturating_add(1)))
            .collect();
        Self {
            next: Mutex::new(next),
        }
    }

    /// Allocate the next id for a node. Ids start at 1.
    pub fn allocate(&self, node_id: &str) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let slot = next.entry(node_id.to_string()).or_insert(1);
        let id = *slot;
        *slot += 1;
        id
    }

    /// Make sure future ids for `node_id` are above `batch_id`.
    pub fn observe(&self, node_id: &str, batch_id: u64) {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let slot = next.entry(node_id.to_string()).or_insert(1);
        if *slot <= batch_id {
            *slot = batch_id + 1;
        }
    }

    /// Last allocated id per node.
    pub fn high_water_marks(&self) -> Vec<(String, u64)> {
        let next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        next.iter()
            .map(|(node, next)| (node.clone(), next.saturating_sub(1)))
            .collect()
    }
}

type LaneKey = (String, bool);

/// Appends routed rows to per-node batches for one channel.
pub struct BatchAssembler {
    channel_id: String,
    max_batch_size: usize,
    max_batch_age: Duration,
    concurrency: usize,
    algorithm: BatchAlgorithm,
    /// Open batches per lane key, oldest first.
    lanes: BTreeMap<LaneKey, Vec<Batch>>,
    ids: Arc<BatchIdAllocator>,
}

impl BatchAssembler {
    pub fn new(channel: &ChannelConfig, ids: Arc<BatchIdAllocator>) -> Self {
        Self {
            channel_id: channel.channel_id.clone(),
            max_batch_size: channel.max_batch_size.max(1),
            max_batch_age: channel.max_batch_age_duration(),
            concurrency: channel.concurrency.max(1),
            algorithm: channel.batch_algorithm,
            lanes: BTreeMap::new(),
            ids,
        }
    }

    /// Rebuild with open batches loaded from the store.
    pub fn restore(
        channel: &ChannelConfig,
        ids: Arc<BatchIdAllocator>,
        open: impl IntoIterator<Item = Batch>,
    ) -> Self {
        let mut assembler = Self::new(channel, ids);
        let mut open: Vec<Batch> = open.into_iter().filter(|b| !b.is_empty()).collect();
        open.sort_by_key(|b| b.batch_id);
        for mut batch in open {
            batch.status = BatchStatus::New;
            assembler.ids.observe(&batch.node_id, batch.batch_id);
            assembler
                .lanes
                .entry((batch.node_id.clone(), batch.initial_load))
                .or_default()
                .push(batch);
        }
        assembler
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn algorithm(&self) -> BatchAlgorithm {
        self.algorithm
    }

    /// Mark every open batch ROUTING for the duration of a pass.
    pub fn begin_pass(&mut self) {
        for batch in self.lanes.values_mut().flatten() {
            batch.status = BatchStatus::Routing;
        }
    }

    /// Return open batches to NEW once the pass is done appending.
    pub fn end_pass(&mut self) {
        for batch in self.lanes.values_mut().flatten() {
            batch.status = BatchStatus::New;
        }
    }

    /// Open batches, for persistence between passes.
    pub fn open_batches(&self) -> impl Iterator<Item = &Batch> {
        self.lanes.values().flatten()
    }

    pub fn open_count(&self) -> usize {
        self.lanes.values().map(Vec::len).sum()
    }

    fn is_full(&self, batch: &Batch) -> bool {
        batch.len() >= self.max_batch_size
    }

    /// Whether `batch` may take `row` under the channel's algorithm.
    fn accepts(&self, batch: &Batch, row: &ChangeRow) -> bool {
        if batch.last_id().map(|last| last >= row.id).unwrap_or(false) {
            return false;
        }
        match self.algorithm {
            BatchAlgorithm::NonTransactional => !self.is_full(batch),
            BatchAlgorithm::Default => !self.is_full(batch) || batch.continues_transaction(row),
            BatchAlgorithm::Transactional => batch.is_empty() || batch.continues_transaction(row),
        }
    }

    /// Why a lane that rejected `row` should close.
    fn rejection_reason(&self, batch: &Batch, row: &ChangeRow) -> CloseReason {
        if batch.last_id().map(|last| last >= row.id).unwrap_or(false) {
            CloseReason::LaneRotated
        } else if self.algorithm == BatchAlgorithm::Transactional {
            CloseReason::TransactionBoundary
        } else if self.is_full(batch) {
            CloseReason::Full
        } else {
            CloseReason::LaneRotated
        }
    }

    /// Append a routed row to `node`'s open batch, opening or closing batches
    /// as needed. Returns the batches that closed as a result.
    pub fn append(
        &mut self,
        node_id: &str,
        row: &ChangeRow,
        initial_load: bool,
        now: DateTime<Utc>,
    ) -> Vec<Batch> {
        let key = (node_id.to_string(), initial_load);
        let mut lanes = self.lanes.remove(&key).unwrap_or_default();
        let mut closed = Vec::new();

        let target = lanes
            .iter()
            .enumerate()
            .filter(|(_, batch)| self.accepts(batch, row))
            .max_by_key(|(_, batch)| batch.last_id().unwrap_or(0))
            .map(|(index, _)| index);

        let index = match target {
            Some(index) => index,
            None => {
                // Full lanes that cannot continue are done regardless.
                let mut index = 0;
                while index < lanes.len() {
                    let batch = &lanes[index];
                    if self.is_full(batch) && !self.accepts(batch, row) {
                        let reason = self.rejection_reason(batch, row);
                        let mut batch = lanes.remove(index);
                        batch.close(reason, now);
                        closed.push(batch);
                    } else {
                        index += 1;
                    }
                }

                if lanes.len() >= self.concurrency {
                    let reason = self.rejection_reason(&lanes[0], row);
                    let mut oldest = lanes.remove(0);
                    oldest.close(reason, now);
                    closed.push(oldest);
                }

                let batch_id = self.ids.allocate(node_id);
                let mut batch = Batch::new(batch_id, node_id, &self.channel_id, initial_load, now);
                batch.status = BatchStatus::Routing;
                debug!(
                    channel_id = %self.channel_id,
                    node_id = %node_id,
                    batch_id,
                    initial_load,
                    "Opened batch"
                );
                lanes.push(batch);
                lanes.len() - 1
            }
        };

        lanes[index].rows.push(row.clone());

        if self.algorithm == BatchAlgorithm::NonTransactional && self.is_full(&lanes[index]) {
            let mut batch = lanes.remove(index);
            batch.close(CloseReason::Full, now);
            closed.push(batch);
        }

        if !lanes.is_empty() {
            self.lanes.insert(key, lanes);
        }
        closed
    }

    /// Close `node`'s batches that are full or older than the max batch age.
    pub fn close_if_due(&mut self, node_id: &str, now: DateTime<Utc>) -> Vec<Batch> {
        let keys: Vec<LaneKey> = self
            .lanes
            .keys()
            .filter(|(node, _)| node == node_id)
            .cloned()
            .collect();
        keys.iter()
            .flat_map(|key| self.close_lane_if_due(key, now))
            .collect()
    }

    /// [`close_if_due`](Self::close_if_due) for every node on the channel.
    pub fn close_all_due(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let keys: Vec<LaneKey> = self.lanes.keys().cloned().collect();
        keys.iter()
            .flat_map(|key| self.close_lane_if_due(key, now))
            .collect()
    }

    fn close_lane_if_due(&mut self, key: &LaneKey, now: DateTime<Utc>) -> Vec<Batch> {
        let Some(lanes) = self.lanes.remove(key) else {
            return Vec::new();
        };
        let mut closed = Vec::new();
        let mut open = Vec::with_capacity(lanes.len());
        for mut batch in lanes {
            let reason = if self.is_full(&batch) {
                Some(CloseReason::Full)
            } else if batch.age(now) >= self.max_batch_age {
                Some(CloseReason::Aged)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    batch.close(reason, now);
                    closed.push(batch);
                }
                None => open.push(batch),
            }
        }
        if !open.is_empty() {
            self.lanes.insert(key.clone(), open);
        }
        closed
    }

    /// Close every open batch on the channel.
    pub fn force_close_all(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let lanes = std::mem::take(&mut self.lanes);
        let mut closed: Vec<Batch> = lanes
            .into_values()
            .flatten()
            .map(|mut batch| {
                batch.close(CloseReason::Forced, now);
                batch
            })
            .collect();
        closed.sort_by(|a, b| (&a.node_id, a.batch_id).cmp(&(&b.node_id, b.batch_id)));
        closed
    }
}
