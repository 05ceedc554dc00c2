// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock change log and sink.
//!
//! `FlakySource` wraps a [`MemoryChangeLog`] and can be told to fail or slow
//! down reads. `RecordingSink` keeps every published batch and can refuse or
//! defer them.

use change_router::error::RouterError;
use change_router::sink::{BatchSink, BoxFuture};
use change_router::source::ChangeLogSource;
use change_router::{Batch, ChangeRow, MemoryChangeLog};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Change log that fails or stalls on demand.
pub struct FlakySource {
    log: MemoryChangeLog,
    fail_reads: AtomicBool,
    fail_after: AtomicUsize,
    read_delay_ms: AtomicU64,
    reads: AtomicUsize,
}

impl Default for FlakySource {
    fn default() -> Self {
        Self {
            log: MemoryChangeLog::new(),
            fail_reads: AtomicBool::new(false),
            fail_after: AtomicUsize::new(usize::MAX),
            read_delay_ms: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
        }
    }
}

impl FlakySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: ChangeRow) {
        self.log.insert(row);
    }

    pub fn insert_all(&self, rows: impl IntoIterator<Item = ChangeRow>) {
        self.log.insert_all(rows);
    }

    /// Make every `read_range` call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    /// Let `reads` more `read_range` calls succeed, then fail every call.
    pub fn fail_after(&self, reads: usize) {
        let start = self.reads.load(Ordering::SeqCst);
        self.fail_after.store(start.saturating_add(reads), Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_after.store(usize::MAX, Ordering::SeqCst);
    }

    /// Sleep this long inside every `read_range` call.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ChangeLogSource for FlakySource {
    fn read_range(&self, start_id: u64, end_id: u64, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
        let call = self.reads.fetch_add(1, Ordering::SeqCst);
        let failing =
            self.fail_reads.load(Ordering::SeqCst) || call >= self.fail_after.load(Ordering::SeqCst);
        let delay = Duration::from_millis(self.read_delay_ms.load(Ordering::SeqCst));
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if failing {
                return Err(RouterError::change_log("read_range", "connection reset"));
            }
            self.log.read_range(start_id, end_id, limit).await
        })
    }

    fn max_id(&self) -> BoxFuture<'_, u64> {
        self.log.max_id()
    }

    fn count_after(&self, channel_id: &str, after_id: u64) -> BoxFuture<'_, u64> {
        self.log.count_after(channel_id, after_id)
    }

    fn lookup(&self, table: &str, key_column: &str, value_column: &str) -> BoxFuture<'_, Vec<(String, String)>> {
        self.log.lookup(table, key_column, value_column)
    }
}

/// Sink that records everything it accepts.
pub struct RecordingSink {
    batches: Mutex<Vec<Batch>>,
    accepting: AtomicBool,
    refuse: AtomicBool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backpressure: report not accepting.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Accept the call but fail every publish.
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn published_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl BatchSink for RecordingSink {
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn publish(&self, batch: Batch) -> BoxFuture<'_, ()> {
        let result = if self.refuse.load(Ordering::SeqCst) {
            Err(RouterError::Sink(format!("refused batch {}", batch.batch_id)))
        } else {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        };
        Box::pin(async move { result })
    }
}
