// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log access.
//!
//! The capture layer appends [`ChangeRow`]s keyed by a monotonic id. The
//! router only needs to read them by id range, know the highest id written,
//! and resolve auxiliary lookup tables for the lookup-table policy.
//!
//! # Example
//!
//! ```rust,no_run
//! use change_router::source::{BoxFuture, ChangeLogSource};
//! use change_router::ChangeRow;
//!
//! struct MyLog { /* ... */ }
//!
//! impl ChangeLogSource for MyLog {
//!     fn read_range(&self, _start: u64, _end: u64, _limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn max_id(&self) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!
//!     fn count_after(&self, _channel_id: &str, _after_id: u64) -> BoxFuture<'_, u64> {
//!         Box::pin(async move { Ok(0) })
//!     }
//!
//!     fn lookup(&self, _table: &str, _key: &str, _value: &str) -> BoxFuture<'_, Vec<(String, String)>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//! }
//! ```

use crate::error::{Result, RouterError};
use crate::model::{ChangeRow, RowImage};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Read access to the change log.
///
/// Errors returned here are systemic: the channel pass that hit them is
/// abandoned and nothing it did is committed.
pub trait ChangeLogSource: Send + Sync + 'static {
    /// Rows with `start_id <= id < end_id`, ascending, at most `limit`.
    ///
    /// Returns rows for every channel; ids are one shared sequence.
    fn read_range(&self, start_id: u64, end_id: u64, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>>;

    /// Highest id written so far.
    fn max_id(&self) -> BoxFuture<'_, u64>;

    /// Rows on `channel_id` with an id above `after_id`.
    fn count_after(&self, channel_id: &str, after_id: u64) -> BoxFuture<'_, u64>;

    /// `(key, value)` pairs from an auxiliary mapping table.
    fn lookup(&self, table: &str, key_column: &str, value_column: &str)
        -> BoxFuture<'_, Vec<(String, String)>>;
}

/// In-process change log.
///
/// Rows may be inserted in any id order, which is how commit skew between
/// concurrent transactions looks to a reader.
#[derive(Default)]
pub struct MemoryChangeLog {
    rows: RwLock<BTreeMap<u64, ChangeRow>>,
    tables: RwLock<HashMap<String, Vec<RowImage>>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a row visible. Replaces any row with the same id.
    pub fn insert(&self, row: ChangeRow) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.insert(row.id, row);
    }

    pub fn insert_all(&self, rows: impl IntoIterator<Item = ChangeRow>) {
        let mut guard = self.rows.write().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            guard.insert(row.id, row);
        }
    }

    /// Add a row to an auxiliary lookup table.
    pub fn insert_lookup_row(&self, table: &str, image: RowImage) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_ascii_lowercase())
            .or_default()
            .push(image);
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeLogSource for MemoryChangeLog {
    fn read_range(&self, start_id: u64, end_id: u64, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
        let result = self
            .rows
            .read()
            .map(|rows| {
                rows.range(start_id..end_id.max(start_id))
                    .take(limit)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .map_err(|e| RouterError::change_log("read_range", e.to_string()));
        Box::pin(async move { result })
    }

    fn max_id(&self) -> BoxFuture<'_, u64> {
        let result = self
            .rows
            .read()
            .map(|rows| rows.keys().next_back().copied().unwrap_or(0))
            .map_err(|e| RouterError::change_log("max_id", e.to_string()));
        Box::pin(async move { result })
    }

    fn count_after(&self, channel_id: &str, after_id: u64) -> BoxFuture<'_, u64> {
        let result = self
            .rows
            .read()
            .map(|rows| {
                rows.range(after_id.saturating_add(1)..)
                    .filter(|(_, row)| row.channel_id == channel_id)
                    .count() as u64
            })
            .map_err(|e| RouterError::change_log("count_after", e.to_string()));
        Box::pin(async move { result })
    }

    fn lookup(
        &self,
        table: &str,
        key_column: &str,
        value_column: &str,
    ) -> BoxFuture<'_, Vec<(String, String)>> {
        let result = self
            .tables
            .read()
            .map_err(|e| RouterError::change_log("lookup", e.to_string()))
            .and_then(|tables| {
                let rows = tables.get(&table.to_ascii_lowercase()).ok_or_else(|| {
                    RouterError::change_log("lookup", format!("no such table '{}'", table))
                })?;
                Ok(rows
                    .iter()
                    .filter_map(|image| {
                        let key = image.get(key_column).flatten()?;
                        let value = image.get(value_column).flatten()?;
                        Some((key.to_string(), value.to_string()))
                    })
                    .collect())
            });
        Box::pin(async move { result })
    }
}
