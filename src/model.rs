// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Captured change rows and routing decisions.
//!
//! A [`ChangeRow`] is one mutation written to the change log by the capture
//! triggers. Rows are immutable once the scanner can see them; the router
//! only ever reads them and records which batches they were placed in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    CreateTable,
    /// Bulk reload traffic for an initial load.
    Reload,
}

impl EventKind {
    /// Single-letter code used in the change log tables.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::CreateTable => "C",
            Self::Reload => "R",
        }
    }

    /// Parse a single-letter change log code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            "C" => Some(Self::CreateTable),
            "R" => Some(Self::Reload),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::CreateTable => "CREATE_TABLE",
            Self::Reload => "RELOAD",
        };
        write!(f, "{}", name)
    }
}

/// A captured table plus the trigger configuration version that captured it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentity {
    pub table_name: String,
    /// Trigger history version. Bumps whenever the capture trigger changes.
    pub trigger_version: u32,
}

impl TableIdentity {
    pub fn new(table_name: impl Into<String>, trigger_version: u32) -> Self {
        Self {
            table_name: table_name.into(),
            trigger_version,
        }
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.table_name, self.trigger_version)
    }
}

/// Ordered column-name to value mapping. `None` is SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowImage(pub Vec<(String, Option<String>)>);

impl RowImage {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a column, keeping capture order.
    pub fn push(&mut self, column: impl Into<String>, value: Option<String>) {
        self.0.push((column.into(), value));
    }

    /// Look up a column value, ignoring case in the column name.
    ///
    /// Returns `None` if the column is absent, `Some(None)` if it is NULL.
    pub fn get(&self, column: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Monotonic id from the shared capture sequence.
    pub id: u64,
    pub table: TableIdentity,
    pub event: EventKind,
    pub channel_id: String,
    /// Node the change originated on. `None` for local captures.
    pub source_node_id: Option<String>,
    /// Source transaction, when the capture layer records it.
    pub transaction_id: Option<String>,
    /// New image (empty for DELETE).
    pub new_image: RowImage,
    /// Old image (UPDATE and DELETE only).
    pub old_image: Option<RowImage>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeRow {
    /// Create a row with empty images, committed now.
    pub fn new(
        id: u64,
        table: impl Into<String>,
        channel_id: impl Into<String>,
        event: EventKind,
    ) -> Self {
        Self {
            id,
            table: TableIdentity::new(table, 1),
            event,
            channel_id: channel_id.into(),
            source_node_id: None,
            transaction_id: None,
            new_image: RowImage::new(),
            old_image: None,
            committed_at: Utc::now(),
        }
    }

    /// Add a column to the new image.
    pub fn with_column(mut self, column: &str, value: &str) -> Self {
        self.new_image.push(column, Some(value.to_string()));
        self
    }

    /// Add a column to the old image.
    pub fn with_old_column(mut self, column: &str, value: &str) -> Self {
        self.old_image
            .get_or_insert_with(RowImage::new)
            .push(column, Some(value.to_string()));
        self
    }

    pub fn from_node(mut self, node_id: &str) -> Self {
        self.source_node_id = Some(node_id.to_string());
        self
    }

    pub fn in_transaction(mut self, transaction_id: &str) -> Self {
        self.transaction_id = Some(transaction_id.to_string());
        self
    }

    pub fn committed(mut self, at: DateTime<Utc>) -> Self {
        self.committed_at = at;
        self
    }

    /// The image routing decisions look at: old image for DELETE, new otherwise.
    pub fn routing_image(&self) -> &RowImage {
        match (self.event, &self.old_image) {
            (EventKind::Delete, Some(old)) => old,
            _ => &self.new_image,
        }
    }

    /// Reload rows belong to an initial load, never to incremental traffic.
    pub fn is_initial_load(&self) -> bool {
        self.event == EventKind::Reload
    }
}

/// Output of one policy evaluation for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Target node ids. Empty means "no subscriber, drop".
    pub targets: BTreeSet<String>,
    /// Distinguishes bulk reload traffic from incremental traffic.
    pub initial_load: bool,
}

impl RoutingDecision {
    /// Route to no one.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn to_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: nodes.into_iter().map(Into::into).collect(),
            initial_load: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
