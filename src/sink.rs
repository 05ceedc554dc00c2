// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transmission boundary.
//!
//! READY batches leave the router through a [`BatchSink`]. The sink owns
//! serialization and delivery; it reports back asynchronously through an
//! [`AckHandle`](crate::router::AckHandle) with an [`AckOutcome`].
//!
//! # Example
//!
//! ```rust,no_run
//! use change_router::sink::{BatchSink, BoxFuture};
//! use change_router::batch::Batch;
//!
//! struct LogSink;
//!
//! impl BatchSink for LogSink {
//!     fn publish(&self, batch: Batch) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             println!("batch {} for {} ({} rows)", batch.batch_id, batch.node_id, batch.len());
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::batch::{Batch, BatchStatus};
use crate::error::RouterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

pub use crate::source::BoxFuture;

/// Hands READY batches to the transmission layer.
///
/// `publish` may be called again for a batch that was already published
/// (retransmission after an error or acknowledgment timeout). The content is
/// identical each time.
pub trait BatchSink: Send + Sync + 'static {
    /// Whether the sink can take batches right now (backpressure check).
    ///
    /// When this returns `false` publishing is deferred; the batches stay
    /// READY and unpublished and are picked up by the next sweep.
    fn is_accepting(&self) -> bool {
        true
    }

    /// Hand one batch to the transmission layer.
    fn publish(&self, batch: Batch) -> BoxFuture<'_, ()>;
}

/// Discards batches. Acknowledgments never arrive, so batches stay READY.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl BatchSink for NoOpSink {
    fn publish(&self, _batch: Batch) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Forwards batches into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Batch>,
}

impl ChannelSink {
    /// A sink plus the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BatchSink for ChannelSink {
    fn is_accepting(&self) -> bool {
        !self.tx.is_closed()
    }

    fn publish(&self, batch: Batch) -> BoxFuture<'_, ()> {
        let result = self
            .tx
            .send(batch)
            .map_err(|e| RouterError::Sink(format!("receiver dropped batch {}", e.0.batch_id)));
        Box::pin(async move { result })
    }
}

/// Delivery result reported by the transmission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    /// Applied durably on the target.
    Ok,
    /// Delivery or apply failed; retransmit.
    Error,
    /// The target chose to skip the batch.
    Ignored,
}

impl AckOutcome {
    /// Batch status this outcome moves a batch to.
    pub fn status(&self) -> BatchStatus {
        match self {
            Self::Ok => BatchStatus::Ok,
            Self::Error => BatchStatus::Error,
            Self::Ignored => BatchStatus::Ignored,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound acknowledgment for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEvent {
    pub node_id: String,
    pub batch_id: u64,
    pub outcome: AckOutcome,
}

impl AckEvent {
    pub fn new(node_id: impl Into<String>, batch_id: u64, outcome: AckOutcome) -> Self {
        Self {
            node_id: node_id.into(),
            batch_id,
            outcome,
        }
    }
}
