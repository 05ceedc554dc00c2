// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Publishing and acknowledgment handling.
//!
//! Acknowledgments arrive on an unbounded channel so the transmission layer
//! never blocks on the router. They are applied by the background task when
//! the service is running, and drained at the start of every forced pass.
//!
//! The sweep enforces at-least-once delivery:
//!
//! 1. Published batches with no acknowledgment after `ack.timeout` are
//!    marked ERROR.
//! 2. READY batches never handed to the sink, and ERROR batches, are
//!    republished.

use super::Inner;
use crate::batch::{Batch, BatchStatus};
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::sink::{AckEvent, AckOutcome};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Cloneable handle the transmission layer uses to report batch outcomes.
#[derive(Debug, Clone)]
pub struct AckHandle {
    tx: mpsc::UnboundedSender<AckEvent>,
}

impl AckHandle {
    pub(super) fn new(tx: mpsc::UnboundedSender<AckEvent>) -> Self {
        Self { tx }
    }

    /// Report the outcome for one batch.
    ///
    /// Fails with [`RouterError::Stopped`] once the router has shut down.
    pub fn acknowledge(&self, node_id: &str, batch_id: u64, outcome: AckOutcome) -> Result<()> {
        self.tx
            .send(AckEvent::new(node_id, batch_id, outcome))
            .map_err(|_| RouterError::Stopped)
    }
}

/// Hand batches to the sink and stamp the ones it took.
///
/// Returns how many were published. Batches the sink refuses stay
/// unpublished and are retried by the next sweep.
pub(super) async fn publish(inner: &Inner, batches: Vec<Batch>, republish: bool) -> usize {
    if batches.is_empty() {
        return 0;
    }
    if !inner.sink.is_accepting() {
        debug!(batches = batches.len(), "Sink not accepting, deferring publish");
        return 0;
    }

    let mut published = Vec::with_capacity(batches.len());
    for batch in batches {
        let key = (batch.node_id.clone(), batch.batch_id);
        match inner.sink.publish(batch).await {
            Ok(()) => published.push(key),
            Err(e) => {
                metrics::record_sink_error();
                warn!(node_id = %key.0, batch_id = key.1, error = %e, "Sink refused batch, will retry");
            }
        }
    }

    if let Err(e) = inner.store.mark_published(&published, Utc::now()).await {
        // Unstamped batches get published again by the sweep.
        warn!(error = %e, "Failed to record published batches");
    }
    metrics::record_batches_published(published.len(), republish);
    published.len()
}

/// Apply one acknowledgment to the store.
pub(super) async fn apply(inner: &Inner, event: &AckEvent) -> Result<()> {
    let updated = inner
        .store
        .update_batch_status(&event.node_id, event.batch_id, event.outcome.status())
        .await?;
    metrics::record_ack(event.outcome.as_str());

    if !updated {
        return Err(RouterError::UnknownBatch {
            node_id: event.node_id.clone(),
            batch_id: event.batch_id,
        });
    }

    if event.outcome == AckOutcome::Error {
        warn!(node_id = %event.node_id, batch_id = event.batch_id, "Batch failed on target, will republish");
    } else {
        debug!(
            node_id = %event.node_id,
            batch_id = event.batch_id,
            outcome = %event.outcome,
            "Batch acknowledged"
        );
    }
    Ok(())
}

fn log_failed(event: &AckEvent, error: &RouterError) {
    warn!(
        node_id = %event.node_id,
        batch_id = event.batch_id,
        outcome = %event.outcome,
        error = %error,
        "Acknowledgment not applied"
    );
}

/// Apply every queued acknowledgment without waiting.
///
/// A no-op while the background task holds the receiver.
pub(super) async fn drain(inner: &Inner) -> usize {
    let Ok(mut rx) = inner.ack_rx.try_lock() else {
        return 0;
    };
    let mut applied = 0;
    while let Ok(event) = rx.try_recv() {
        match apply(inner, &event).await {
            Ok(()) => applied += 1,
            Err(e) => log_failed(&event, &e),
        }
    }
    applied
}

/// Background acknowledgment task. Holds the receiver until shutdown.
pub(super) async fn run_ack_loop(inner: &Inner, mut shutdown_rx: watch::Receiver<bool>) {
    let mut rx = inner.ack_rx.lock().await;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = apply(inner, &event).await {
                    log_failed(&event, &e);
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Acknowledgment task exiting");
}

/// Time out stale publications and republish what is due.
///
/// Returns the number of batches handed to the sink.
pub(super) async fn sweep(inner: &Inner) -> Result<usize> {
    let now = Utc::now();
    let timeout = inner.config.settings.ack.timeout_duration();
    let stale_before = now - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

    let overdue = inner.store.unacknowledged_before(stale_before).await?;
    for (node_id, batch_id) in &overdue {
        inner
            .store
            .update_batch_status(node_id, *batch_id, BatchStatus::Error)
            .await?;
    }
    if !overdue.is_empty() {
        metrics::record_ack_timeouts(overdue.len());
        warn!(
            batches = overdue.len(),
            timeout_secs = timeout.as_secs(),
            "Batches not acknowledged in time, marked ERROR"
        );
    }

    let due = inner.store.batches_to_publish(stale_before).await?;
    if due.is_empty() {
        return Ok(0);
    }
    let retransmits = due
        .iter()
        .filter(|b| b.published_at.is_some() || b.error_count > 0)
        .count();
    let published = publish(inner, due, retransmits > 0).await;
    if published > 0 {
        info!(published, retransmits, "Republished pending batches");
    }
    Ok(published)
}
