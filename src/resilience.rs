// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: failure backoff and bulkheads.
//!
//! - [`RetryConfig`]: exponential backoff for channels whose passes keep failing
//! - [`Bulkhead`]: semaphore limiting how many channel passes run at once
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), change_router::resilience::BulkheadFull> {
//! use change_router::resilience::Bulkhead;
//!
//! // At most 4 channel passes in flight
//! let bulkhead = Bulkhead::new(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff applied to a channel after consecutive failed passes.
///
/// A channel whose change log or store keeps failing is skipped by the
/// background loop until its backoff elapses, so it cannot monopolize pass
/// slots. Forced passes ignore the backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each failure).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent channel passes.
///
/// Channels are independent, but each pass holds a store connection and
/// reads the change log; the bulkhead caps how many do so at once.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit (at least 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
