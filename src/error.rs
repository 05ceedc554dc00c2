// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the change router.
//!
//! Errors are split by how far their blast radius reaches. A routing pass
//! is per channel, so the widest an error can ever reach is one channel's pass.
//!
//! # Error Categories
//!
//! | Error Type | Class | Effect |
//! |------------|-------|--------|
//! | `ChangeLog` | Systemic | Aborts the channel's pass, nothing committed |
//! | `Store` / `StoreMessage` | Systemic | Aborts the channel's pass, nothing committed |
//! | `Policy` | Transient | Row routed to no one this pass, retried next pass |
//! | `PolicyTimeout` | Transient | Same as `Policy` |
//! | `Config` | Fatal | Fix the configuration and restart |
//! | `UnknownPolicy` / `UnknownChannel` | Fatal | Configuration references something missing |
//! | `UnknownBatch` | Caller | Acknowledgment for a batch we never produced |
//! | `InvalidState` | Caller | State machine violation |
//! | `Sink` | Retryable | Transmission layer refused a batch, republished later |
//! | `Stopped` | - | The service is stopping |
//! | `Internal` | Bug | Unexpected internal error |
//!
//! A permanently unfillable gap is not an error: it closes with
//! [`GapResolution::Expired`](crate::gap::GapResolution::Expired) and is logged.

use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while routing.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The change log could not be read.
    ///
    /// Systemic: the current channel's pass is abandoned and will be
    /// re-run from the last committed batch boundary.
    #[error("Change log error ({operation}): {message}")]
    ChangeLog { operation: String, message: String },

    /// SQLite error in the routing store.
    ///
    /// Systemic: bookkeeping is unreachable, so the pass must not continue.
    #[error("Routing store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Routing store failure that did not originate in sqlx
    /// (row decode problems, corrupt persisted state).
    #[error("Routing store error: {0}")]
    StoreMessage(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A routing policy failed for one row.
    ///
    /// Transient: the row is routed to no one for this pass.
    #[error("Routing policy '{policy}' failed: {message}")]
    Policy { policy: String, message: String },

    /// A routing policy exceeded its evaluation budget.
    #[error("Routing policy '{policy}' exceeded its {budget_ms}ms budget")]
    PolicyTimeout { policy: String, budget_ms: u64 },

    /// A table route references a router that is not registered.
    #[error("Unknown routing policy: {0}")]
    UnknownPolicy(String),

    /// An operation referenced a channel that is not configured.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// An acknowledgment arrived for a batch that does not exist.
    #[error("Unknown batch {batch_id} for node {node_id}")]
    UnknownBatch { node_id: String, batch_id: u64 },

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The transmission layer refused a batch.
    #[error("Batch sink error: {0}")]
    Sink(String),

    /// The router is stopping.
    #[error("Router is stopping")]
    Stopped,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Create a change log error.
    pub fn change_log(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChangeLog {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a policy error.
    pub fn policy(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Policy {
            policy: policy.into(),
            message: message.into(),
        }
    }

    /// Systemic errors abort the current channel's pass.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Self::ChangeLog { .. } | Self::Store(_) | Self::StoreMessage(_)
        )
    }

    /// Transient errors drop one row for one pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Policy { .. } | Self::PolicyTimeout { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChangeLog { .. } => "change_log",
            Self::Store(_) | Self::StoreMessage(_) => "store",
            Self::Config(_) => "config",
            Self::Policy { .. } => "policy",
            Self::PolicyTimeout { .. } => "policy_timeout",
            Self::UnknownPolicy(_) => "unknown_policy",
            Self::UnknownChannel(_) => "unknown_channel",
            Self::UnknownBatch { .. } => "unknown_batch",
            Self::InvalidState { .. } => "invalid_state",
            Self::Sink(_) => "sink",
            Self::Stopped => "stopped",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_log_is_systemic() {
        let err = RouterError::change_log("read_range", "connection reset");
        assert!(err.is_systemic());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("read_range"));
    }

    #[test]
    fn test_store_is_systemic() {
        let err = RouterError::Store(sqlx::Error::PoolTimedOut);
        assert!(err.is_systemic());
        assert_eq!(err.kind(), "store");
    }

    #[test]
    fn test_store_message_is_systemic() {
        let err = RouterError::StoreMessage("bad status 'XX'".to_string());
        assert!(err.is_systemic());
    }

    #[test]
    fn test_policy_is_transient() {
        let err = RouterError::policy("store_router", "column STORE_ID missing");
        assert!(err.is_transient());
        assert!(!err.is_systemic());
        let msg = err.to_string();
        assert!(msg.contains("store_router"));
        assert!(msg.contains("STORE_ID"));
    }

    #[test]
    fn test_policy_timeout_is_transient() {
        let err = RouterError::PolicyTimeout {
            policy: "lookup".to_string(),
            budget_ms: 250,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_config_is_neither() {
        let err = RouterError::Config("channel 'sales' has max_batch_size 0".to_string());
        assert!(!err.is_systemic());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unknown_batch_formatting() {
        let err = RouterError::UnknownBatch {
            node_id: "store-001".to_string(),
            batch_id: 42,
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("store-001"));
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = RouterError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn test_stopped_not_systemic() {
        assert!(!RouterError::Stopped.is_systemic());
    }
}
