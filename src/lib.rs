// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Change Router
//!
//! The routing and batching stage of a multi-node change replication
//! pipeline. Captured row changes are read in id order, matched to the
//! nodes that should receive them and grouped into per-node batches that a
//! transmission layer ships and acknowledges.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              change-router                                │
//! │                                                                           │
//! │  ┌──────────────┐    ┌────────────────┐    ┌─────────────────────────┐    │
//! │  │ ChangeLog    │───►│ ChangeScanner  │───►│ PolicyRegistry          │    │
//! │  │ (source)     │    │ + GapTracker   │    │ (default/column/lookup) │    │
//! │  └──────────────┘    └────────────────┘    └─────────────────────────┘    │
//! │                                                        │                  │
//! │                                                        ▼                  │
//! │  ┌──────────────┐    ┌────────────────┐    ┌─────────────────────────┐    │
//! │  │ BatchSink    │◄───│ RoutingStore   │◄───│ BatchAssembler          │    │
//! │  │ (publish/ack)│    │ (SQLite)       │    │ (per node, per channel) │    │
//! │  └──────────────┘    └────────────────┘    └─────────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **No loss**: every committed change on a channel is routed, even when
//!    ids become visible out of order. Ids that never appear are tracked as
//!    gaps and rescanned until they fill or expire; rows whose routing keeps
//!    failing are retried, then abandoned with a warning and a counter.
//! 2. **At-least-once delivery**: a row lands in one batch per target node,
//!    but a batch may be handed to the sink more than once (republished after
//!    an acknowledgment timeout or a refused publish). Receivers dedup on
//!    `(node_id, batch_id)`.
//! 3. **Order**: within a batch, rows appear in increasing id order.
//! 4. **Isolation**: channels route independently; one channel's failure
//!    never touches another's state.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use change_router::{RouterConfig, RouterService};
//! use change_router::sink::NoOpSink;
//! use change_router::source::MemoryChangeLog;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RouterConfig::default();
//!     let router = RouterService::new(config, Arc::new(MemoryChangeLog::new()), Arc::new(NoOpSink))
//!         .await
//!         .expect("Failed to create router");
//!     router.start().await.expect("Failed to start");
//!
//!     // Router runs until shutdown signal
//!     router.stop().await;
//! }
//! ```

pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod gap;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod resilience;
pub mod router;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod sqlite_source;
pub mod store;

// Re-exports for convenience
pub use batch::{Batch, BatchAlgorithm, BatchAssembler, BatchStatus};
pub use config::{ChannelConfig, NodeConfig, RouterConfig, RouterSettings, TableRouteConfig};
pub use error::{Result, RouterError};
pub use gap::{DataGap, GapKind, GapStatus, GapTracker};
pub use model::{ChangeRow, EventKind, RoutingDecision};
pub use policy::{BlockingDataRouter, BlockingRouter, DataRouter, TargetNode};
pub use router::{AckHandle, HealthCheck, PassOutcome, RouterService, RouterState};
pub use sink::{AckOutcome, BatchSink};
pub use source::{ChangeLogSource, MemoryChangeLog};
pub use sqlite_source::SqliteChangeLog;
