// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the change router.
//!
//! Configuration is passed to [`RouterService::new()`](crate::RouterService::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use change_router::config::{RouterConfig, ChannelConfig, NodeConfig, TableRouteConfig};
//!
//! let config = RouterConfig {
//!     local_node_id: "corp-000".into(),
//!     channels: vec![ChannelConfig::for_testing("sales", 100)],
//!     nodes: vec![NodeConfig::for_testing("store-001", &["sales"])],
//!     table_routes: vec![TableRouteConfig::for_testing("orders", "sales", "default")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RouterConfig
//! ├── local_node_id: String          # This node's id (loop prevention)
//! ├── settings: RouterSettings
//! │   ├── gap: GapConfig             # Gap rescan budget and retention
//! │   ├── pass: PassConfig           # Page size, pass limits, policy budget
//! │   └── ack: AckConfig             # Acknowledgment timeout
//! ├── channels: Vec<ChannelConfig>   # Batching lanes
//! ├── nodes: Vec<NodeConfig>         # Target nodes and their subscriptions
//! ├── routers: Vec<RouterDefinition> # Named routing policies
//! ├── table_routes: Vec<TableRouteConfig>
//! └── store: StoreConfig             # SQLite routing state
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "corp-000"
//!
//! channels:
//!   - channel_id: "sales"
//!     max_batch_size: 1000
//!     max_batch_age: "30s"
//!     concurrency: 2
//!
//! nodes:
//!   - node_id: "store-001"
//!     external_id: "001"
//!     channels: ["sales"]
//!
//! routers:
//!   - name: "by_store"
//!     kind: "column"
//!     expression: "STORE_ID=:EXTERNAL_ID"
//!
//! table_routes:
//!   - table_name: "sale_transaction"
//!     channel_id: "sales"
//!     router: "by_store"
//!
//! store:
//!   sqlite_path: "/var/lib/router/routing.db"
//! ```

use crate::batch::BatchAlgorithm;
use crate::error::{Result, RouterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Parse a humantime duration string, falling back on error.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RouterService::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// The identity of the local node running this router.
    pub local_node_id: String,

    /// Tunables for gaps, passes and acknowledgments.
    #[serde(default)]
    pub settings: RouterSettings,

    /// Logical channels. Each channel routes independently.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Target nodes and their channel subscriptions.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Named routing policies. `default` and `audit` are always registered.
    #[serde(default)]
    pub routers: Vec<RouterDefinition>,

    /// Which tables sync on which channel, through which router.
    #[serde(default)]
    pub table_routes: Vec<TableRouteConfig>,

    /// Routing state persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            settings: RouterSettings::default(),
            channels: Vec::new(),
            nodes: Vec::new(),
            routers: Vec::new(),
            table_routes: Vec::new(),
            store: StoreConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            store: StoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Find a channel by id.
    pub fn channel(&self, channel_id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    /// Enabled nodes subscribed to a channel, excluding the local node.
    pub fn subscribers(&self, channel_id: &str) -> Vec<&NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.enabled && n.node_id != self.local_node_id)
            .filter(|n| n.channels.iter().any(|c| c == channel_id))
            .collect()
    }

    /// Check the configuration for references that cannot be resolved.
    pub fn validate(&self) -> Result<()> {
        self.validate_with_routers(&[])
    }

    /// Like [`validate`](Self::validate), also accepting routes to custom
    /// routers registered in code under `custom` names.
    pub fn validate_with_routers(&self, custom: &[&str]) -> Result<()> {
        if self.local_node_id.is_empty() {
            return Err(RouterError::Config("local_node_id is empty".to_string()));
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.channel_id.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate channel '{}'",
                    channel.channel_id
                )));
            }
            if channel.max_batch_size == 0 {
                return Err(RouterError::Config(format!(
                    "channel '{}' has max_batch_size 0",
                    channel.channel_id
                )));
            }
            if channel.concurrency == 0 {
                return Err(RouterError::Config(format!(
                    "channel '{}' has concurrency 0",
                    channel.channel_id
                )));
            }
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.node_id.as_str()) {
                return Err(RouterError::Config(format!("duplicate node '{}'", node.node_id)));
            }
            for channel_id in &node.channels {
                if !channel_ids.contains(channel_id.as_str()) {
                    return Err(RouterError::Config(format!(
                        "node '{}' subscribes to unknown channel '{}'",
                        node.node_id, channel_id
                    )));
                }
            }
        }

        let mut router_names: HashSet<&str> = ["default", "audit"].into_iter().collect();
        router_names.extend(custom.iter().copied());
        for router in &self.routers {
            if !router_names.insert(router.name.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate router '{}'",
                    router.name
                )));
            }
        }

        for route in &self.table_routes {
            if !channel_ids.contains(route.channel_id.as_str()) {
                return Err(RouterError::Config(format!(
                    "table '{}' routes to unknown channel '{}'",
                    route.table_name, route.channel_id
                )));
            }
            if !router_names.contains(route.router.as_str()) {
                return Err(RouterError::Config(format!(
                    "table '{}' uses unknown router '{}'",
                    route.table_name, route.router
                )));
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RouterSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for routing passes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterSettings {
    #[serde(default)]
    pub gap: GapConfig,
    #[serde(default)]
    pub pass: PassConfig,
    #[serde(default)]
    pub ack: AckConfig,
}

/// Gap rescan budget.
///
/// A gap is only expired once it has been rescanned at least `max_rescans`
/// times AND is older than `expire_after`. Both conditions together let a
/// long-running transaction commit late without the gap being declared a
/// permanent hole after a burst of quick passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Rescans before a gap may be declared overdue.
    #[serde(default = "default_max_rescans")]
    pub max_rescans: u32,

    /// Minimum gap age before it may be declared overdue (e.g., "10m").
    #[serde(default = "default_expire_after")]
    pub expire_after: String,

    /// How long closed gaps are kept for audit (e.g., "24h").
    #[serde(default = "default_closed_retention")]
    pub closed_retention: String,

    /// Passes a row whose routing failed is retried before it is abandoned.
    #[serde(default = "default_max_policy_retries")]
    pub max_policy_retries: u32,
}

fn default_max_rescans() -> u32 {
    3
}

fn default_expire_after() -> String {
    "10m".to_string()
}

fn default_closed_retention() -> String {
    "24h".to_string()
}

fn default_max_policy_retries() -> u32 {
    10
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            max_rescans: 3,
            expire_after: "10m".to_string(),
            closed_retention: "24h".to_string(),
            max_policy_retries: 10,
        }
    }
}

impl GapConfig {
    pub fn expire_after_duration(&self) -> Duration {
        parse_duration_or(&self.expire_after, Duration::from_secs(600))
    }

    pub fn closed_retention_duration(&self) -> Duration {
        parse_duration_or(&self.closed_retention, Duration::from_secs(86_400))
    }

    /// Expire gaps immediately after `max_rescans` (for tests).
    pub fn testing(max_rescans: u32) -> Self {
        Self {
            max_rescans,
            expire_after: "0s".to_string(),
            closed_retention: "1h".to_string(),
            max_policy_retries: 3,
        }
    }
}

/// Per-pass limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    /// Rows fetched from the change log per read.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Upper bound on rows one channel pass will route before yielding.
    #[serde(default = "default_max_rows_per_pass")]
    pub max_rows_per_pass: usize,

    /// Budget for one policy evaluation (e.g., "5s").
    #[serde(default = "default_policy_timeout")]
    pub policy_timeout: String,

    /// Maximum channel passes running at once.
    #[serde(default = "default_max_concurrent_channels")]
    pub max_concurrent_channels: usize,

    /// Interval between background passes once the service is started.
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_page_size() -> usize {
    1000
}

fn default_max_rows_per_pass() -> usize {
    100_000
}

fn default_policy_timeout() -> String {
    "5s".to_string()
}

fn default_max_concurrent_channels() -> usize {
    8
}

fn default_interval() -> String {
    "10s".to_string()
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_rows_per_pass: 100_000,
            policy_timeout: "5s".to_string(),
            max_concurrent_channels: 8,
            interval: "10s".to_string(),
        }
    }
}

impl PassConfig {
    pub fn policy_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.policy_timeout, Duration::from_secs(5))
    }

    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(10))
    }
}

/// Acknowledgment tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    /// A published batch not acknowledged within this window is marked ERROR
    /// and republished.
    #[serde(default = "default_ack_timeout")]
    pub timeout: String,
}

fn default_ack_timeout() -> String {
    "10m".to_string()
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout: default_ack_timeout(),
        }
    }
}

impl AckConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChannelConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// A named lane of change traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,

    /// Rows per batch before it closes.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Age after which an open batch closes (e.g., "60s").
    #[serde(default = "default_max_batch_age")]
    pub max_batch_age: String,

    /// Open batches allowed per node at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Disabled channels are never routed.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Suspended channels keep their backlog but route nothing.
    #[serde(default)]
    pub suspended: bool,

    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_age() -> String {
    "60s".to_string()
}

fn default_concurrency() -> usize {
    1
}

impl ChannelConfig {
    /// Create a channel config for testing (never ages out).
    pub fn for_testing(channel_id: &str, max_batch_size: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            max_batch_size,
            max_batch_age: "1h".to_string(),
            concurrency: 1,
            enabled: true,
            suspended: false,
            batch_algorithm: BatchAlgorithm::NonTransactional,
        }
    }

    pub fn max_batch_age_duration(&self) -> Duration {
        parse_duration_or(&self.max_batch_age, Duration::from_secs(60))
    }

    /// Enabled and not suspended.
    pub fn is_routable(&self) -> bool {
        self.enabled && !self.suspended
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// A target node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,

    /// Business identifier (store number, region code) matched by column routers.
    pub external_id: String,

    /// Channels this node receives.
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Initial load state, managed outside the router.
    #[serde(default)]
    pub initial_load: Option<InitialLoadWindow>,
}

impl NodeConfig {
    /// Node whose external id equals its node id.
    pub fn for_testing(node_id: &str, channels: &[&str]) -> Self {
        Self {
            node_id: node_id.to_string(),
            external_id: node_id.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            enabled: true,
            initial_load: None,
        }
    }

    pub fn initial_load_in_progress(&self) -> bool {
        self.initial_load
            .as_ref()
            .map(InitialLoadWindow::in_progress)
            .unwrap_or(false)
    }
}

/// When a node's initial load started and (optionally) finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialLoadWindow {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl InitialLoadWindow {
    pub fn in_progress(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Routers and table routes
// ═══════════════════════════════════════════════════════════════════════════════

/// Built-in router kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterKind {
    /// Every subscribed node.
    Default,
    /// Match a row column against node identifiers.
    Column,
    /// Resolve targets through an auxiliary mapping table.
    LookupTable,
    /// Observe only, never deliver.
    Audit,
}

impl std::fmt::Display for RouterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Column => write!(f, "column"),
            Self::LookupTable => write!(f, "lookuptable"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// A named routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDefinition {
    pub name: String,
    pub kind: RouterKind,

    /// Column router expression, e.g. `STORE_ID=:EXTERNAL_ID`.
    #[serde(default)]
    pub expression: Option<String>,

    /// Lookup table router parameters.
    #[serde(default)]
    pub lookup: Option<LookupConfig>,
}

/// Parameters for a lookup-table router.
///
/// For a row, the value of `row_column` is matched against `key_column` in
/// `table`; every `target_column` value found is an external id to route to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    pub table: String,
    pub key_column: String,
    pub target_column: String,
    pub row_column: String,
}

/// Assigns a table on a channel to a router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRouteConfig {
    pub table_name: String,
    pub channel_id: String,

    #[serde(default = "default_router_name")]
    pub router: String,

    /// Whether the table syncs on this channel at all.
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Allow rows to route back to the node they came from.
    #[serde(default)]
    pub loop_back: bool,
}

fn default_router_name() -> String {
    "default".to_string()
}

impl TableRouteConfig {
    pub fn for_testing(table_name: &str, channel_id: &str, router: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            channel_id: channel_id.to_string(),
            router: router.to_string(),
            sync_enabled: true,
            loop_back: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing state persistence.
///
/// Gaps, progress and batches live in SQLite so a restart resumes at the
/// last committed batch boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "routing_state.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
