// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing policy registry.
//!
//! Every policy answers one question: given a change row and the nodes that
//! could receive it, which of them should? Policies are resolved per
//! (table, channel) from configuration, evaluated under a time budget, and
//! never see each other's output.
//!
//! # Built-in Policies
//!
//! | Name / kind | Targets |
//! |-------------|---------|
//! | `default` | Every subscribed node |
//! | `column` | Nodes matched by a column expression ([`column_match`]) |
//! | `lookuptable` | Nodes resolved through a mapping table ([`lookup`]) |
//! | `audit` | Nobody (observe only) |
//!
//! Embedders can add their own through [`DataRouter`] and
//! [`PolicyRegistry::register_custom`].
//!
//! # Failure Handling
//!
//! A policy that fails or exceeds its budget routes the row to no one for
//! this pass and records an issue on the [`RouterContext`]. The row stays
//! unrouted and is retried on a later pass. Only systemic errors (change log
//! unreachable) propagate and fail the pass.

pub mod column_match;
pub mod lookup;

use crate::config::{NodeConfig, RouterConfig, RouterDefinition, RouterKind, TableRouteConfig};
use crate::context::RouterContext;
use crate::error::{Result, RouterError};
use crate::metrics;
use crate::model::{ChangeRow, RoutingDecision, TableIdentity};
use crate::source::{BoxFuture, ChangeLogSource};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use column_match::ColumnMatchPolicy;
pub use lookup::LookupPolicy;

/// A node a row may be routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNode {
    pub node_id: String,
    pub external_id: String,
}

impl TargetNode {
    pub fn new(node_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            external_id: external_id.into(),
        }
    }
}

impl From<&NodeConfig> for TargetNode {
    fn from(node: &NodeConfig) -> Self {
        Self::new(node.node_id.clone(), node.external_id.clone())
    }
}

/// Embedder-supplied routing logic.
///
/// Returns node ids out of `targets`. Ids not in `targets` are ignored.
/// The future runs under the policy time budget and is dropped when the
/// budget runs out, so it must not block; wrap synchronous logic in a
/// [`BlockingRouter`].
pub trait DataRouter: Send + Sync {
    fn route<'a>(&'a self, row: &'a ChangeRow, targets: &'a [TargetNode]) -> BoxFuture<'a, BTreeSet<String>>;
}

/// Synchronous routing logic that may block (database lookups, file reads).
pub trait BlockingDataRouter: Send + Sync + 'static {
    fn route(&self, row: &ChangeRow, targets: &[TargetNode]) -> Result<BTreeSet<String>>;
}

/// Runs a [`BlockingDataRouter`] on the blocking thread pool.
///
/// The pass stops waiting once the time budget runs out; the call itself
/// finishes in the background and its answer is discarded.
pub struct BlockingRouter<R> {
    inner: Arc<R>,
}

impl<R: BlockingDataRouter> BlockingRouter<R> {
    pub fn new(router: R) -> Self {
        Self {
            inner: Arc::new(router),
        }
    }
}

impl<R: BlockingDataRouter> DataRouter for BlockingRouter<R> {
    fn route<'a>(&'a self, row: &'a ChangeRow, targets: &'a [TargetNode]) -> BoxFuture<'a, BTreeSet<String>> {
        let router = Arc::clone(&self.inner);
        let row = row.clone();
        let targets = targets.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || router.route(&row, &targets))
                .await
                .map_err(|e| RouterError::policy("custom", format!("router task failed: {}", e)))?
        })
    }
}

/// A routing strategy.
pub enum RoutingPolicy {
    Default,
    ColumnMatch(ColumnMatchPolicy),
    LookupTable(LookupPolicy),
    Audit,
    Custom(Arc<dyn DataRouter>),
}

impl RoutingPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ColumnMatch(_) => "column",
            Self::LookupTable(_) => "lookuptable",
            Self::Audit => "audit",
            Self::Custom(_) => "custom",
        }
    }

    /// Raw target set, before loop prevention.
    pub async fn evaluate(
        &self,
        row: &ChangeRow,
        targets: &[TargetNode],
        ctx: &mut RouterContext,
        source: &dyn ChangeLogSource,
    ) -> Result<BTreeSet<String>> {
        match self {
            Self::Default => Ok(targets.iter().map(|t| t.node_id.clone()).collect()),
            Self::ColumnMatch(policy) => policy.evaluate(row, targets),
            Self::LookupTable(policy) => policy.evaluate(row, targets, ctx, source).await,
            Self::Audit => Ok(BTreeSet::new()),
            Self::Custom(router) => router.route(row, targets).await,
        }
    }
}

impl std::fmt::Debug for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ColumnMatch(policy) => f.debug_tuple("ColumnMatch").field(policy).finish(),
            Self::LookupTable(policy) => f.debug_tuple("LookupTable").field(policy).finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

impl RoutingPolicy {
    fn from_definition(def: &RouterDefinition) -> Result<Self> {
        match def.kind {
            RouterKind::Default => Ok(Self::Default),
            RouterKind::Audit => Ok(Self::Audit),
            RouterKind::Column => {
                let expression = def.expression.as_deref().ok_or_else(|| {
                    RouterError::Config(format!("column router '{}' has no expression", def.name))
                })?;
                Ok(Self::ColumnMatch(ColumnMatchPolicy::parse(expression)?))
            }
            RouterKind::LookupTable => {
                let lookup = def.lookup.as_ref().ok_or_else(|| {
                    RouterError::Config(format!(
                        "lookup router '{}' has no lookup settings",
                        def.name
                    ))
                })?;
                Ok(Self::LookupTable(LookupPolicy::new(lookup)?))
            }
        }
    }
}

/// The policy that applies to one (table, channel) pairing.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub name: String,
    pub policy: Arc<RoutingPolicy>,
    /// Whether the table syncs on this channel.
    pub sync_enabled: bool,
    /// Rows may route back to their source node.
    pub loop_back: bool,
}

/// A registered policy, as listed to operators.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RouterInfo {
    pub name: String,
    pub kind: String,
}

/// Named policies plus the table-to-policy assignments.
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<RoutingPolicy>>,
    /// Keyed by (lowercased table name, channel id).
    routes: HashMap<(String, String), TableRouteConfig>,
    source: Arc<dyn ChangeLogSource>,
    timeout: Duration,
}

impl PolicyRegistry {
    /// Build the registry. `default` and `audit` are always present.
    pub fn from_config(config: &RouterConfig, source: Arc<dyn ChangeLogSource>) -> Result<Self> {
        let mut policies: HashMap<String, Arc<RoutingPolicy>> = HashMap::new();
        policies.insert("default".to_string(), Arc::new(RoutingPolicy::Default));
        policies.insert("audit".to_string(), Arc::new(RoutingPolicy::Audit));

        for def in &config.routers {
            let policy = RoutingPolicy::from_definition(def)?;
            policies.insert(def.name.clone(), Arc::new(policy));
        }

        let routes = config
            .table_routes
            .iter()
            .map(|r| ((r.table_name.to_ascii_lowercase(), r.channel_id.clone()), r.clone()))
            .collect();

        Ok(Self {
            policies,
            routes,
            source,
            timeout: config.settings.pass.policy_timeout_duration(),
        })
    }

    /// Register embedder logic. Replaces any policy with the same name.
    pub fn register_custom(&mut self, name: &str, router: Arc<dyn DataRouter>) {
        self.policies
            .insert(name.to_string(), Arc::new(RoutingPolicy::Custom(router)));
    }

    pub fn policy_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn table_route(&self, table_name: &str, channel_id: &str) -> Option<&TableRouteConfig> {
        self.routes
            .get(&(table_name.to_ascii_lowercase(), channel_id.to_string()))
    }

    /// The policy for a table on a channel.
    ///
    /// `Ok(None)` when the table has no route on the channel; such rows are
    /// not synced there.
    pub fn resolve(&self, table: &TableIdentity, channel_id: &str) -> Result<Option<ResolvedPolicy>> {
        let Some(route) = self.table_route(&table.table_name, channel_id) else {
            return Ok(None);
        };
        let policy = self
            .policies
            .get(&route.router)
            .ok_or_else(|| RouterError::UnknownPolicy(route.router.clone()))?;
        Ok(Some(ResolvedPolicy {
            name: route.router.clone(),
            policy: Arc::clone(policy),
            sync_enabled: route.sync_enabled,
            loop_back: route.loop_back,
        }))
    }

    /// Evaluate a resolved policy for one row.
    ///
    /// Targets are restricted to `targets`, and the row's source node is
    /// removed unless the route allows loop-back.
    pub async fn evaluate(
        &self,
        resolved: &ResolvedPolicy,
        row: &ChangeRow,
        targets: &[TargetNode],
        ctx: &mut RouterContext,
    ) -> Result<RoutingDecision> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            resolved.policy.evaluate(row, targets, ctx, self.source.as_ref()),
        )
        .await;
        metrics::record_policy_latency(&resolved.name, started.elapsed());

        let chosen = match outcome {
            Ok(Ok(chosen)) => chosen,
            Ok(Err(e)) if e.is_systemic() => return Err(e),
            Ok(Err(e)) => {
                self.degrade(resolved, row, ctx, &e);
                return Ok(RoutingDecision::empty());
            }
            Err(_) => {
                let e = RouterError::PolicyTimeout {
                    policy: resolved.name.clone(),
                    budget_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                };
                self.degrade(resolved, row, ctx, &e);
                return Ok(RoutingDecision::empty());
            }
        };

        let targets = chosen
            .into_iter()
            .filter(|id| targets.iter().any(|t| &t.node_id == id))
            .filter(|id| resolved.loop_back || row.source_node_id.as_deref() != Some(id.as_str()))
            .collect();

        Ok(RoutingDecision {
            targets,
            initial_load: row.is_initial_load(),
        })
    }

    fn degrade(&self, resolved: &ResolvedPolicy, row: &ChangeRow, ctx: &mut RouterContext, e: &RouterError) {
        warn!(
            channel_id = %ctx.channel_id(),
            policy = %resolved.name,
            row_id = row.id,
            error = %e,
            "Routing policy failed, row left unrouted for this pass"
        );
        metrics::record_policy_error(&resolved.name, e.kind());
        ctx.record_issue(row.id, &resolved.name, e.to_string());
    }

    /// Registered policies, sorted by name.
    pub fn routers(&self) -> Vec<RouterInfo> {
        let mut routers: Vec<RouterInfo> = self
            .policies
            .iter()
            .map(|(name, policy)| RouterInfo {
                name: name.clone(),
                kind: policy.kind().to_string(),
            })
            .collect();
        routers.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = routers.len(), "Listed routers");
        routers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, LookupConfig};
    use crate::model::EventKind;
    use crate::source::MemoryChangeLog;

    fn config() -> RouterConfig {
        let mut config = RouterConfig::for_testing("corp");
        config.settings.pass.policy_timeout = "50ms".to_string();
        config.channels.push(ChannelConfig::for_testing("sales", 10));
        config.routers.push(RouterDefinition {
            name: "by_store".to_string(),
            kind: RouterKind::Column,
            expression: Some("store_id=:EXTERNAL_ID".to_string()),
            lookup: None,
        });
        config
            .table_routes
            .push(TableRouteConfig::for_testing("orders", "sales", "by_store"));
        config
            .table_routes
            .push(TableRouteConfig::for_testing("prices", "sales", "default"));
        config
    }

    fn registry() -> PolicyRegistry {
        PolicyRegistry::from_config(&config(), Arc::new(MemoryChangeLog::new())).unwrap()
    }

    fn nodes() -> Vec<TargetNode> {
        vec![TargetNode::new("A", "A"), TargetNode::new("B", "B")]
    }

    #[test]
    fn test_resolve() {
        let registry = registry();
        let orders = registry
            .resolve(&TableIdentity::new("ORDERS", 3), "sales")
            .unwrap()
            .unwrap();
        assert_eq!(orders.name, "by_store");
        assert_eq!(orders.policy.kind(), "column");

        assert!(registry
            .resolve(&TableIdentity::new("orders", 1), "other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolve_unknown_policy() {
        let mut config = config();
        config
            .table_routes
            .push(TableRouteConfig::for_testing("items", "sales", "missing"));
        let registry = PolicyRegistry::from_config(&config, Arc::new(MemoryChangeLog::new())).unwrap();
        let err = registry
            .resolve(&TableIdentity::new("items", 1), "sales")
            .unwrap_err();
        assert!(matches!(err, RouterError::UnknownPolicy(_)));
    }

    #[test]
    fn test_bad_definitions_rejected() {
        let mut config = config();
        config.routers.push(RouterDefinition {
            name: "no_expr".to_string(),
            kind: RouterKind::Column,
            expression: None,
            lookup: None,
        });
        assert!(PolicyRegistry::from_config(&config, Arc::new(MemoryChangeLog::new())).is_err());
    }

    #[test]
    fn test_routers_listing() {
        let names: Vec<_> = registry().routers().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["audit", "by_store", "default"]);
    }

    #[tokio::test]
    async fn test_column_match_routes_one_node() {
        let registry = registry();
        let resolved = registry
            .resolve(&TableIdentity::new("orders", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(1, "orders", "sales", EventKind::Insert).with_column("store_id", "A");
        let mut ctx = RouterContext::detached("sales");
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert_eq!(decision.targets.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
        assert!(!decision.initial_load);
    }

    #[tokio::test]
    async fn test_loop_prevention() {
        let registry = registry();
        let mut resolved = registry
            .resolve(&TableIdentity::new("prices", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(1, "prices", "sales", EventKind::Update).from_node("A");
        let mut ctx = RouterContext::detached("sales");

        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert!(!decision.targets.contains("A"));
        assert!(decision.targets.contains("B"));

        resolved.loop_back = true;
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert!(decision.targets.contains("A"));
    }

    #[tokio::test]
    async fn test_policy_error_degrades_to_empty() {
        let registry = registry();
        let resolved = registry
            .resolve(&TableIdentity::new("orders", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(9, "orders", "sales", EventKind::Insert);
        let mut ctx = RouterContext::detached("sales");
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert!(decision.is_empty());
        assert_eq!(ctx.stats.policy_errors, 1);
        assert_eq!(ctx.issues()[0].row_id, 9);
        assert_eq!(ctx.issues()[0].policy, "by_store");
    }

    struct OnlyB;

    impl DataRouter for OnlyB {
        fn route<'a>(&'a self, _row: &'a ChangeRow, _targets: &'a [TargetNode]) -> BoxFuture<'a, BTreeSet<String>> {
            Box::pin(async { Ok(["B".to_string(), "Z".to_string()].into_iter().collect()) })
        }
    }

    /// Answers after `delay`, yielding while it waits.
    struct SlowRouter {
        delay: Duration,
    }

    impl DataRouter for SlowRouter {
        fn route<'a>(&'a self, _row: &'a ChangeRow, targets: &'a [TargetNode]) -> BoxFuture<'a, BTreeSet<String>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(targets.iter().map(|t| t.node_id.clone()).collect())
            })
        }
    }

    /// Blocks its thread for `delay`.
    struct SleepyLookup {
        delay: Duration,
    }

    impl BlockingDataRouter for SleepyLookup {
        fn route(&self, _row: &ChangeRow, targets: &[TargetNode]) -> Result<BTreeSet<String>> {
            std::thread::sleep(self.delay);
            Ok(targets.iter().take(1).map(|t| t.node_id.clone()).collect())
        }
    }

    async fn evaluate_custom(router: Arc<dyn DataRouter>) -> (RoutingDecision, RouterContext) {
        let mut registry = registry();
        registry.register_custom("by_store", router);
        let resolved = registry
            .resolve(&TableIdentity::new("orders", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(5, "orders", "sales", EventKind::Insert);
        let mut ctx = RouterContext::detached("sales");
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        (decision, ctx)
    }

    #[tokio::test]
    async fn test_slow_custom_router_times_out() {
        let started = Instant::now();
        let (decision, ctx) = evaluate_custom(Arc::new(SlowRouter {
            delay: Duration::from_millis(300),
        }))
        .await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(decision.is_empty());
        assert_eq!(ctx.stats.policy_errors, 1);
        assert!(ctx.issues()[0].message.contains("50ms"));
    }

    #[tokio::test]
    async fn test_blocking_router_answers_within_budget() {
        let (decision, ctx) = evaluate_custom(Arc::new(BlockingRouter::new(SleepyLookup {
            delay: Duration::ZERO,
        })))
        .await;
        assert_eq!(decision.targets.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
        assert_eq!(ctx.stats.policy_errors, 0);
    }

    #[tokio::test]
    async fn test_blocking_router_times_out() {
        let started = Instant::now();
        let (decision, ctx) = evaluate_custom(Arc::new(BlockingRouter::new(SleepyLookup {
            delay: Duration::from_millis(300),
        })))
        .await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(decision.is_empty());
        assert_eq!(ctx.stats.policy_errors, 1);
    }

    #[tokio::test]
    async fn test_custom_router_restricted_to_targets() {
        let mut registry = registry();
        registry.register_custom("by_store", Arc::new(OnlyB));
        let resolved = registry
            .resolve(&TableIdentity::new("orders", 1), "sales")
            .unwrap()
            .unwrap();
        assert_eq!(resolved.policy.kind(), "custom");
        let row = ChangeRow::new(1, "orders", "sales", EventKind::Insert);
        let mut ctx = RouterContext::detached("sales");
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert_eq!(decision.targets.into_iter().collect::<Vec<_>>(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_reload_rows_tagged_initial_load() {
        let registry = registry();
        let resolved = registry
            .resolve(&TableIdentity::new("prices", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(1, "prices", "sales", EventKind::Reload);
        let mut ctx = RouterContext::detached("sales");
        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert!(decision.initial_load);
    }

    /// Lookup tables that never answer.
    struct StuckSource;

    impl ChangeLogSource for StuckSource {
        fn read_range(&self, _s: u64, _e: u64, _l: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn max_id(&self) -> BoxFuture<'_, u64> {
            Box::pin(async { Ok(0) })
        }
        fn count_after(&self, _c: &str, _a: u64) -> BoxFuture<'_, u64> {
            Box::pin(async { Ok(0) })
        }
        fn lookup(&self, _t: &str, _k: &str, _v: &str) -> BoxFuture<'_, Vec<(String, String)>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_policy_timeout_degrades_to_empty() {
        let mut config = config();
        config.routers.push(RouterDefinition {
            name: "by_customer".to_string(),
            kind: RouterKind::LookupTable,
            expression: None,
            lookup: Some(LookupConfig {
                table: "customer_store".to_string(),
                key_column: "customer_id".to_string(),
                target_column: "store_id".to_string(),
                row_column: "customer_id".to_string(),
            }),
        });
        config
            .table_routes
            .push(TableRouteConfig::for_testing("invoices", "sales", "by_customer"));
        let registry = PolicyRegistry::from_config(&config, Arc::new(StuckSource)).unwrap();
        let resolved = registry
            .resolve(&TableIdentity::new("invoices", 1), "sales")
            .unwrap()
            .unwrap();
        let row = ChangeRow::new(4, "invoices", "sales", EventKind::Insert)
            .with_column("customer_id", "c1");
        let mut ctx = RouterContext::detached("sales");

        let decision = registry.evaluate(&resolved, &row, &nodes(), &mut ctx).await.unwrap();
        assert!(decision.is_empty());
        assert!(ctx.issues()[0].message.contains("50ms"));
    }
}
