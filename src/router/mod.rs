// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router service.
//!
//! The orchestrator that ties together:
//! - Change log reads via [`crate::scanner::ChangeScanner`]
//! - Gap bookkeeping via [`crate::gap::GapTracker`]
//! - Policy evaluation via [`crate::policy::PolicyRegistry`]
//! - Batch assembly via [`crate::batch::BatchAssembler`]
//! - Persistence via [`crate::store::RoutingStore`]
//!
//! # Architecture
//!
//! Each channel is routed by at most one pass at a time, guarded by a
//! per-channel lock. Different channels run in parallel, up to
//! `pass.max_concurrent_channels`. A pass that hits a systemic error commits
//! nothing and leaves other channels untouched.
//!
//! Passes run either on demand ([`RouterService::route_data`]) or from the
//! background loop once [`RouterService::start`] has been called. Stopping
//! interrupts running passes at a row boundary, flushes every open batch
//! and closes the store.

mod ack;
mod pass;
mod types;

pub use ack::AckHandle;
pub use types::{ChannelHealth, HealthCheck, PassOutcome, PassState, RouterState};

use crate::batch::{BatchAlgorithm, BatchIdAllocator};
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::gap::DataGap;
use crate::metrics;
use crate::policy::{DataRouter, PolicyRegistry, RouterInfo};
use crate::resilience::{Bulkhead, RetryConfig};
use crate::scanner::ChangeScanner;
use crate::sink::{AckEvent, AckOutcome, BatchSink};
use crate::source::ChangeLogSource;
use crate::store::RoutingStore;
use futures::future::join_all;
use pass::ChannelRuntime;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shared by the service handle and its background tasks.
struct Inner {
    config: RouterConfig,
    store: RoutingStore,
    scanner: ChangeScanner,
    registry: PolicyRegistry,
    sink: Arc<dyn BatchSink>,
    ids: Arc<BatchIdAllocator>,
    channels: Vec<Arc<ChannelRuntime>>,
    bulkhead: Bulkhead,
    /// Set once by `stop()`. Passes check it before every row.
    stop: Arc<AtomicBool>,
    retry: RetryConfig,
    ack_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AckEvent>>,
}

/// The change router.
///
/// Reads captured changes, decides which nodes receive each one and groups
/// them into per-node batches for the transmission layer.
///
/// # Example
///
/// ```rust,no_run
/// use change_router::{RouterConfig, RouterService};
/// use change_router::sink::NoOpSink;
/// use change_router::source::MemoryChangeLog;
/// use std::sync::Arc;
///
/// # async fn example() -> change_router::Result<()> {
/// let config = RouterConfig::default();
/// let router = RouterService::new(config, Arc::new(MemoryChangeLog::new()), Arc::new(NoOpSink)).await?;
///
/// let routed = router.route_data(false).await?;
/// println!("routed {} rows, {} gaps open", routed, router.data_gaps().await?.len());
///
/// router.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct RouterService {
    inner: Arc<Inner>,
    ack_tx: mpsc::UnboundedSender<AckEvent>,

    state_tx: watch::Sender<RouterState>,
    state_rx: watch::Receiver<RouterState>,

    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl RouterService {
    /// Create a router with the built-in policies only.
    pub async fn new(
        config: RouterConfig,
        source: Arc<dyn ChangeLogSource>,
        sink: Arc<dyn BatchSink>,
    ) -> Result<Self> {
        Self::with_routers(config, source, sink, Vec::new()).await
    }

    /// Create a router with additional policies implemented in code.
    ///
    /// Table routes may name these routers as if they were configured.
    pub async fn with_routers(
        config: RouterConfig,
        source: Arc<dyn ChangeLogSource>,
        sink: Arc<dyn BatchSink>,
        routers: Vec<(String, Arc<dyn DataRouter>)>,
    ) -> Result<Self> {
        let custom: Vec<&str> = routers.iter().map(|(name, _)| name.as_str()).collect();
        config.validate_with_routers(&custom)?;

        let mut registry = PolicyRegistry::from_config(&config, Arc::clone(&source))?;
        for (name, router) in routers {
            registry.register_custom(&name, router);
        }

        let store = RoutingStore::open(&config.store).await?;
        let ids = Arc::new(BatchIdAllocator::seeded(store.load_batch_sequences().await?));
        let scanner = ChangeScanner::new(source, config.settings.pass.page_size);
        let channels = config
            .channels
            .iter()
            .cloned()
            .map(|c| Arc::new(ChannelRuntime::new(c)))
            .collect();
        let bulkhead = Bulkhead::new(config.settings.pass.max_concurrent_channels.max(1));

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RouterState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            node_id = %config.local_node_id,
            channels = config.channels.len(),
            nodes = config.nodes.len(),
            store = store.path(),
            "Router created"
        );
        metrics::set_router_state("Created");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                scanner,
                registry,
                sink,
                ids,
                channels,
                bulkhead,
                stop: Arc::new(AtomicBool::new(false)),
                retry: RetryConfig::default(),
                ack_rx: tokio::sync::Mutex::new(ack_rx),
            }),
            ack_tx,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Get current router state.
    pub fn state(&self) -> RouterState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RouterState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), RouterState::Running)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Routing store (for diagnostics and tests).
    pub fn store(&self) -> &RoutingStore {
        &self.inner.store
    }

    fn set_state(&self, state: RouterState) {
        let _ = self.state_tx.send(state);
        metrics::set_router_state(&state.to_string());
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            RouterState::Created | RouterState::Running => Ok(()),
            RouterState::Stopping | RouterState::Stopped => Err(RouterError::Stopped),
        }
    }

    /// Start background routing.
    ///
    /// 1. Spawns the acknowledgment task
    /// 2. Spawns the pass loop (every `pass.interval`, channels in backoff skipped)
    pub async fn start(&self) -> Result<()> {
        if self.state() != RouterState::Created {
            return Err(RouterError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let interval = self.inner.config.settings.pass.interval_duration();
        info!(
            node_id = %self.inner.config.local_node_id,
            interval_ms = interval.as_millis() as u64,
            "Starting router"
        );

        let ack_task = {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move { ack::run_ack_loop(&inner, shutdown_rx).await })
        };

        let pass_task = {
            let inner = Arc::clone(&self.inner);
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            let outcomes = pass::route_all(&inner, false, true).await;
                            let routed: usize = outcomes.iter().map(PassOutcome::rows_routed).sum();
                            if routed > 0 {
                                debug!(routed, channels = outcomes.len(), "Background pass finished");
                            }
                            if let Err(e) = ack::sweep(&inner).await {
                                warn!(error = %e, "Republish sweep failed");
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Pass loop exiting");
            })
        };

        {
            let mut handles = self.handles.write().await;
            handles.push(ack_task);
            handles.push(pass_task);
        }

        self.set_state(RouterState::Running);
        info!("Router running");
        Ok(())
    }

    /// Run one pass on every routable channel.
    ///
    /// Returns the number of rows routed to at least one node. With `force`,
    /// every open batch is closed at the end of the pass regardless of age.
    pub async fn route_data(&self, force: bool) -> Result<usize> {
        let outcomes = self.run_passes(force).await?;
        Ok(outcomes.iter().map(PassOutcome::rows_routed).sum())
    }

    /// Like [`route_data`](Self::route_data), with per-channel results.
    ///
    /// Failure backoff does not apply here; every routable channel that is
    /// not already mid-pass runs.
    pub async fn run_passes(&self, force: bool) -> Result<Vec<PassOutcome>> {
        self.ensure_active()?;
        let applied = ack::drain(&self.inner).await;
        if applied > 0 {
            debug!(applied, "Applied queued acknowledgments");
        }

        let outcomes = pass::route_all(&self.inner, force, false).await;

        if let Err(e) = ack::sweep(&self.inner).await {
            warn!(error = %e, "Republish sweep failed");
        }
        Ok(outcomes)
    }

    /// Rows on every channel not yet routed, as of the last committed pass.
    ///
    /// Counts rows beyond each channel's floor plus visible rows inside its
    /// open gaps: late commits not yet rescanned and rows queued for retry.
    pub async fn unrouted_data_count(&self) -> Result<u64> {
        let inner = &self.inner;
        let source = inner.scanner.source();
        let counts = join_all(inner.channels.iter().map(|channel| async move {
            let channel_id = &channel.config.channel_id;
            let floor = inner
                .store
                .load_progress(channel_id)
                .await?
                .map(|p| p.floor_id)
                .unwrap_or(0);
            let mut count = source.count_after(channel_id, floor).await?;

            let gaps = inner.store.load_gaps(channel_id).await?;
            for gap in gaps.iter().filter(|g| !g.status.is_closed()) {
                let from_start = source.count_after(channel_id, gap.start_id.saturating_sub(1)).await?;
                let past_end = source.count_after(channel_id, gap.end_id.saturating_sub(1)).await?;
                count += from_start.saturating_sub(past_end);
            }
            Ok::<_, RouterError>((channel, count))
        }))
        .await;

        let mut total = 0;
        for result in counts {
            let (channel, count) = result?;
            metrics::set_unrouted_backlog(&channel.config.channel_id, count);
            channel.update_status(|s| s.unrouted = Some(count));
            total += count;
        }
        Ok(total)
    }

    /// Open and overdue gaps across all channels, as last committed.
    ///
    /// Capture gaps and retry gaps are told apart by [`DataGap::kind`].
    pub async fn data_gaps(&self) -> Result<Vec<DataGap>> {
        let mut gaps = Vec::new();
        for channel in &self.inner.channels {
            let loaded = self.inner.store.load_gaps(&channel.config.channel_id).await?;
            gaps.extend(loaded.into_iter().filter(|g| !g.status.is_closed()));
        }
        gaps.sort_by(|a, b| (&a.channel_id, a.start_id).cmp(&(&b.channel_id, b.start_id)));
        Ok(gaps)
    }

    /// Registered routing policies.
    pub fn routers(&self) -> Vec<RouterInfo> {
        self.inner.registry.routers()
    }

    /// Names of the batch grouping strategies a channel can use.
    pub fn available_batch_algorithms(&self) -> Vec<&'static str> {
        BatchAlgorithm::ALL.iter().map(BatchAlgorithm::name).collect()
    }

    /// Queue an acknowledgment. Applied by the background task, or at the
    /// start of the next forced pass.
    pub fn batch_acknowledged(&self, node_id: &str, batch_id: u64, outcome: AckOutcome) -> Result<()> {
        self.ack_handle().acknowledge(node_id, batch_id, outcome)
    }

    /// Handle for the transmission layer to report outcomes from anywhere.
    pub fn ack_handle(&self) -> AckHandle {
        AckHandle::new(self.ack_tx.clone())
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Channel figures come from cached pass results; the only I/O is one
    /// batch count query against the local store.
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let channels: Vec<ChannelHealth> = self
            .inner
            .channels
            .iter()
            .map(|channel| {
                let status = channel.status();
                ChannelHealth {
                    channel_id: channel.config.channel_id.clone(),
                    routable: channel.config.is_routable(),
                    pass_state: status.pass_state,
                    last_pass_at: status.last_pass_at,
                    last_error: status.last_error,
                    consecutive_failures: status.consecutive_failures,
                    open_gaps: status.open_gaps,
                    retry_rows: status.retry_rows,
                    oldest_gap_age: status.oldest_gap_age,
                    unrouted: status.unrouted,
                }
            })
            .collect();

        let batches: BTreeMap<String, u64> = if state == RouterState::Stopped {
            BTreeMap::new()
        } else {
            match self.inner.store.batch_counts().await {
                Ok(counts) => counts
                    .into_iter()
                    .map(|(status, count)| (status.to_string(), count))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Failed to count batches for health check");
                    BTreeMap::new()
                }
            }
        };

        let healthy = state == RouterState::Running
            && channels.iter().all(|c| c.pass_state != PassState::Failed);

        HealthCheck {
            state,
            healthy,
            channels,
            passes_in_flight: self.inner.bulkhead.in_use(),
            batches,
        }
    }

    /// Stop the router.
    ///
    /// Shutdown sequence:
    /// 1. Signal running passes to stop at the next row boundary
    /// 2. Wait for background tasks (with timeout)
    /// 3. Force-close and publish every open batch
    /// 4. Apply queued acknowledgments
    /// 5. Checkpoint and close the store
    pub async fn stop(&self) {
        if matches!(self.state(), RouterState::Stopping | RouterState::Stopped) {
            return;
        }
        info!("Stopping router");
        self.set_state(RouterState::Stopping);

        self.inner.stop.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let flushed = join_all(
            self.inner
                .channels
                .iter()
                .map(|channel| pass::flush_channel(&self.inner, channel)),
        )
        .await;
        for (channel, result) in self.inner.channels.iter().zip(flushed) {
            match result {
                Ok(0) => {}
                Ok(closed) => debug!(channel_id = %channel.config.channel_id, closed, "Flushed channel"),
                Err(e) => warn!(
                    channel_id = %channel.config.channel_id,
                    error = %e,
                    "Failed to flush channel, open batches resume on restart"
                ),
            }
        }

        // Later acknowledgments fail with Stopped; queued ones still apply.
        match tokio::time::timeout(drain_timeout, self.inner.ack_rx.lock()).await {
            Ok(mut rx) => rx.close(),
            Err(_) => warn!("Acknowledgment queue still held, not closed"),
        }
        ack::drain(&self.inner).await;
        self.inner.store.close().await;

        self.set_state(RouterState::Stopped);
        info!("Router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, NodeConfig, TableRouteConfig};
    use crate::model::{ChangeRow, EventKind};
    use crate::sink::{ChannelSink, NoOpSink};
    use crate::source::MemoryChangeLog;

    fn test_config() -> RouterConfig {
        let mut config = RouterConfig::for_testing("corp");
        config.channels.push(ChannelConfig::for_testing("sales", 10));
        config.nodes.push(NodeConfig::for_testing("A", &["sales"]));
        config
            .table_routes
            .push(TableRouteConfig::for_testing("orders", "sales", "default"));
        config
    }

    fn order(id: u64) -> ChangeRow {
        ChangeRow::new(id, "orders", "sales", EventKind::Insert).with_column("id", &id.to_string())
    }

    async fn router(log: Arc<MemoryChangeLog>) -> RouterService {
        RouterService::new(test_config(), log, Arc::new(NoOpSink)).await.unwrap()
    }

    #[tokio::test]
    async fn test_router_initial_state() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        assert_eq!(router.state(), RouterState::Created);
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.table_routes[0].router = "missing".to_string();
        let result = RouterService::new(config, Arc::new(MemoryChangeLog::new()), Arc::new(NoOpSink)).await;
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        router.start().await.unwrap();
        assert!(router.is_running());

        let result = router.start().await;
        if let Err(RouterError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
        router.stop().await;
    }

    #[tokio::test]
    async fn test_state_receiver_sees_stop() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        let rx = router.state_receiver();
        router.stop().await;
        assert_eq!(*rx.borrow(), RouterState::Stopped);
    }

    #[tokio::test]
    async fn test_route_data_after_stop_fails() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        router.stop().await;
        assert!(matches!(router.route_data(false).await, Err(RouterError::Stopped)));
        // Stopping twice is harmless.
        router.stop().await;
    }

    #[tokio::test]
    async fn test_acknowledge_after_stop_fails() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        let handle = router.ack_handle();
        router.stop().await;

        assert!(matches!(
            handle.acknowledge("A", 1, AckOutcome::Ok),
            Err(RouterError::Stopped)
        ));
        assert!(matches!(
            router.batch_acknowledged("A", 1, AckOutcome::Ok),
            Err(RouterError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_route_and_count() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all((1..=3).map(order));
        let router = router(Arc::clone(&log)).await;

        assert_eq!(router.unrouted_data_count().await.unwrap(), 3);
        assert_eq!(router.route_data(false).await.unwrap(), 3);
        assert_eq!(router.unrouted_data_count().await.unwrap(), 0);
        assert_eq!(router.route_data(false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_open_batches() {
        let log = Arc::new(MemoryChangeLog::new());
        log.insert_all((1..=2).map(order));
        let (sink, mut rx) = ChannelSink::new();
        let router = RouterService::new(test_config(), log, Arc::new(sink)).await.unwrap();

        router.route_data(false).await.unwrap();
        assert!(rx.try_recv().is_err());

        router.stop().await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.data_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_health_reports_channels() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        router.route_data(false).await.unwrap();

        let health = router.health().await;
        assert_eq!(health.state, RouterState::Created);
        assert!(!health.healthy);
        assert_eq!(health.channels.len(), 1);
        assert_eq!(health.channels[0].pass_state, PassState::Completed);
        assert_eq!(health.passes_in_flight, 0);

        router.start().await.unwrap();
        assert!(router.health().await.healthy);
        router.stop().await;
    }

    #[tokio::test]
    async fn test_introspection() {
        let router = router(Arc::new(MemoryChangeLog::new())).await;
        let names: Vec<String> = router.routers().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["audit".to_string(), "default".to_string()]);
        assert_eq!(router.available_batch_algorithms().len(), 3);
        assert!(router.data_gaps().await.unwrap().is_empty());
    }
}
