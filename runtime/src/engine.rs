//! The sync dispatcher.
//!
//! [`Engine`] owns the operation registry and the sync registry. Every action
//! it runs is recorded as an [`Invocation`] of some flow; the rules indexed on
//! that action are then matched, refined and fired, depth first, each result
//! action cascading in turn before the next one starts.
//!
//! The engine performs no cycle detection. A rule whose result re-satisfies
//! its own trigger cascades until [`EngineConfig::max_cascade_depth`] (off by
//! default) cuts it short.

use crate::error::EngineError;
use crate::flow::{Flow, FlowState};
use crate::{AtomicCounterGuard, HealthCheck};
use concept_sync_core::{
    ActionResult, Invocation, OperationRef, OperationRegistry, QueryResult, Record, SyncRegistry,
    SyncRule,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the invocation broadcast channel
    pub broadcast_capacity: usize,
    /// Depth at which a cascade is cut short; `None` means unlimited
    pub max_cascade_depth: Option<usize>,
}

impl EngineConfig {
    /// Set the invocation broadcast capacity
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Limit cascade depth
    #[must_use]
    pub const fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = Some(depth);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_cascade_depth: None,
        }
    }
}

/// The sync dispatcher.
///
/// Cheap to clone; clones share registries, the shutdown flag and the
/// invocation broadcast channel.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(Arc::new(operations), Arc::new(syncs))?;
///
/// // Run an action and every rule it triggers
/// let output = engine.invoke(CREATE_ITEM, record(json!({ "title": "Drill" }))).await?;
///
/// // Reads never trigger rules
/// let items = engine.query(GET_ITEMS, Record::new()).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    operations: Arc<OperationRegistry>,
    syncs: Arc<SyncRegistry>,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
    active_flows: Arc<AtomicUsize>,
    /// Every recorded invocation is broadcast here (the live-update sink).
    invocations: broadcast::Sender<Arc<Invocation>>,
}

impl Engine {
    /// Create an engine with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Sync`] if a rule references an operation that is
    /// not registered.
    pub fn new(
        operations: Arc<OperationRegistry>,
        syncs: Arc<SyncRegistry>,
    ) -> Result<Self, EngineError> {
        Self::with_config(operations, syncs, EngineConfig::default())
    }

    /// Create an engine with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_config(
        operations: Arc<OperationRegistry>,
        syncs: Arc<SyncRegistry>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        syncs.check_operations(&operations)?;
        let (invocations, _) = broadcast::channel(config.broadcast_capacity.max(1));
        tracing::info!(
            operations = operations.operations().len(),
            rules = syncs.len(),
            "Sync engine ready"
        );
        Ok(Self {
            operations,
            syncs,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_flows: Arc::new(AtomicUsize::new(0)),
            invocations,
        })
    }

    /// Operation registry
    #[must_use]
    pub const fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    /// Sync registry
    #[must_use]
    pub const fn syncs(&self) -> &Arc<SyncRegistry> {
        &self.syncs
    }

    /// Start a new flow
    #[must_use]
    pub fn flow(&self) -> Flow {
        Flow::new(self.clone())
    }

    /// Invoke an action as the root of a new flow and run the whole cascade.
    ///
    /// Returns the action's own output; the outputs of rule-fired actions are
    /// observable through [`Self::subscribe_invocations`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownInProgress`] once shutdown has begun.
    #[tracing::instrument(skip(self, input), fields(op = %op))]
    pub async fn invoke(&self, op: OperationRef, input: Record) -> Result<ActionResult, EngineError> {
        self.flow().invoke(op, input).await
    }

    /// Invoke an action as the root of a new flow, returning as soon as the
    /// action itself completes. The cascade runs on a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownInProgress`] once shutdown has begun.
    #[tracing::instrument(skip(self, input), fields(op = %op))]
    pub async fn submit(&self, op: OperationRef, input: Record) -> Result<ActionResult, EngineError> {
        let guard = self.enter()?;
        let flow = Arc::new(FlowState::new());
        let invocation = self.perform(&flow, op, input, 0).await;
        let output = invocation.output.clone();

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            engine.cascade(&flow, invocation, 0).await;
        });
        Ok(output)
    }

    /// Run a query. Queries are reads: they are never recorded and never
    /// trigger rules.
    #[tracing::instrument(skip(self, input), fields(op = %op))]
    pub async fn query(&self, op: OperationRef, input: Record) -> QueryResult {
        self.operations.call_query(op, input).await
    }

    /// Subscribe to every invocation recorded from now on.
    ///
    /// Slow subscribers lag (see [`broadcast::error::RecvError::Lagged`]);
    /// the engine never waits for them.
    #[must_use]
    pub fn subscribe_invocations(&self) -> broadcast::Receiver<Arc<Invocation>> {
        self.invocations.subscribe()
    }

    /// Number of flows still running (root calls plus spawned cascades)
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.active_flows.load(Ordering::Acquire)
    }

    /// Health of the engine
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let check = if self.shutdown.load(Ordering::Acquire) {
            HealthCheck::unhealthy("engine", "Engine is shutting down")
        } else {
            HealthCheck::healthy("engine")
        };
        check
            .with_metadata("operations", self.operations.operations().len().to_string())
            .with_metadata("rules", self.syncs.len().to_string())
            .with_metadata("active_flows", self.active_flows().to_string())
    }

    /// Stop accepting new flows and wait for running ones to finish.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] if flows are still running
    /// when `timeout` expires.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown.store(true, Ordering::Release);

        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        loop {
            let running = self.active_flows();
            if running == 0 {
                tracing::info!("All flows completed, shutdown successful");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                tracing::error!(active_flows = running, "Shutdown timeout: {} flows still running", running);
                return Err(EngineError::ShutdownTimeout(running));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Register a new running flow, refusing once shutdown has begun.
    pub(crate) fn enter(&self) -> Result<AtomicCounterGuard, EngineError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::ShutdownInProgress);
        }
        Ok(AtomicCounterGuard::acquire(&self.active_flows))
    }

    /// Run an action in `flow` at cascade `depth`, then its cascade.
    pub(crate) fn run<'a>(
        &'a self,
        flow: &'a Arc<FlowState>,
        op: OperationRef,
        input: Record,
        depth: usize,
    ) -> BoxFuture<'a, ActionResult> {
        Box::pin(async move {
            let invocation = self.perform(flow, op, input, depth).await;
            let output = invocation.output.clone();
            self.cascade(flow, invocation, depth).await;
            output
        })
    }

    /// Call the action and record the completed invocation.
    async fn perform(
        &self,
        flow: &FlowState,
        op: OperationRef,
        input: Record,
        depth: usize,
    ) -> Arc<Invocation> {
        let start = Instant::now();
        let output = self.operations.call_action(op, input.clone()).await;
        metrics::histogram!("sync_action_duration_seconds").record(start.elapsed().as_secs_f64());

        if let Err(failure) = &output {
            if depth > 0 {
                tracing::warn!(op = %op, flow = %flow.id(), depth, error = %failure, "Rule-fired action failed");
                metrics::counter!("sync_action_failures_total").increment(1);
            } else {
                tracing::debug!(op = %op, flow = %flow.id(), error = %failure, "Action failed");
            }
        }

        let invocation = Arc::new(Invocation::new(flow.id(), op, input, output));
        flow.push(Arc::clone(&invocation));
        metrics::counter!("sync_invocations_recorded_total").increment(1);
        tracing::trace!(op = %op, id = %invocation.id, flow = %flow.id(), "Recorded invocation");

        // No subscribers is fine
        let _ = self.invocations.send(Arc::clone(&invocation));
        invocation
    }

    /// Fire every rule the invocation completes, depth first.
    fn cascade<'a>(
        &'a self,
        flow: &'a Arc<FlowState>,
        invocation: Arc<Invocation>,
        depth: usize,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(max) = self.config.max_cascade_depth {
                if depth >= max {
                    tracing::error!(
                        op = %invocation.op,
                        flow = %flow.id(),
                        depth,
                        "Cascade depth limit reached, not evaluating rules"
                    );
                    metrics::counter!("sync_cascade_depth_exceeded_total").increment(1);
                    return;
                }
            }

            let rules: Vec<Arc<SyncRule>> = self.syncs.rules_for(invocation.op).cloned().collect();
            for rule in rules {
                self.fire(flow, &rule, &invocation, depth).await;
            }
        })
    }

    async fn fire(&self, flow: &Arc<FlowState>, rule: &SyncRule, invocation: &Invocation, depth: usize) {
        let matched = flow.claim(rule, invocation);
        if matched.is_empty() {
            return;
        }
        tracing::debug!(rule = rule.name(), frames = matched.len(), "Triggers matched");

        let frames = rule.refinement().apply(matched, self.operations.as_ref()).await;
        if frames.is_empty() {
            tracing::debug!(rule = rule.name(), "Refinement left no frames");
            return;
        }

        metrics::counter!("sync_rules_fired_total", "rule" => rule.name()).increment(1);
        tracing::debug!(rule = rule.name(), frames = frames.len(), "Firing rule");

        for frame in &frames {
            for action in rule.then() {
                match action.input.resolve(frame) {
                    Ok(input) => {
                        self.run(flow, action.op, input, depth + 1).await;
                    }
                    Err(symbol) => {
                        tracing::warn!(
                            rule = rule.name(),
                            symbol = rule.symbol_name(symbol).unwrap_or("<anonymous>"),
                            "Result input references an unbound symbol"
                        );
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("operations", &self.operations.operations().len())
            .field("rules", &self.syncs.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use concept_sync_core::{record, template, ActionTemplate, Failure, Pattern, SyncSpec};
    use serde_json::json;

    const PING: OperationRef = OperationRef::new("Loop", "ping");
    const PONG: OperationRef = OperationRef::new("Loop", "pong");

    fn ping_pong() -> (Arc<OperationRegistry>, Arc<SyncRegistry>) {
        let mut ops = OperationRegistry::builder();
        ops.action(PING, |input| async move { Ok(input) })
            .unwrap()
            .action(PONG, |input| async move { Ok(input) })
            .unwrap();

        let mut syncs = SyncRegistry::new();
        syncs
            .register(SyncRule::build("PingPong", |_| {
                SyncSpec::new()
                    .when(Pattern::new(PING, template! {}, template! {}))
                    .then(ActionTemplate::new(PONG, template! {}))
            }))
            .unwrap()
            .register(SyncRule::build("PongPing", |_| {
                SyncSpec::new()
                    .when(Pattern::new(PONG, template! {}, template! {}))
                    .then(ActionTemplate::new(PING, template! {}))
            }))
            .unwrap();
        (Arc::new(ops.build()), Arc::new(syncs))
    }

    #[tokio::test]
    async fn depth_limit_stops_runaway_cascade() {
        let (ops, syncs) = ping_pong();
        let engine =
            Engine::with_config(ops, syncs, EngineConfig::default().with_max_cascade_depth(4)).unwrap();
        let flow = engine.flow();
        flow.invoke(PING, Record::new()).await.unwrap().unwrap();
        // Root plus four rule-fired actions
        assert_eq!(flow.history().len(), 5);
    }

    #[tokio::test]
    async fn unknown_rule_operation_is_rejected() {
        let ops = Arc::new(OperationRegistry::builder().build());
        let (_, syncs) = ping_pong();
        let err = Engine::new(ops, syncs).unwrap_err();
        assert!(matches!(err, EngineError::Sync(_)));
    }

    #[tokio::test]
    async fn failures_are_returned_as_data() {
        let mut ops = OperationRegistry::builder();
        ops.action(PING, |_| async move { Err(Failure::new("nope")) }).unwrap();
        let engine = Engine::new(Arc::new(ops.build()), Arc::new(SyncRegistry::new())).unwrap();
        let out = engine.invoke(PING, record(json!({}))).await.unwrap();
        assert_eq!(out, Err(Failure::new("nope")));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_flows() {
        let (ops, syncs) = ping_pong();
        let engine = Engine::with_config(ops, syncs, EngineConfig::default().with_max_cascade_depth(1)).unwrap();
        engine.shutdown(Duration::from_millis(100)).await.unwrap();
        assert_eq!(
            engine.invoke(PING, Record::new()).await,
            Err(EngineError::ShutdownInProgress)
        );
        assert!(!engine.health().status.is_healthy());
    }
}
