//! Engine builder and invocation helpers for tests.

#![allow(clippy::module_name_repetitions)]

use concept_sync_core::{
    Concept, Invocation, OperationRef, OperationRegistry, OperationRegistryBuilder, SyncRegistry,
    SyncRule,
};
use concept_sync_runtime::{Engine, EngineConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Fluent engine builder that panics on misconfiguration.
///
/// # Example
///
/// ```ignore
/// let engine = EngineHarness::new()
///     .concept(Arc::new(items))
///     .concept(Arc::clone(&requesting))
///     .rule(create_item_request())
///     .rule(create_item_response())
///     .build();
/// ```
pub struct EngineHarness {
    operations: OperationRegistryBuilder,
    syncs: SyncRegistry,
    config: EngineConfig,
}

impl EngineHarness {
    /// Empty harness with default engine configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: OperationRegistry::builder(),
            syncs: SyncRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    /// Register a concept
    ///
    /// # Panics
    ///
    /// Panics if the concept's operations clash with registered ones.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn concept<C: Concept>(mut self, concept: Arc<C>) -> Self {
        self.operations
            .concept(concept)
            .expect("concept registration should succeed in tests");
        self
    }

    /// Register a sync rule
    ///
    /// # Panics
    ///
    /// Panics if the rule is malformed or its name is taken.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn rule(mut self, rule: SyncRule) -> Self {
        self.syncs
            .register(rule)
            .expect("rule registration should succeed in tests");
        self
    }

    /// Use a custom engine configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    ///
    /// # Panics
    ///
    /// Panics if a rule references an unregistered operation.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn build(self) -> Engine {
        Engine::with_config(
            Arc::new(self.operations.build()),
            Arc::new(self.syncs),
            self.config,
        )
        .expect("rules should only reference registered operations")
    }
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Invocations of `op` in `history`, in order
#[must_use]
pub fn invocations_of(history: &[Arc<Invocation>], op: OperationRef) -> Vec<Arc<Invocation>> {
    history.iter().filter(|i| i.op == op).cloned().collect()
}

/// Wait up to `timeout` for the next broadcast invocation of `op`.
///
/// Returns `None` on timeout or when the channel closes.
pub async fn next_invocation(
    receiver: &mut broadcast::Receiver<Arc<Invocation>>,
    op: OperationRef,
    timeout: Duration,
) -> Option<Arc<Invocation>> {
    tokio::time::timeout(timeout, async {
        loop {
            match receiver.recv().await {
                Ok(invocation) if invocation.op == op => return Some(invocation),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
