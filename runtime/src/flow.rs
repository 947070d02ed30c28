//! Flow-scoped invocation history.
//!
//! A flow is the causal tree grown from one root call. Every invocation made
//! while cascading inherits the flow of the invocation that triggered it, and
//! a rule with several trigger patterns only joins invocations of one flow.
//! History is dropped with the flow, so unrelated requests never satisfy each
//! other's triggers.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::AtomicCounterGuard;
use concept_sync_core::{
    ActionResult, FlowId, Frame, Frames, Invocation, InvocationId, OperationRef, Pattern, Record,
    SyncRule,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared state of one flow.
#[derive(Debug)]
pub(crate) struct FlowState {
    id: FlowId,
    inner: Mutex<FlowInner>,
}

#[derive(Debug, Default)]
struct FlowInner {
    history: Vec<Arc<Invocation>>,
    /// `(rule, sorted set of matched invocations)` combinations already fired
    fired: HashSet<(&'static str, Vec<InvocationId>)>,
}

impl FlowState {
    pub(crate) fn new() -> Self {
        Self {
            id: FlowId::new(),
            inner: Mutex::new(FlowInner::default()),
        }
    }

    pub(crate) const fn id(&self) -> FlowId {
        self.id
    }

    pub(crate) fn push(&self, invocation: Arc<Invocation>) {
        self.lock().history.push(invocation);
    }

    pub(crate) fn history(&self) -> Vec<Arc<Invocation>> {
        self.lock().history.clone()
    }

    /// Frames for every not-yet-fired way `invocation` completes `rule`'s
    /// triggers, claiming each combination so it fires at most once.
    pub(crate) fn claim(&self, rule: &SyncRule, invocation: &Invocation) -> Frames {
        let mut inner = self.lock();
        let candidates = join(rule.when(), invocation, &inner.history);
        candidates
            .into_iter()
            .filter_map(|(frame, mut ids)| {
                ids.sort_unstable();
                inner.fired.insert((rule.name(), ids)).then_some(frame)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Inner join of `patterns` over `history`, anchored on `invocation`.
///
/// Each result binds `invocation` to one position whose operation equals its
/// own; the other positions range over `history`. No invocation fills two
/// positions of one result. The returned ids are listed per position.
fn join(
    patterns: &[Pattern],
    invocation: &Invocation,
    history: &[Arc<Invocation>],
) -> Vec<(Frame, Vec<InvocationId>)> {
    let mut results = Vec::new();
    for (anchor, pattern) in patterns.iter().enumerate() {
        if pattern.op != invocation.op {
            continue;
        }
        let mut partial = vec![(Frame::new(), Vec::with_capacity(patterns.len()))];
        for (position, pattern) in patterns.iter().enumerate() {
            let mut next = Vec::new();
            for (frame, ids) in &partial {
                if position == anchor {
                    extend_with(&mut next, pattern, frame, ids, invocation);
                } else {
                    for candidate in history.iter().filter(|c| {
                        c.op == pattern.op && c.id != invocation.id && !ids.contains(&c.id)
                    }) {
                        extend_with(&mut next, pattern, frame, ids, candidate);
                    }
                }
            }
            partial = next;
            if partial.is_empty() {
                break;
            }
        }
        results.extend(partial);
    }
    results
}

fn extend_with(
    out: &mut Vec<(Frame, Vec<InvocationId>)>,
    pattern: &Pattern,
    frame: &Frame,
    ids: &[InvocationId],
    invocation: &Invocation,
) {
    if let Some(frame) = pattern.bind(frame, invocation) {
        let mut ids = ids.to_vec();
        ids.push(invocation.id);
        out.push((frame, ids));
    }
}

/// Handle to one flow, for running several root calls in the same causal scope.
///
/// Obtained from [`Engine::flow`]. Every call made through the same handle
/// shares one invocation history, so a rule whose triggers span those calls
/// can fire once all of them have completed.
///
/// ```ignore
/// let flow = engine.flow();
/// flow.invoke(A, record(json!({ "x": 5 }))).await?;
/// flow.invoke(B, record(json!({ "y": 7 }))).await?;
/// ```
#[derive(Clone)]
pub struct Flow {
    engine: Engine,
    state: Arc<FlowState>,
}

impl Flow {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            engine,
            state: Arc::new(FlowState::new()),
        }
    }

    /// Flow identifier
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.state.id()
    }

    /// Invoke an action inside this flow and run its cascade to completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownInProgress`] once shutdown has begun.
    pub async fn invoke(&self, op: OperationRef, input: Record) -> Result<ActionResult, EngineError> {
        let _guard: AtomicCounterGuard = self.engine.enter()?;
        Ok(self.engine.run(&self.state, op, input, 0).await)
    }

    /// Invocations recorded so far, in completion order
    #[must_use]
    pub fn history(&self) -> Vec<Arc<Invocation>> {
        self.state.history()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow").field("id", &self.state.id()).finish()
    }
}
