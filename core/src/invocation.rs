//! Invocation records: the facts rules react to.
//!
//! An [`Invocation`] is one completed action call. Every invocation belongs to
//! a [`FlowId`]: the causal tree started by one root call (typically an
//! inbound `Requesting.request`). Rule firings inherit the flow of the
//! invocation that triggered them, and multi-pattern triggers only join
//! invocations of the same flow.

use crate::operation::OperationRef;
use crate::value::{ActionResult, Record};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing invocation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InvocationId(u64);

impl InvocationId {
    /// Allocate the next id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of one causal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Start a new flow
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One completed action call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    /// Unique id
    pub id: InvocationId,
    /// Flow this invocation belongs to
    pub flow: FlowId,
    /// Operation that was called
    pub op: OperationRef,
    /// Concrete input
    pub input: Record,
    /// Concrete output, or the structured failure
    pub output: ActionResult,
    /// Completion time
    pub at: DateTime<Utc>,
}

impl Invocation {
    /// Record a completed call, stamping it with a fresh id and the current time
    #[must_use]
    pub fn new(flow: FlowId, op: OperationRef, input: Record, output: ActionResult) -> Self {
        Self {
            id: InvocationId::next(),
            flow,
            op,
            input,
            output,
            at: Utc::now(),
        }
    }

    /// Whether the call succeeded
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.output.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Failure;

    #[test]
    fn ids_increase() {
        let a = InvocationId::next();
        let b = InvocationId::next();
        assert!(b > a);
    }

    #[test]
    fn invocation_records_outcome() {
        let op = OperationRef::new("Item", "deleteItem");
        let inv = Invocation::new(FlowId::new(), op, Record::new(), Err(Failure::new("not owner")));
        assert!(!inv.succeeded());
        assert_ne!(FlowId::new(), inv.flow);
    }
}
