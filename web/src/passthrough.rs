//! Which operations are callable directly over HTTP.
//!
//! Every registered operation is exposed as `POST {base}/{Concept}/{name}`
//! unless it is excluded. Excluded operations fall back to the requesting
//! route, where sync rules decide what happens (authorization included).
//! Inclusions carry a justification; operations that are neither included
//! nor excluded are still exposed but are reported as unverified at startup.

use concept_sync_core::{OperationKind, OperationRef, OperationRegistry};
use std::collections::{BTreeMap, BTreeSet};

/// Concept whose operations are never exposed as passthrough routes.
pub const REQUESTING_CONCEPT: &str = "Requesting";

/// Passthrough inclusions and exclusions, keyed by `Concept/name`.
#[derive(Debug, Clone, Default)]
pub struct PassthroughPolicy {
    inclusions: BTreeMap<String, String>,
    exclusions: BTreeSet<String>,
}

/// One exposed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughRoute {
    /// Operation behind the route
    pub op: OperationRef,
    /// Action or query
    pub kind: OperationKind,
    /// Justification, if the route was explicitly included
    pub justification: Option<String>,
}

impl PassthroughPolicy {
    /// Empty policy: everything exposed, nothing verified
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `route` deliberately, with a reason
    #[must_use]
    pub fn include(mut self, route: impl Into<String>, justification: impl Into<String>) -> Self {
        self.inclusions.insert(route.into(), justification.into());
        self
    }

    /// Keep `route` behind the requesting route
    #[must_use]
    pub fn exclude(mut self, route: impl Into<String>) -> Self {
        self.exclusions.insert(route.into());
        self
    }

    /// Whether `op` is exposed
    #[must_use]
    pub fn exposes(&self, op: OperationRef) -> bool {
        op.concept != REQUESTING_CONCEPT && !self.exclusions.contains(&op.route())
    }

    /// Exposed routes in registry order (sorted by operation).
    ///
    /// Unverified routes are logged at `warn`.
    #[must_use]
    pub fn routes(&self, operations: &OperationRegistry) -> Vec<PassthroughRoute> {
        let routes: Vec<_> = operations
            .operations()
            .into_iter()
            .filter(|(op, _)| self.exposes(*op))
            .map(|(op, kind)| PassthroughRoute {
                op,
                kind,
                justification: self.inclusions.get(&op.route()).cloned(),
            })
            .collect();

        for route in routes.iter().filter(|r| r.justification.is_none()) {
            tracing::warn!(op = %route.op, "Unverified passthrough route");
        }
        for stale in self
            .inclusions
            .keys()
            .chain(self.exclusions.iter())
            .filter(|route| !operations.operations().iter().any(|(op, _)| op.route() == **route))
        {
            tracing::warn!(route = %stale, "Passthrough policy names an unknown operation");
        }
        routes
    }
}
