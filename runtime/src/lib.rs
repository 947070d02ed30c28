//! # Concept Sync Runtime
//!
//! Runtime for concept-sync applications.
//!
//! This crate turns the declarative pieces of `concept-sync-core` into a
//! running system: it evaluates sync rules against every completed action
//! and bridges a synchronous request/response boundary onto the resulting
//! asynchronous cascades.
//!
//! ## Core Components
//!
//! - **Engine** ([`engine`]): the sync dispatcher; records invocations and fires matching rules
//! - **Flow** ([`flow`]): the causal scope multi-trigger rules join within
//! - **Requesting** ([`requesting`]): the correlation bridge (open / resolve / await)
//! - **Metrics** ([`metrics`]): Prometheus exporter and metric descriptions
//!
//! ## Example
//!
//! ```ignore
//! use concept_sync_runtime::{Engine, Requesting, RequestingConfig};
//!
//! let requesting = Arc::new(Requesting::new(RequestingConfig::from_env()?));
//! let mut ops = OperationRegistry::builder();
//! ops.concept(Arc::clone(&requesting))?.concept(items)?;
//!
//! let engine = Engine::new(Arc::new(ops.build()), Arc::new(syncs))?;
//! let reply = requesting
//!     .handle(&engine, payload, requesting.config().timeout, &CancellationToken::new())
//!     .await?;
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sync dispatcher
pub mod engine;

/// Flow-scoped invocation history
pub mod flow;

/// Correlation bridge between the request boundary and sync cascades
pub mod requesting;

/// Prometheus metrics for observability
pub mod metrics;

pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use flow::Flow;
pub use requesting::{
    ConfigError, InMemoryResponseStore, RequestId, RequestRecord, Requesting, RequestingConfig,
    RequestingError, ResponseStore, ResponseStoreError,
};

/// Error types for the engine
pub mod error {
    use concept_sync_core::SyncError;
    use thiserror::Error;

    /// Errors raised by the [`Engine`](crate::Engine) itself.
    ///
    /// Concept-level failures are never engine errors; they travel as
    /// [`Failure`](concept_sync_core::Failure) values inside an
    /// [`ActionResult`](concept_sync_core::ActionResult).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EngineError {
        /// The engine is shutting down and not accepting new flows
        #[error("Engine is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for cascades to complete
        #[error("Shutdown timed out with {0} flows still running")]
        ShutdownTimeout(usize),

        /// The rule set does not fit the operation registry
        #[error(transparent)]
        Sync(#[from] SyncError),
    }
}

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but under pressure (e.g. many pending requests)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for one component
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Metadata such as counters and sizes
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report, served by the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Combine component checks into one report
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// Guard that decrements an atomic counter on drop (for shutdown tracking)
pub(crate) struct AtomicCounterGuard(Arc<AtomicUsize>);

impl AtomicCounterGuard {
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn report_takes_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("engine"),
            HealthCheck::degraded("requesting", "many pending requests"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.is_healthy());
        assert!(HealthStatus::Healthy < HealthStatus::Unhealthy);
    }

    #[test]
    fn counter_guard_restores_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _a = AtomicCounterGuard::acquire(&counter);
            let _b = AtomicCounterGuard::acquire(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn health_check_serializes_lowercase_status() {
        let check = HealthCheck::healthy("engine").with_metadata("rules", "3");
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json.get("message").is_none());
    }
}
