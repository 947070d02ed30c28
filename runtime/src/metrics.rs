//! Prometheus metrics for the sync engine and the request bridge.
//!
//! Components record through the `metrics` facade; this module installs the
//! Prometheus recorder and describes every metric the runtime emits:
//! - Invocations recorded and rules fired by the engine
//! - Rule-fired action failures and cascade cut-offs
//! - Requests opened, resolved, timed out and cancelled
//!
//! # Example
//!
//! ```rust,no_run
//! use concept_sync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Scrape output
//! let text = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the runtime.
///
/// The HTTP boundary renders [`MetricsServer::render`] on its own
/// `/metrics` route; `addr` is the address that route is advertised on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsServer")
            .field("addr", &self.addr)
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. A second call (as
    /// happens across tests) logs a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address metrics are advertised on
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Engine
    describe_counter!(
        "sync_invocations_recorded_total",
        "Total number of action invocations recorded"
    );
    describe_counter!(
        "sync_rules_fired_total",
        "Total number of sync rule firings, labelled by rule"
    );
    describe_counter!(
        "sync_action_failures_total",
        "Total number of rule-fired actions that returned a failure"
    );
    describe_counter!(
        "sync_cascade_depth_exceeded_total",
        "Total number of cascades cut short by the depth limit"
    );
    describe_histogram!(
        "sync_action_duration_seconds",
        "Time taken to run one action handler"
    );

    // Requesting
    describe_counter!(
        "requesting_opened_total",
        "Total number of inbound requests opened"
    );
    describe_counter!(
        "requesting_resolved_total",
        "Total number of responses delivered to a waiting request"
    );
    describe_counter!(
        "requesting_timeouts_total",
        "Total number of requests that timed out"
    );
    describe_counter!(
        "requesting_cancelled_total",
        "Total number of requests released by cancellation"
    );
    describe_gauge!(
        "requesting_pending",
        "Number of requests currently awaiting a response"
    );
    describe_histogram!(
        "requesting_wait_duration_seconds",
        "Time between awaiting a request and its outcome"
    );
}
