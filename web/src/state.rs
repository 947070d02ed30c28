//! Application state for Axum handlers.

use crate::config::ServerConfig;
use concept_sync_runtime::metrics::MetricsServer;
use concept_sync_runtime::{Engine, Requesting};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application state shared across all HTTP handlers.
///
/// Cheap to clone: every field is reference-counted.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Sync dispatcher every route goes through
    pub engine: Engine,
    /// Correlation bridge behind the requesting route
    pub requesting: Arc<Requesting>,
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Cancelled on shutdown; releases every waiting request
    pub shutdown: CancellationToken,
    /// Prometheus recorder rendered on `/metrics`, when installed
    pub metrics: Option<Arc<MetricsServer>>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// `requesting` must be the instance registered with `engine`'s
    /// operation registry, otherwise responses never reach their waiters.
    #[must_use]
    pub fn new(engine: Engine, requesting: Arc<Requesting>, config: ServerConfig) -> Self {
        Self {
            engine,
            requesting,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Serve `metrics` on `/metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsServer) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }
}
