//! The correlation bridge between a request/response boundary and sync cascades.
//!
//! Every inbound call is opened under a fresh [`RequestId`]. The boundary then
//! suspends in [`Requesting::await_response`] while the engine cascades from
//! the `Requesting.request` invocation; eventually some rule invokes
//! `Requesting.respond` with that id and the waiter wakes with the payload.
//!
//! Each pending entry owns a oneshot channel. `resolve` takes the sender (so
//! only the first resolve has an effect), `await_response` takes the receiver
//! (so only one waiter exists), and the waiter deletes the entry on every exit
//! path: response, timeout, cancellation, or the awaiting future being
//! dropped. A resolve that arrives before the await is held by the channel; a
//! resolve that arrives after the entry is gone is a no-op.

use crate::engine::Engine;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use concept_sync_core::{
    record, ActionResult, Concept, Failure, OperationRef, OperationRegistryBuilder, QueryResult,
    Record, RegistryError, Value,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// `Requesting.request`: open a request. Input is the payload, output `{ "request": id }`.
pub const REQUEST: OperationRef = OperationRef::new("Requesting", "request");

/// `Requesting.respond`: answer a request. Input `{ "request": id, ..payload }`.
pub const RESPOND: OperationRef = OperationRef::new("Requesting", "respond");

/// `Requesting._getResponse`: read the audit record of a request.
pub const GET_RESPONSE: OperationRef = OperationRef::new("Requesting", "_getResponse");

/// Correlation identifier of one inbound call. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Allocate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Read an identifier from a JSON string value
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }

    /// The identifier as a JSON value
    #[must_use]
    pub fn to_value(self) -> Value {
        Value::String(self.0.to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Errors surfaced to the caller of the bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestingError {
    /// No live pending entry: never opened, already consumed, or already awaited
    #[error("Request {0} is not pending or does not exist")]
    UnknownRequest(RequestId),

    /// No response arrived in time
    #[error("Request {request} timed out after {timeout_ms}ms")]
    Timeout {
        /// Request that timed out
        request: RequestId,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The caller went away before a response arrived
    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    /// The response channel closed without a value
    #[error("Request {0} was closed without a response")]
    Closed(RequestId),

    /// The `Requesting.request` action itself failed
    #[error("Request was rejected: {0}")]
    Rejected(Failure),

    /// The audit store failed
    #[error(transparent)]
    Store(#[from] ResponseStoreError),

    /// The engine refused the request
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RequestingError {
    /// Whether this is a timeout (the boundary answers these distinctly)
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from a [`ResponseStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseStoreError {
    /// The storage backend failed
    #[error("Response store failed: {0}")]
    Backend(String),
}

/// Audit record of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Request identifier
    pub request: RequestId,
    /// Payload the request was opened with
    pub input: Record,
    /// Response, once one has been mirrored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Record>,
    /// When the request was opened
    pub created_at: DateTime<Utc>,
}

/// Durable audit trail of requests and their responses.
pub trait ResponseStore: Send + Sync {
    /// Store a newly opened request.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseStoreError`] if the backend fails.
    fn save_request(
        &self,
        request: RequestId,
        input: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>>;

    /// Attach a response to a stored request. Unknown requests are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseStoreError`] if the backend fails.
    fn save_response(
        &self,
        request: RequestId,
        response: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>>;

    /// Load a stored request.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseStoreError`] if the backend fails.
    fn get(
        &self,
        request: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestRecord>, ResponseStoreError>> + Send + '_>>;
}

/// In-memory [`ResponseStore`], lost on restart.
///
/// Keeps at most `capacity` requests; opening one more evicts the oldest.
/// Deployments that need the full audit trail supply a durable store through
/// [`Requesting::with_store`].
#[derive(Debug)]
pub struct InMemoryResponseStore {
    records: RwLock<Retained>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Retained {
    by_id: HashMap<RequestId, RequestRecord>,
    oldest_first: VecDeque<RequestId>,
}

impl InMemoryResponseStore {
    /// Requests retained by [`Self::new`]
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Empty store retaining [`Self::DEFAULT_CAPACITY`] requests
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Empty store retaining at most `capacity` requests (at least one)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(Retained::default()),
            capacity: capacity.max(1),
        }
    }

    /// Retention bound
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored requests
    pub async fn len(&self) -> usize {
        self.records.read().await.by_id.len()
    }

    /// Whether nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.by_id.is_empty()
    }
}

impl Default for InMemoryResponseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseStore for InMemoryResponseStore {
    fn save_request(
        &self,
        request: RequestId,
        input: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let stored = RequestRecord {
                request,
                input,
                response: None,
                created_at: Utc::now(),
            };
            if records.by_id.insert(request, stored).is_none() {
                records.oldest_first.push_back(request);
            }
            while records.by_id.len() > self.capacity {
                let Some(evicted) = records.oldest_first.pop_front() else {
                    break;
                };
                records.by_id.remove(&evicted);
                tracing::trace!(request = %evicted, "Evicted audit record");
            }
            Ok(())
        })
    }

    fn save_response(
        &self,
        request: RequestId,
        response: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(stored) = self.records.write().await.by_id.get_mut(&request) {
                stored.response = Some(response);
            }
            Ok(())
        })
    }

    fn get(
        &self,
        request: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestRecord>, ResponseStoreError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.records.read().await.by_id.get(&request).cloned()) })
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestingConfig {
    /// How long the boundary waits for a response
    pub timeout: Duration,
    /// Whether responses are mirrored into the audit store
    pub save_responses: bool,
}

impl RequestingConfig {
    /// Set the response timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable response mirroring
    #[must_use]
    pub const fn with_save_responses(mut self, save: bool) -> Self {
        self.save_responses = save;
        self
    }

    /// Load from `REQUESTING_TIMEOUT` (milliseconds) and
    /// `REQUESTING_SAVE_RESPONSES`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup (used by [`Self::from_env`] and tests).
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("REQUESTING_TIMEOUT") {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "REQUESTING_TIMEOUT",
                value: raw.clone(),
            })?;
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("REQUESTING_SAVE_RESPONSES") {
            config.save_responses = match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "REQUESTING_SAVE_RESPONSES",
                        value: raw,
                    });
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationError("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for RequestingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            save_responses: true,
        }
    }
}

struct Pending {
    sender: Option<oneshot::Sender<Record>>,
    receiver: Option<oneshot::Receiver<Record>>,
}

type PendingTable = Mutex<HashMap<RequestId, Pending>>;

/// Deletes a pending entry when the waiter finishes, however it finishes.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    request: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let removed = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request);
        if removed.is_some() {
            metrics::gauge!("requesting_pending").decrement(1.0);
        }
    }
}

/// The correlation bridge, also registered as the `Requesting` concept.
pub struct Requesting {
    pending: PendingTable,
    store: Arc<dyn ResponseStore>,
    config: RequestingConfig,
}

impl Requesting {
    /// Bridge with an in-memory audit store
    #[must_use]
    pub fn new(config: RequestingConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryResponseStore::new()))
    }

    /// Bridge with a custom audit store
    #[must_use]
    pub fn with_store(config: RequestingConfig, store: Arc<dyn ResponseStore>) -> Self {
        tracing::info!(timeout = ?config.timeout, "Requesting initialized");
        Self {
            pending: Mutex::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &RequestingConfig {
        &self.config
    }

    /// Audit store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ResponseStore> {
        &self.store
    }

    /// Open a pending entry for `payload`. Does not block on any response.
    ///
    /// This only creates the entry; [`Self::handle`] opens through the engine
    /// so the `Requesting.request` invocation is recorded and rules react.
    ///
    /// # Errors
    ///
    /// Returns [`RequestingError::Store`] if the request cannot be saved.
    pub async fn open(&self, payload: Record) -> Result<RequestId, RequestingError> {
        let request = RequestId::new();
        self.store.save_request(request, payload).await?;

        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            request,
            Pending {
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
        metrics::counter!("requesting_opened_total").increment(1);
        metrics::gauge!("requesting_pending").increment(1.0);
        tracing::debug!(%request, "Opened request");
        Ok(request)
    }

    /// Fulfil a pending request with `payload`.
    ///
    /// Returns whether the payload was handed to the entry. Unknown ids and
    /// repeated resolves are silently ignored.
    pub fn resolve(&self, request: RequestId, payload: Record) -> bool {
        let sender = self
            .lock()
            .get_mut(&request)
            .and_then(|pending| pending.sender.take());
        let Some(sender) = sender else {
            tracing::debug!(%request, "Ignoring response for request that is not pending");
            return false;
        };
        if sender.send(payload).is_err() {
            tracing::debug!(%request, "Waiter is gone, dropping response");
            return false;
        }
        metrics::counter!("requesting_resolved_total").increment(1);
        true
    }

    /// Wait for the response to `request`, for at most `timeout`.
    ///
    /// The pending entry is deleted before this returns, whatever the
    /// outcome, so a request can be awaited at most once.
    ///
    /// # Errors
    ///
    /// - [`RequestingError::UnknownRequest`] if no live entry exists or it is already awaited
    /// - [`RequestingError::Timeout`] if nothing arrived within `timeout`
    /// - [`RequestingError::Cancelled`] if `cancel` fired first
    /// - [`RequestingError::Closed`] if the channel closed without a value
    pub async fn await_response(
        &self,
        request: RequestId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Record, RequestingError> {
        let receiver = self
            .lock()
            .get_mut(&request)
            .and_then(|pending| pending.receiver.take());
        let Some(receiver) = receiver else {
            return Err(RequestingError::UnknownRequest(request));
        };
        let _guard = PendingGuard {
            table: &self.pending,
            request,
        };

        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            received = receiver => received.map_err(|_| RequestingError::Closed(request)),
            () = cancel.cancelled() => Err(RequestingError::Cancelled(request)),
            () = tokio::time::sleep(timeout) => Err(RequestingError::Timeout {
                request,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };
        metrics::histogram!("requesting_wait_duration_seconds").record(start.elapsed().as_secs_f64());

        match &outcome {
            Ok(_) => tracing::debug!(%request, "Request answered"),
            Err(RequestingError::Timeout { timeout_ms, .. }) => {
                metrics::counter!("requesting_timeouts_total").increment(1);
                tracing::warn!(%request, timeout_ms, "Request timed out");
            }
            Err(RequestingError::Cancelled(_)) => {
                metrics::counter!("requesting_cancelled_total").increment(1);
                tracing::info!(%request, "Request cancelled");
            }
            Err(e) => tracing::warn!(%request, error = %e, "Request failed"),
        }
        outcome
    }

    /// Serve one inbound call: record `Requesting.request` through the
    /// engine, then wait for the response the cascade produces.
    ///
    /// # Errors
    ///
    /// Returns [`RequestingError::Rejected`] if the request action fails,
    /// [`RequestingError::Engine`] if the engine refuses the flow, and the
    /// errors of [`Self::await_response`].
    #[tracing::instrument(skip_all, fields(path = payload.get("path").and_then(concept_sync_core::Value::as_str).unwrap_or("")))]
    pub async fn handle(
        &self,
        engine: &Engine,
        payload: Record,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Record, RequestingError> {
        tracing::info!("Received request");
        let output = engine.submit(REQUEST, payload).await?.map_err(RequestingError::Rejected)?;
        let request = output
            .get("request")
            .and_then(RequestId::from_value)
            .ok_or_else(|| RequestingError::Rejected(Failure::new("request action returned no id")))?;
        self.await_response(request, timeout, cancel).await
    }

    /// Number of requests currently pending
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `request` has a live pending entry
    #[must_use]
    pub fn is_pending(&self, request: RequestId) -> bool {
        self.lock().contains_key(&request)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request(self: Arc<Self>, input: Record) -> ActionResult {
        let request = self
            .open(input)
            .await
            .map_err(|e| Failure::new(e.to_string()))?;
        Ok(record(json!({ "request": request })))
    }

    async fn respond(self: Arc<Self>, mut input: Record) -> ActionResult {
        let request = input
            .remove("request")
            .as_ref()
            .and_then(RequestId::from_value)
            .ok_or_else(|| Failure::new("respond requires a valid request id"))?;
        let mirror = self.config.save_responses.then(|| input.clone());
        self.resolve(request, input);
        // The waiter already has its payload; a mirror failure only fails the audit
        if let Some(response) = mirror {
            if let Err(e) = self.store.save_response(request, response).await {
                tracing::warn!(%request, error = %e, "Failed to mirror response");
                return Err(Failure::new(e.to_string()));
            }
        }
        Ok(record(json!({ "request": request })))
    }

    async fn get_response(self: Arc<Self>, input: Record) -> QueryResult {
        let Some(request) = input.get("request").and_then(RequestId::from_value) else {
            return Ok(Vec::new());
        };
        let stored = self
            .store
            .get(request)
            .await
            .map_err(|e| Failure::new(e.to_string()))?;
        Ok(stored
            .and_then(|r| serde_json::to_value(r).ok())
            .map(record)
            .into_iter()
            .collect())
    }
}

impl Concept for Requesting {
    fn name(&self) -> &'static str {
        "Requesting"
    }

    fn register(self: Arc<Self>, ops: &mut OperationRegistryBuilder) -> Result<(), RegistryError> {
        ops.action_on(&self, REQUEST, Self::request)?
            .action_on(&self, RESPOND, Self::respond)?
            .query_on(&self, GET_RESPONSE, Self::get_response)?;
        Ok(())
    }
}

impl fmt::Debug for Requesting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requesting")
            .field("pending", &self.pending_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
