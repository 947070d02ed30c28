//! Scripted concepts and failing stores.
//!
//! [`ScriptedConcept`] stands in for a real concept: each action or query is
//! a plain closure, and every call is captured for later assertions.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use concept_sync_core::{
    ActionResult, Concept, OperationRef, OperationRegistryBuilder, QueryResult, Record,
    RegistryError,
};
use concept_sync_runtime::{
    InMemoryResponseStore, RequestId, RequestRecord, ResponseStore, ResponseStoreError,
};
use futures::future;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

type ActionFn = Arc<dyn Fn(&Record) -> ActionResult + Send + Sync>;
type QueryFn = Arc<dyn Fn(&Record) -> QueryResult + Send + Sync>;

/// A concept whose operations are closures.
///
/// # Example
///
/// ```
/// use concept_sync_core::{record, OperationRef, OperationRegistry};
/// use concept_sync_testing::ScriptedConcept;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// const CREATE: OperationRef = OperationRef::new("Item", "createItem");
/// const BY_OWNER: OperationRef = OperationRef::new("Item", "_getItemsByOwner");
///
/// let items = Arc::new(
///     ScriptedConcept::new("Item")
///         .echo(CREATE)
///         .table(BY_OWNER, vec![record(json!({ "owner": "u1", "item": "i1" }))]),
/// );
/// let mut ops = OperationRegistry::builder();
/// ops.concept(Arc::clone(&items)).unwrap();
/// assert!(ops.build().contains(CREATE));
/// ```
#[derive(Clone)]
pub struct ScriptedConcept {
    name: &'static str,
    actions: Vec<(OperationRef, ActionFn)>,
    queries: Vec<(OperationRef, QueryFn)>,
    calls: Arc<Mutex<Vec<(OperationRef, Record)>>>,
}

impl ScriptedConcept {
    /// Concept with no operations
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            actions: Vec::new(),
            queries: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add an action answered by `handler`
    #[must_use]
    pub fn action<F>(mut self, op: OperationRef, handler: F) -> Self
    where
        F: Fn(&Record) -> ActionResult + Send + Sync + 'static,
    {
        self.actions.push((op, Arc::new(handler)));
        self
    }

    /// Add an action that returns its input unchanged
    #[must_use]
    pub fn echo(self, op: OperationRef) -> Self {
        self.action(op, |input| Ok(input.clone()))
    }

    /// Add a query answered by `handler`
    #[must_use]
    pub fn query<F>(mut self, op: OperationRef, handler: F) -> Self
    where
        F: Fn(&Record) -> QueryResult + Send + Sync + 'static,
    {
        self.queries.push((op, Arc::new(handler)));
        self
    }

    /// Add a query over a fixed table: returns the rows whose fields equal
    /// every field of the input, in table order.
    #[must_use]
    pub fn table(self, op: OperationRef, rows: Vec<Record>) -> Self {
        self.query(op, move |input| {
            Ok(rows
                .iter()
                .filter(|row| input.iter().all(|(k, v)| row.get(k) == Some(v)))
                .cloned()
                .collect())
        })
    }

    /// Every call so far, in call order
    #[must_use]
    pub fn calls(&self) -> Vec<(OperationRef, Record)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inputs of the calls made to `op`
    #[must_use]
    pub fn calls_to(&self, op: OperationRef) -> Vec<Record> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| *called == op)
            .map(|(_, input)| input)
            .collect()
    }
}

impl Concept for ScriptedConcept {
    fn name(&self) -> &'static str {
        self.name
    }

    fn register(self: Arc<Self>, ops: &mut OperationRegistryBuilder) -> Result<(), RegistryError> {
        for (op, handler) in &self.actions {
            let (op, handler, calls) = (*op, Arc::clone(handler), Arc::clone(&self.calls));
            ops.action(op, move |input| {
                let output = handler(&input);
                calls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((op, input));
                future::ready(output)
            })?;
        }
        for (op, handler) in &self.queries {
            let (op, handler, calls) = (*op, Arc::clone(handler), Arc::clone(&self.calls));
            ops.query(op, move |input| {
                let output = handler(&input);
                calls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((op, input));
                future::ready(output)
            })?;
        }
        Ok(())
    }
}

/// A [`ResponseStore`] that fails on demand.
///
/// [`FailingResponseStore::new`] fails every operation.
/// [`FailingResponseStore::on_responses`] stores requests in memory and only
/// fails when a response is mirrored.
#[derive(Debug, Default)]
pub struct FailingResponseStore {
    requests: Option<InMemoryResponseStore>,
}

impl FailingResponseStore {
    /// Every operation fails
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `save_response` fails
    #[must_use]
    pub fn on_responses() -> Self {
        Self {
            requests: Some(InMemoryResponseStore::new()),
        }
    }

    fn fail<T: Send + 'static>() -> Pin<Box<dyn Future<Output = Result<T, ResponseStoreError>> + Send + 'static>> {
        Box::pin(future::ready(Err(ResponseStoreError::Backend(
            "store unavailable".to_string(),
        ))))
    }
}

impl ResponseStore for FailingResponseStore {
    fn save_request(
        &self,
        request: RequestId,
        input: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>> {
        match &self.requests {
            Some(requests) => requests.save_request(request, input),
            None => Self::fail(),
        }
    }

    fn save_response(
        &self,
        _request: RequestId,
        _response: Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResponseStoreError>> + Send + '_>> {
        Self::fail()
    }

    fn get(
        &self,
        request: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestRecord>, ResponseStoreError>> + Send + '_>>
    {
        match &self.requests {
            Some(requests) => requests.get(request),
            None => Self::fail(),
        }
    }
}
