//! Operation registry: the catalogue of actions and queries exposed by concepts.
//!
//! Concepts never call one another. Each one registers its operations here
//! as typed async handlers, and everything else (the sync engine, the HTTP
//! boundary) reaches them through an [`OperationRef`].
//!
//! # Example
//!
//! ```ignore
//! use concept_sync_core::operation::{OperationRef, OperationRegistry};
//!
//! const CREATE_ITEM: OperationRef = OperationRef::new("Item", "createItem");
//! const GET_ITEM: OperationRef = OperationRef::new("Item", "_getItemById");
//!
//! let mut builder = OperationRegistry::builder();
//! builder
//!     .action(CREATE_ITEM, |input| async move { Ok(input) })?
//!     .query(GET_ITEM, |_input| async move { Ok(vec![]) })?;
//! let registry = builder.build();
//! ```

use crate::value::{ActionResult, Failure, QueryResult, Record};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Reference to a callable operation: `(concept, name)`.
///
/// Query names start with an underscore (`_getItemById`); action names do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationRef {
    /// Concept (module) exposing the operation
    pub concept: &'static str,
    /// Operation name within the concept
    pub name: &'static str,
}

impl OperationRef {
    /// Create an operation reference
    #[must_use]
    pub const fn new(concept: &'static str, name: &'static str) -> Self {
        Self { concept, name }
    }

    /// Kind implied by the naming convention
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        if self.name.starts_with('_') {
            OperationKind::Query
        } else {
            OperationKind::Action
        }
    }

    /// Route form: `Concept/name`
    #[must_use]
    pub fn route(&self) -> String {
        format!("{}/{}", self.concept, self.name)
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.concept, self.name)
    }
}

/// Whether an operation changes state (action) or only reads it (query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationKind {
    /// State-changing operation; its completions are invocation facts
    Action,
    /// Read-only lookup returning a list of records
    Query,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Action => write!(f, "action"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// Type-erased action handler
pub type ActionHandler = Arc<dyn Fn(Record) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Type-erased query handler
pub type QueryHandler = Arc<dyn Fn(Record) -> BoxFuture<'static, QueryResult> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Action(ActionHandler),
    Query(QueryHandler),
}

impl Handler {
    const fn kind(&self) -> OperationKind {
        match self {
            Self::Action(_) => OperationKind::Action,
            Self::Query(_) => OperationKind::Query,
        }
    }
}

/// Errors raised while building an [`OperationRegistry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The operation was registered twice
    #[error("operation {0} is already registered")]
    Duplicate(OperationRef),

    /// Handler kind disagrees with the naming convention
    #[error("operation {op} registered as {registered}, but its name implies a {expected}")]
    KindMismatch {
        /// Offending operation
        op: OperationRef,
        /// Kind the caller tried to register
        registered: OperationKind,
        /// Kind implied by the name
        expected: OperationKind,
    },
}

/// An independent module exposing actions and queries.
///
/// Implementors register each operation explicitly; nothing is discovered
/// by reflection.
///
/// ```ignore
/// impl Concept for ItemConcept {
///     fn name(&self) -> &'static str { "Item" }
///
///     fn register(
///         self: Arc<Self>,
///         ops: &mut OperationRegistryBuilder,
///     ) -> Result<(), RegistryError> {
///         ops.action_on(&self, CREATE_ITEM, Self::create_item)?
///             .query_on(&self, GET_ITEM, Self::get_item)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Concept: Send + Sync + 'static {
    /// Concept name (first half of every [`OperationRef`] it registers)
    fn name(&self) -> &'static str;

    /// Register this concept's operations.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if an operation is duplicated or misnamed.
    fn register(self: Arc<Self>, ops: &mut OperationRegistryBuilder) -> Result<(), RegistryError>;
}

/// Seam used by the frame engine to run lookups.
pub trait QueryInvoker: Send + Sync {
    /// Run a query operation
    fn call_query(&self, op: OperationRef, input: Record) -> BoxFuture<'_, QueryResult>;
}

/// Builder for an [`OperationRegistry`].
#[derive(Default)]
pub struct OperationRegistryBuilder {
    handlers: HashMap<OperationRef, Handler>,
    concepts: Vec<&'static str>,
}

impl OperationRegistryBuilder {
    /// Register an action handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if `op` is already registered or names a query.
    pub fn action<F, Fut>(&mut self, op: OperationRef, handler: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |input| handler(input).boxed());
        self.insert(op, Handler::Action(handler))
    }

    /// Register a query handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if `op` is already registered or names an action.
    pub fn query<F, Fut>(&mut self, op: OperationRef, handler: F) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueryResult> + Send + 'static,
    {
        let handler: QueryHandler = Arc::new(move |input| handler(input).boxed());
        self.insert(op, Handler::Query(handler))
    }

    /// Register an action implemented by a method on a shared concept.
    ///
    /// # Errors
    ///
    /// See [`Self::action`].
    pub fn action_on<C, F, Fut>(
        &mut self,
        concept: &Arc<C>,
        op: OperationRef,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        C: Send + Sync + 'static,
        F: Fn(Arc<C>, Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let concept = Arc::clone(concept);
        self.action(op, move |input| handler(Arc::clone(&concept), input))
    }

    /// Register a query implemented by a method on a shared concept.
    ///
    /// # Errors
    ///
    /// See [`Self::query`].
    pub fn query_on<C, F, Fut>(
        &mut self,
        concept: &Arc<C>,
        op: OperationRef,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        C: Send + Sync + 'static,
        F: Fn(Arc<C>, Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueryResult> + Send + 'static,
    {
        let concept = Arc::clone(concept);
        self.query(op, move |input| handler(Arc::clone(&concept), input))
    }

    /// Register every operation of a concept.
    ///
    /// # Errors
    ///
    /// Propagates the concept's [`RegistryError`].
    pub fn concept<C: Concept>(&mut self, concept: Arc<C>) -> Result<&mut Self, RegistryError> {
        let name = concept.name();
        concept.register(self)?;
        if !self.concepts.contains(&name) {
            self.concepts.push(name);
        }
        tracing::debug!(concept = name, "Registered concept");
        Ok(self)
    }

    /// Freeze the registry
    #[must_use]
    pub fn build(self) -> OperationRegistry {
        let by_route = self
            .handlers
            .keys()
            .map(|op| (op.route(), *op))
            .collect();
        OperationRegistry {
            handlers: self.handlers,
            by_route,
            concepts: self.concepts,
        }
    }

    fn insert(&mut self, op: OperationRef, handler: Handler) -> Result<&mut Self, RegistryError> {
        let registered = handler.kind();
        let expected = op.kind();
        if registered != expected {
            return Err(RegistryError::KindMismatch {
                op,
                registered,
                expected,
            });
        }
        if self.handlers.contains_key(&op) {
            return Err(RegistryError::Duplicate(op));
        }
        self.handlers.insert(op, handler);
        Ok(self)
    }
}

/// Immutable catalogue of operations, shared behind an `Arc` once built.
pub struct OperationRegistry {
    handlers: HashMap<OperationRef, Handler>,
    by_route: HashMap<String, OperationRef>,
    concepts: Vec<&'static str>,
}

impl OperationRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> OperationRegistryBuilder {
        OperationRegistryBuilder::default()
    }

    /// Whether `op` is registered
    #[must_use]
    pub fn contains(&self, op: OperationRef) -> bool {
        self.handlers.contains_key(&op)
    }

    /// Kind of a registered operation
    #[must_use]
    pub fn kind(&self, op: OperationRef) -> Option<OperationKind> {
        self.handlers.get(&op).map(Handler::kind)
    }

    /// Look an operation up by its string parts (used by the HTTP boundary)
    #[must_use]
    pub fn resolve(&self, concept: &str, name: &str) -> Option<OperationRef> {
        self.by_route.get(&format!("{concept}/{name}")).copied()
    }

    /// Names of concepts registered through [`OperationRegistryBuilder::concept`]
    #[must_use]
    pub fn concepts(&self) -> &[&'static str] {
        &self.concepts
    }

    /// All registered operations, sorted by concept then name
    #[must_use]
    pub fn operations(&self) -> Vec<(OperationRef, OperationKind)> {
        let mut ops: Vec<_> = self
            .handlers
            .iter()
            .map(|(op, handler)| (*op, handler.kind()))
            .collect();
        ops.sort_by_key(|(op, _)| *op);
        ops
    }

    /// Call an action.
    ///
    /// Unknown operations and queries answer with a [`Failure`].
    pub async fn call_action(&self, op: OperationRef, input: Record) -> ActionResult {
        match self.handlers.get(&op) {
            Some(Handler::Action(handler)) => handler(input).await,
            Some(Handler::Query(_)) => Err(Failure::new(format!("{op} is a query, not an action"))),
            None => Err(Failure::new(format!("unknown operation {op}"))),
        }
    }

    /// Call a query.
    ///
    /// Unknown operations and actions answer with a [`Failure`].
    pub async fn call_query(&self, op: OperationRef, input: Record) -> QueryResult {
        match self.handlers.get(&op) {
            Some(Handler::Query(handler)) => handler(input).await,
            Some(Handler::Action(_)) => Err(Failure::new(format!("{op} is an action, not a query"))),
            None => Err(Failure::new(format!("unknown operation {op}"))),
        }
    }
}

impl QueryInvoker for OperationRegistry {
    fn call_query(&self, op: OperationRef, input: Record) -> BoxFuture<'_, QueryResult> {
        Box::pin(Self::call_query(self, op, input))
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}
