//! # Concept Sync Core
//!
//! Core types for concept synchronization.
//!
//! Applications are built from independent **concepts** that never call each
//! other. Each concept exposes actions and queries; cross-concept behaviour is
//! expressed entirely as declarative **sync rules** reacting to completed
//! action invocations.
//!
//! ## Core Types
//!
//! - **Operation** ([`operation`]): a named action or query, registered as a typed handler
//! - **Invocation** ([`invocation`]): one completed action call (the facts rules react to)
//! - **Frame** ([`frame`]): one consistent assignment of binding symbols to values
//! - **Pattern** ([`pattern`]): templates over operation inputs and outputs
//! - **Sync rule** ([`sync`]): triggers, refinement pipeline, result actions
//!
//! The runtime crate supplies the dispatcher that evaluates rules and the
//! correlation bridge that turns a request/response boundary into flows.
//!
//! ## Example
//!
//! ```ignore
//! use concept_sync_core::{template, ActionTemplate, Pattern, SyncRule, SyncSpec};
//!
//! let rule = SyncRule::build("LogoutResponse", |v| {
//!     let request = v.var("request");
//!     SyncSpec::new()
//!         .when(Pattern::new(REQUEST, template! { "path" => "/Auth/logout" }, template! { "request" => request }))
//!         .when(Pattern::new(LOGOUT, template! {}, template! {}))
//!         .then(ActionTemplate::new(RESPOND, template! { "request" => request }))
//! });
//! ```

pub mod frame;
pub mod invocation;
pub mod operation;
pub mod pattern;
pub mod sync;
pub mod value;

pub use frame::{Frame, Frames, Symbol};
pub use invocation::{FlowId, Invocation, InvocationId};
pub use operation::{
    Concept, OperationKind, OperationRef, OperationRegistry, OperationRegistryBuilder,
    QueryInvoker, RegistryError,
};
pub use pattern::{ActionTemplate, OutputPattern, Pattern, Template, Term};
pub use sync::{Refinement, Step, SyncError, SyncRegistry, SyncRule, SyncSpec, Vars};
pub use value::{record, ActionResult, Failure, QueryResult, Record, Value};
