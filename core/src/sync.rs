//! Sync rules: declarative reactions between concepts.
//!
//! A rule has three parts:
//!
//! - `when`: trigger [`Pattern`]s that must all have been satisfied, with
//!   consistent bindings, by invocations of the same flow
//! - `refinement`: a pipeline of query and filter [`Step`]s narrowing or
//!   extending the candidate [`Frames`]
//! - `then`: [`ActionTemplate`]s invoked once per surviving frame
//!
//! # Example
//!
//! ```ignore
//! let rule = SyncRule::build("CreateItemRequest", |v| {
//!     let (request, token, user, title) =
//!         (v.var("request"), v.var("accessToken"), v.var("user"), v.var("title"));
//!     SyncSpec::new()
//!         .when(Pattern::new(
//!             REQUEST,
//!             template! { "path" => "/Item/createItem", "accessToken" => token, "title" => title },
//!             template! { "request" => request },
//!         ))
//!         .query(GET_USER_FROM_TOKEN, template! { "accessToken" => token }, template! { "user" => user })
//!         .then(ActionTemplate::new(CREATE_ITEM, template! { "owner" => user, "title" => title }))
//! });
//! ```

use crate::frame::{Frame, Frames, Symbol};
use crate::operation::{OperationKind, OperationRef, OperationRegistry, QueryInvoker};
use crate::pattern::{ActionTemplate, Pattern, Template};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while registering sync rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A rule with this name already exists
    #[error("sync rule {0} is already registered")]
    DuplicateRule(&'static str),

    /// The rule declares no trigger
    #[error("sync rule {0} has no trigger pattern")]
    NoTrigger(&'static str),

    /// A trigger or result names a query, or a query step names an action
    #[error("sync rule {rule} uses {op} as {expected}, but it is not one")]
    WrongKind {
        /// Rule name
        rule: &'static str,
        /// Offending operation
        op: OperationRef,
        /// Kind required at that position
        expected: OperationKind,
    },

    /// A symbol is read before anything can bind it
    #[error("sync rule {rule} reads symbol {symbol} before it is bound")]
    UnboundSymbol {
        /// Rule name
        rule: &'static str,
        /// Symbol name
        symbol: &'static str,
    },

    /// The rule references an operation missing from the registry
    #[error("sync rule {rule} references unknown operation {op}")]
    UnknownOperation {
        /// Rule name
        rule: &'static str,
        /// Missing operation
        op: OperationRef,
    },
}

/// Allocates the binding symbols of one rule instantiation.
#[derive(Debug, Default)]
pub struct Vars {
    names: Vec<(Symbol, &'static str)>,
}

impl Vars {
    /// Allocate a fresh symbol named `name`
    pub fn var(&mut self, name: &'static str) -> Symbol {
        let symbol = Symbol::fresh();
        self.names.push((symbol, name));
        symbol
    }
}

/// Frame predicate used by filter steps
pub type Predicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// One refinement step.
#[derive(Clone)]
pub enum Step {
    /// Extend frames with the records of a query
    Query {
        /// Query to run
        op: OperationRef,
        /// Query input, resolved per frame
        input: Template,
        /// Record fields to bind
        output: Template,
    },
    /// Keep only frames satisfying the predicate
    Filter(Predicate),
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query { op, input, output } => f
                .debug_struct("Query")
                .field("op", op)
                .field("input", input)
                .field("output", output)
                .finish(),
            Self::Filter(_) => write!(f, "Filter(<predicate>)"),
        }
    }
}

/// Ordered refinement pipeline; each step consumes the previous step's frames.
#[derive(Debug, Clone, Default)]
pub struct Refinement {
    steps: Vec<Step>,
}

impl Refinement {
    /// The identity refinement
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a query step
    #[must_use]
    pub fn query(mut self, op: OperationRef, input: Template, output: Template) -> Self {
        self.steps.push(Step::Query { op, input, output });
        self
    }

    /// Append a filter step
    #[must_use]
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        self.steps.push(Step::Filter(Arc::new(predicate)));
        self
    }

    /// Steps in order
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run the pipeline. Stops early once no frame survives.
    pub async fn apply(&self, frames: Frames, invoker: &dyn QueryInvoker) -> Frames {
        let mut frames = frames;
        for step in &self.steps {
            if frames.is_empty() {
                break;
            }
            frames = match step {
                Step::Query { op, input, output } => frames.extend(invoker, *op, input, output).await,
                Step::Filter(predicate) => frames.filter(|frame| predicate(frame)),
            };
        }
        frames
    }
}

/// Declarative body of a rule, returned from the [`SyncRule::build`] closure.
#[derive(Debug, Clone, Default)]
pub struct SyncSpec {
    when: Vec<Pattern>,
    refinement: Refinement,
    then: Vec<ActionTemplate>,
}

impl SyncSpec {
    /// Empty body
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trigger pattern
    #[must_use]
    pub fn when(mut self, pattern: Pattern) -> Self {
        self.when.push(pattern);
        self
    }

    /// Append a query step to the refinement
    #[must_use]
    pub fn query(mut self, op: OperationRef, input: Template, output: Template) -> Self {
        self.refinement = self.refinement.query(op, input, output);
        self
    }

    /// Append a filter step to the refinement
    #[must_use]
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        self.refinement = self.refinement.filter(predicate);
        self
    }

    /// Add a result action
    #[must_use]
    pub fn then(mut self, action: ActionTemplate) -> Self {
        self.then.push(action);
        self
    }
}

/// A registered, instantiated rule.
#[derive(Debug)]
pub struct SyncRule {
    name: &'static str,
    symbols: Vec<(Symbol, &'static str)>,
    when: Vec<Pattern>,
    refinement: Refinement,
    then: Vec<ActionTemplate>,
}

impl SyncRule {
    /// Instantiate a rule. `body` receives a [`Vars`] allocating fresh symbols.
    #[must_use]
    pub fn build<F>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(&mut Vars) -> SyncSpec,
    {
        let mut vars = Vars::default();
        let spec = body(&mut vars);
        Self {
            name,
            symbols: vars.names,
            when: spec.when,
            refinement: spec.refinement,
            then: spec.then,
        }
    }

    /// Rule name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Trigger patterns
    #[must_use]
    pub fn when(&self) -> &[Pattern] {
        &self.when
    }

    /// Refinement pipeline
    #[must_use]
    pub const fn refinement(&self) -> &Refinement {
        &self.refinement
    }

    /// Result actions
    #[must_use]
    pub fn then(&self) -> &[ActionTemplate] {
        &self.then
    }

    /// Declared name of a symbol
    #[must_use]
    pub fn symbol_name(&self, symbol: Symbol) -> Option<&'static str> {
        self.symbols
            .iter()
            .find(|(s, _)| *s == symbol)
            .map(|(_, name)| *name)
    }

    /// Render a frame with declared symbol names, for logs and tests.
    #[must_use]
    pub fn describe(&self, frame: &Frame) -> serde_json::Map<String, serde_json::Value> {
        frame
            .iter()
            .map(|(symbol, value)| {
                let name = self
                    .symbol_name(symbol)
                    .map_or_else(|| format!("{symbol:?}"), str::to_string);
                (name, value.clone())
            })
            .collect()
    }

    /// Check the rule's static shape: triggers are actions, queries are
    /// queries, and no symbol is read before something can bind it.
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncError`] found.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.when.is_empty() {
            return Err(SyncError::NoTrigger(self.name));
        }

        let mut bound: HashSet<Symbol> = HashSet::new();
        for pattern in &self.when {
            self.expect_kind(pattern.op, OperationKind::Action)?;
            bound.extend(pattern.symbols());
        }

        for step in self.refinement.steps() {
            if let Step::Query { op, input, output } = step {
                self.expect_kind(*op, OperationKind::Query)?;
                self.expect_bound(&bound, input.symbols())?;
                bound.extend(output.symbols());
            }
        }

        for action in &self.then {
            self.expect_kind(action.op, OperationKind::Action)?;
            self.expect_bound(&bound, action.input.symbols())?;
        }
        Ok(())
    }

    fn operations(&self) -> impl Iterator<Item = OperationRef> + '_ {
        let queries = self.refinement.steps().iter().filter_map(|step| match step {
            Step::Query { op, .. } => Some(*op),
            Step::Filter(_) => None,
        });
        self.when
            .iter()
            .map(|p| p.op)
            .chain(queries)
            .chain(self.then.iter().map(|a| a.op))
    }

    fn expect_kind(&self, op: OperationRef, expected: OperationKind) -> Result<(), SyncError> {
        if op.kind() == expected {
            Ok(())
        } else {
            Err(SyncError::WrongKind {
                rule: self.name,
                op,
                expected,
            })
        }
    }

    fn expect_bound(
        &self,
        bound: &HashSet<Symbol>,
        mut symbols: impl Iterator<Item = Symbol>,
    ) -> Result<(), SyncError> {
        match symbols.find(|s| !bound.contains(s)) {
            None => Ok(()),
            Some(symbol) => Err(SyncError::UnboundSymbol {
                rule: self.name,
                symbol: self.symbol_name(symbol).unwrap_or("<anonymous>"),
            }),
        }
    }
}

/// Registry of sync rules, indexed by trigger operation.
///
/// Read-only once handed to the engine.
#[derive(Debug, Default)]
pub struct SyncRegistry {
    rules: Vec<Arc<SyncRule>>,
    by_trigger: HashMap<OperationRef, Vec<usize>>,
}

impl SyncRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a rule.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if the rule is malformed or its name is taken.
    pub fn register(&mut self, rule: SyncRule) -> Result<&mut Self, SyncError> {
        rule.validate()?;
        if self.get(rule.name()).is_some() {
            return Err(SyncError::DuplicateRule(rule.name()));
        }
        let idx = self.rules.len();
        let mut triggers: Vec<OperationRef> = rule.when().iter().map(|p| p.op).collect();
        triggers.sort();
        triggers.dedup();
        for op in triggers {
            self.by_trigger.entry(op).or_default().push(idx);
        }
        tracing::debug!(rule = rule.name(), "Registered sync rule");
        self.rules.push(Arc::new(rule));
        Ok(self)
    }

    /// Check that every referenced operation exists in `operations`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownOperation`] for the first missing one.
    pub fn check_operations(&self, operations: &OperationRegistry) -> Result<(), SyncError> {
        for rule in &self.rules {
            if let Some(op) = rule.operations().find(|op| !operations.contains(*op)) {
                return Err(SyncError::UnknownOperation {
                    rule: rule.name(),
                    op,
                });
            }
        }
        Ok(())
    }

    /// Rules with at least one trigger on `op`, in registration order
    pub fn rules_for(&self, op: OperationRef) -> impl Iterator<Item = &Arc<SyncRule>> {
        self.by_trigger
            .get(&op)
            .into_iter()
            .flatten()
            .map(|idx| &self.rules[*idx])
    }

    /// Rule by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<SyncRule>> {
        self.rules.iter().find(|r| r.name() == name)
    }

    /// All rules in registration order
    #[must_use]
    pub fn rules(&self) -> &[Arc<SyncRule>] {
        &self.rules
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::template;
    use crate::value::{record, Failure, QueryResult, Record};
    use futures::future::BoxFuture;
    use serde_json::json;

    const REQUEST: OperationRef = OperationRef::new("Requesting", "request");
    const RESPOND: OperationRef = OperationRef::new("Requesting", "respond");
    const USER_FROM_TOKEN: OperationRef = OperationRef::new("Auth", "_getUserFromToken");

    fn logout_rule() -> SyncRule {
        SyncRule::build("LogoutResponse", |v| {
            let request = v.var("request");
            SyncSpec::new()
                .when(Pattern::new(
                    REQUEST,
                    template! { "path" => "/Auth/logout" },
                    template! { "request" => request },
                ))
                .then(ActionTemplate::new(RESPOND, template! { "request" => request }))
        })
    }

    struct Tokens;

    impl QueryInvoker for Tokens {
        fn call_query(&self, _op: OperationRef, input: Record) -> BoxFuture<'_, QueryResult> {
            Box::pin(async move {
                match input.get("accessToken").and_then(|t| t.as_str()) {
                    Some("good") => Ok(vec![record(json!({ "user": "u1" }))]),
                    _ => Err(Failure::new("invalid token")),
                }
            })
        }
    }

    #[test]
    fn symbols_are_fresh_per_instantiation() {
        let a = logout_rule();
        let b = logout_rule();
        let sa: Vec<_> = a.when()[0].symbols().collect();
        let sb: Vec<_> = b.when()[0].symbols().collect();
        assert_ne!(sa, sb);
        assert_eq!(a.symbol_name(sa[0]), Some("request"));
    }

    #[test]
    fn register_indexes_by_trigger() {
        let mut registry = SyncRegistry::new();
        registry.register(logout_rule()).unwrap();
        assert_eq!(registry.rules_for(REQUEST).count(), 1);
        assert_eq!(registry.rules_for(RESPOND).count(), 0);
        assert_eq!(
            registry.register(logout_rule()).err(),
            Some(SyncError::DuplicateRule("LogoutResponse"))
        );
    }

    #[test]
    fn result_reading_unbound_symbol_is_rejected() {
        let rule = SyncRule::build("Broken", |v| {
            let request = v.var("request");
            let profile = v.var("profile");
            SyncSpec::new()
                .when(Pattern::new(REQUEST, template! {}, template! { "request" => request }))
                .then(ActionTemplate::new(RESPOND, template! { "request" => request, "profile" => profile }))
        });
        assert_eq!(
            rule.validate(),
            Err(SyncError::UnboundSymbol {
                rule: "Broken",
                symbol: "profile"
            })
        );
    }

    #[test]
    fn query_trigger_is_rejected() {
        let rule = SyncRule::build("QueryTrigger", |_| {
            SyncSpec::new().when(Pattern::new(USER_FROM_TOKEN, template! {}, template! {}))
        });
        assert!(matches!(
            rule.validate(),
            Err(SyncError::WrongKind {
                expected: OperationKind::Action,
                ..
            })
        ));
        assert_eq!(
            SyncRule::build("Empty", |_| SyncSpec::new()).validate(),
            Err(SyncError::NoTrigger("Empty"))
        );
    }

    #[tokio::test]
    async fn refinement_runs_steps_in_order() {
        let token = Symbol::fresh();
        let user = Symbol::fresh();
        let refinement = Refinement::new()
            .query(USER_FROM_TOKEN, template! { "accessToken" => token }, template! { "user" => user })
            .filter(move |f| f.get(user) == Some(&json!("u1")));

        let frames: Frames = ["good", "bad"]
            .iter()
            .map(|t| Frame::new().bind(token, &json!(t)).unwrap())
            .collect();

        let out = refinement.apply(frames, &Tokens).await;
        assert_eq!(out.len(), 1);
        let frame = out.iter().next().unwrap();
        assert_eq!(frame.get(token), Some(&json!("good")));
        assert_eq!(frame.get(user), Some(&json!("u1")));
    }
}
