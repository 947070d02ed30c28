//! Patterns: the shapes rules match against and the calls they produce.
//!
//! A [`Template`] is an ordered list of `field => term` pairs, where each
//! [`Term`] is either a literal (exact match) or a [`Symbol`] (capture, or an
//! equality constraint when already bound). Templates are used in three
//! places:
//!
//! - trigger [`Pattern`]s, matched against completed invocations
//! - query steps, where the input is resolved and the output is bound
//! - result [`ActionTemplate`]s, resolved into concrete call inputs

use crate::frame::{Frame, Symbol};
use crate::invocation::Invocation;
use crate::operation::OperationRef;
use crate::value::{Record, Value};

/// A template field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Literal value (exact-match constraint)
    Lit(Value),
    /// Binding symbol (capture, or equality when already bound)
    Var(Symbol),
}

impl Term {
    /// Match this term against a concrete value under `frame`.
    #[must_use]
    pub fn bind(&self, frame: &Frame, value: &Value) -> Option<Frame> {
        match self {
            Self::Lit(lit) => (lit == value).then(|| frame.clone()),
            Self::Var(symbol) => frame.bind(*symbol, value),
        }
    }

    /// Resolve this term under `frame`; `Err` carries the unbound symbol.
    ///
    /// # Errors
    ///
    /// Returns the symbol when it is not bound in `frame`.
    pub fn resolve(&self, frame: &Frame) -> Result<Value, Symbol> {
        match self {
            Self::Lit(lit) => Ok(lit.clone()),
            Self::Var(symbol) => frame.get(*symbol).cloned().ok_or(*symbol),
        }
    }

    /// The symbol, if this term is a variable
    #[must_use]
    pub const fn symbol(&self) -> Option<Symbol> {
        match self {
            Self::Var(symbol) => Some(*symbol),
            Self::Lit(_) => None,
        }
    }
}

impl From<Symbol> for Term {
    fn from(symbol: Symbol) -> Self {
        Self::Var(symbol)
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Self::Lit(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Self::Lit(Value::String(value.to_string()))
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Self::Lit(Value::String(value))
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Self::Lit(Value::Bool(value))
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Self::Lit(Value::from(value))
    }
}

/// Ordered `field => term` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    fields: Vec<(String, Term)>,
}

impl Template {
    /// Empty template (matches any record)
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add a field
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, term: impl Into<Term>) -> Self {
        self.fields.push((name.into(), term.into()));
        self
    }

    /// Iterate fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.fields.iter().map(|(name, term)| (name.as_str(), term))
    }

    /// Symbols referenced by this template
    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.fields.iter().filter_map(|(_, term)| term.symbol())
    }

    /// Whether the template has no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Match a record under `frame`.
    ///
    /// Every template field must be present in `record`; literals must be
    /// equal and symbols equal-or-bind. Extra record fields are ignored.
    #[must_use]
    pub fn bind(&self, frame: &Frame, record: &Record) -> Option<Frame> {
        self.fields.iter().try_fold(frame.clone(), |acc, (name, term)| {
            record.get(name).and_then(|value| term.bind(&acc, value))
        })
    }

    /// Resolve into a concrete record under `frame`.
    ///
    /// # Errors
    ///
    /// Returns the first symbol that is not bound in `frame`.
    pub fn resolve(&self, frame: &Frame) -> Result<Record, Symbol> {
        self.fields
            .iter()
            .map(|(name, term)| term.resolve(frame).map(|value| (name.clone(), value)))
            .collect()
    }
}

/// Build a [`Template`] from `"field" => term` pairs.
///
/// Terms are anything convertible into [`Term`]: a [`Symbol`], a string
/// literal, or a `serde_json::Value`.
///
/// ```ignore
/// let t = template! { "path" => "/Item/createItem", "item" => item };
/// ```
#[macro_export]
macro_rules! template {
    () => {
        $crate::pattern::Template::new()
    };
    ($($name:literal => $term:expr),+ $(,)?) => {
        $crate::pattern::Template::new()
            $(.field($name, $crate::pattern::Term::from($term)))+
    };
}

/// Output side of a trigger pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPattern {
    /// Match successful invocations whose output fits the template
    Success(Template),
    /// Match failed invocations, binding or comparing the failure reason
    Failure(Term),
}

impl Default for OutputPattern {
    fn default() -> Self {
        Self::Success(Template::new())
    }
}

/// A trigger: one invocation shape a rule waits for.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    /// Operation that must have been invoked
    pub op: OperationRef,
    /// Constraint on the invocation input
    pub input: Template,
    /// Constraint on the invocation outcome
    pub output: OutputPattern,
}

impl Pattern {
    /// Trigger on a successful invocation of `op`
    #[must_use]
    pub const fn new(op: OperationRef, input: Template, output: Template) -> Self {
        Self {
            op,
            input,
            output: OutputPattern::Success(output),
        }
    }

    /// Trigger on a failed invocation of `op`, binding its reason to `error`
    #[must_use]
    pub fn failure(op: OperationRef, input: Template, error: impl Into<Term>) -> Self {
        Self {
            op,
            input,
            output: OutputPattern::Failure(error.into()),
        }
    }

    /// Symbols this pattern can bind
    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        let output: Box<dyn Iterator<Item = Symbol> + '_> = match &self.output {
            OutputPattern::Success(template) => Box::new(template.symbols()),
            OutputPattern::Failure(term) => Box::new(term.symbol().into_iter()),
        };
        self.input.symbols().chain(output)
    }

    /// Bind this pattern against a completed invocation under `frame`.
    #[must_use]
    pub fn bind(&self, frame: &Frame, invocation: &Invocation) -> Option<Frame> {
        if invocation.op != self.op {
            return None;
        }
        let frame = self.input.bind(frame, &invocation.input)?;
        match (&self.output, &invocation.output) {
            (OutputPattern::Success(template), Ok(output)) => template.bind(&frame, output),
            (OutputPattern::Failure(term), Err(failure)) => {
                term.bind(&frame, &Value::String(failure.error.clone()))
            }
            _ => None,
        }
    }
}

/// A result: an operation to invoke once per surviving frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTemplate {
    /// Action to invoke
    pub op: OperationRef,
    /// Input, resolved against each frame
    pub input: Template,
}

impl ActionTemplate {
    /// Create a result template
    #[must_use]
    pub const fn new(op: OperationRef, input: Template) -> Self {
        Self { op, input }
    }
}
