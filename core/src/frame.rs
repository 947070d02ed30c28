//! Frame engine: binding environments and the relational operations over them.
//!
//! A [`Frame`] is one consistent assignment of values to [`Symbol`]s. A
//! [`Frames`] collection is the disjunction of every viable assignment, i.e. a
//! relation whose columns are symbols and whose rows are frames.
//!
//! Two operations refine a relation:
//!
//! - [`Frames::filter`]: relational selection by predicate
//! - [`Frames::extend`]: semi-join against the records returned by a query
//!
//! Both are pure with respect to their input: frames are immutable values
//! and every operation returns a fresh collection.

use crate::operation::{OperationRef, QueryInvoker};
use crate::pattern::Template;
use crate::value::Value;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SYMBOL: AtomicU32 = AtomicU32::new(1);

/// An opaque placeholder for a value not yet known.
///
/// Symbols are allocated from a process-wide counter, so symbols of two
/// different rule instantiations never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Allocate a fresh symbol
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_SYMBOL.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric id (stable for the life of the process)
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// One consistent assignment of values to symbols.
///
/// Bindings are kept sorted by symbol so equality is structural.
#[derive(Clone, Default, PartialEq)]
pub struct Frame {
    bindings: SmallVec<[(Symbol, Value); 8]>,
}

impl Frame {
    /// The empty frame
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value bound to `symbol`, if any
    #[must_use]
    pub fn get(&self, symbol: Symbol) -> Option<&Value> {
        self.bindings
            .binary_search_by_key(&symbol, |(s, _)| *s)
            .ok()
            .map(|idx| &self.bindings[idx].1)
    }

    /// Whether `symbol` is bound
    #[must_use]
    pub fn contains(&self, symbol: Symbol) -> bool {
        self.get(symbol).is_some()
    }

    /// Number of bound symbols
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no symbol is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate bindings in symbol order
    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &Value)> {
        self.bindings.iter().map(|(s, v)| (*s, v))
    }

    /// Equal-or-bind merge.
    ///
    /// - unbound: returns a copy extended with `symbol = value`
    /// - bound to an equal value: returns an unchanged copy
    /// - bound to a different value: returns `None`
    #[must_use]
    pub fn bind(&self, symbol: Symbol, value: &Value) -> Option<Self> {
        match self.bindings.binary_search_by_key(&symbol, |(s, _)| *s) {
            Ok(idx) => (self.bindings[idx].1 == *value).then(|| self.clone()),
            Err(idx) => {
                let mut next = self.clone();
                next.bindings.insert(idx, (symbol, value.clone()));
                Some(next)
            }
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl FromIterator<(Symbol, Value)> for Frame {
    /// Later duplicates of a symbol are dropped.
    fn from_iter<I: IntoIterator<Item = (Symbol, Value)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |frame, (symbol, value)| {
                if frame.contains(symbol) {
                    frame
                } else {
                    frame.bind(symbol, &value).unwrap_or(frame)
                }
            })
    }
}

/// Ordered collection of frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frames {
    frames: Vec<Frame>,
}

impl Frames {
    /// No viable assignment
    #[must_use]
    pub const fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    /// A relation with exactly one (possibly empty) frame
    #[must_use]
    pub fn single(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    /// Number of frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame survives
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate frames in order
    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    /// Keep frames satisfying `predicate`, preserving order.
    #[must_use]
    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool,
    {
        self.frames
            .iter()
            .filter(|frame| predicate(frame))
            .cloned()
            .collect()
    }

    /// Extend every frame with the records returned by a query.
    ///
    /// For each frame, `input` is resolved against the frame and `op` is
    /// invoked. Each returned record that matches `output` (equal-or-bind)
    /// yields one child frame. Children are emitted in parent-then-record
    /// order; a parent with no matching record contributes nothing.
    ///
    /// A failed query, or an input referencing an unbound symbol, counts as
    /// zero records.
    pub async fn extend(
        &self,
        invoker: &dyn QueryInvoker,
        op: OperationRef,
        input: &Template,
        output: &Template,
    ) -> Self {
        let mut extended = Vec::new();
        for frame in &self.frames {
            let args = match input.resolve(frame) {
                Ok(args) => args,
                Err(symbol) => {
                    tracing::debug!(%op, ?symbol, "Query input references unbound symbol, dropping frame");
                    continue;
                }
            };
            let records = match invoker.call_query(op, args).await {
                Ok(records) => records,
                Err(failure) => {
                    tracing::debug!(%op, error = %failure, "Query failed, dropping frame");
                    continue;
                }
            };
            extended.extend(records.iter().filter_map(|r| output.bind(frame, r)));
        }
        tracing::trace!(%op, before = self.len(), after = extended.len(), "Extended frames");
        Self { frames: extended }
    }

    /// Alias of [`Self::extend`] using the rule vocabulary (`where` clauses query).
    pub async fn query(
        &self,
        invoker: &dyn QueryInvoker,
        op: OperationRef,
        input: &Template,
        output: &Template,
    ) -> Self {
        self.extend(invoker, op, input, output).await
    }
}

impl FromIterator<Frame> for Frames {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Frames {
    type Item = Frame;
    type IntoIter = std::vec::IntoIter<Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<'a> IntoIterator for &'a Frames {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
