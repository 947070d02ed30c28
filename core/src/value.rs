//! Structured values exchanged with operations.
//!
//! Every action and query accepts one [`Record`] and answers with either a
//! [`Record`] (or a list of them, for queries) or a [`Failure`]. Records are
//! plain JSON objects so that concepts, rules and the HTTP boundary all speak
//! the same shape without conversion layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A structured value (re-exported from `serde_json`).
pub use serde_json::Value;

/// A structured input or output: a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Outcome of an action.
pub type ActionResult = Result<Record, Failure>;

/// Outcome of a query: an ordered, possibly empty list of records.
pub type QueryResult = Result<Vec<Record>, Failure>;

/// Structured failure carrying a human-readable reason.
///
/// Serializes as `{"error": "<reason>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable reason
    pub error: String,
}

impl Failure {
    /// Create a failure with the given reason
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            error: reason.into(),
        }
    }

    /// The failure reason
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.error
    }

    /// Render the failure as a record (`{"error": reason}`)
    #[must_use]
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("error".to_string(), Value::String(self.error.clone()));
        record
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)
    }
}

impl std::error::Error for Failure {}

/// Convert an arbitrary JSON value into a [`Record`].
///
/// Objects pass through unchanged; any other value yields an empty record.
#[must_use]
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}
