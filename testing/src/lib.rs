//! # Concept Sync Testing
//!
//! Testing utilities and fixtures for concept-sync applications.
//!
//! This crate provides:
//! - Scripted concepts whose actions and queries are plain closures
//! - An engine builder that panics on misconfiguration instead of returning errors
//! - Helpers for inspecting recorded invocations
//! - Property-based testing strategies for records
//!
//! ## Example
//!
//! ```ignore
//! use concept_sync_testing::{EngineHarness, ScriptedConcept};
//!
//! #[tokio::test]
//! async fn create_item_responds() {
//!     let items = ScriptedConcept::new("Item").echo(CREATE_ITEM);
//!     let engine = EngineHarness::new()
//!         .concept(Arc::new(items))
//!         .rule(create_item_response())
//!         .build();
//!
//!     let flow = engine.flow();
//!     flow.invoke(CREATE_ITEM, record(json!({ "title": "Drill" }))).await.unwrap();
//!     assert_eq!(invocations_of(&flow.history(), RESPOND).len(), 1);
//! }
//! ```

pub mod harness;
pub mod mocks;

/// Property-based testing strategies.
pub mod properties {
    use concept_sync_core::{Record, Value};
    use proptest::prelude::*;

    /// Scalar JSON values: small integers, booleans and short strings
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            (-20i64..20).prop_map(Value::from),
            any::<bool>().prop_map(Value::Bool),
            "[a-z]{0,4}".prop_map(Value::String),
        ]
    }

    /// Records over the given field names, each field present or absent
    pub fn arb_record(fields: &'static [&'static str]) -> impl Strategy<Value = Record> {
        proptest::collection::vec(proptest::option::of(arb_scalar()), fields.len()).prop_map(
            move |values| {
                fields
                    .iter()
                    .zip(values)
                    .filter_map(|(name, value)| value.map(|v| ((*name).to_string(), v)))
                    .collect()
            },
        )
    }
}

/// Install a test-friendly tracing subscriber (idempotent).
///
/// Honours `RUST_LOG`; output is captured by the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use harness::{EngineHarness, invocations_of, next_invocation};
pub use mocks::{FailingResponseStore, ScriptedConcept};
