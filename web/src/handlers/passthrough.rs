//! Passthrough routes: `POST {base}/{Concept}/{name}` calls one operation.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    body::Bytes,
    response::{IntoResponse, Response},
};
use concept_sync_core::{OperationKind, OperationRef, Value, record};

/// Call `op` with the request body as input.
///
/// An unparseable or non-object body is treated as `{}`. Actions go through
/// the engine, so they are recorded and trigger sync rules; queries are
/// plain reads. A concept failure is a normal 200 reply `{"error": ...}`.
///
/// # Errors
///
/// Returns a 500 [`AppError`] if the engine refuses the call.
pub async fn passthrough(
    state: AppState,
    op: OperationRef,
    kind: OperationKind,
    body: Bytes,
) -> Result<Response, AppError> {
    let input = record(serde_json::from_slice(&body).unwrap_or(Value::Null));
    metrics::counter!("http_passthrough_calls_total", "op" => op.to_string()).increment(1);

    let reply = match kind {
        OperationKind::Action => match state.engine.invoke(op, input).await? {
            Ok(output) => Json(output).into_response(),
            Err(failure) => Json(failure.to_record()).into_response(),
        },
        OperationKind::Query => match state.engine.query(op, input).await {
            Ok(rows) => Json(rows).into_response(),
            Err(failure) => Json(failure.to_record()).into_response(),
        },
    };
    Ok(reply)
}
