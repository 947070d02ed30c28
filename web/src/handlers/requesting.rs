//! The requesting route: `POST {base}/*path`.
//!
//! The body, plus the routing path, becomes the payload of a
//! `Requesting.request` invocation. The reply is whatever payload the sync
//! rules eventually send back through `Requesting.respond`.

use crate::error::AppError;
use crate::middleware::CorrelationId;
use crate::state::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use concept_sync_core::{Record, Value};

/// Handle one inbound request.
///
/// # Errors
///
/// - 400 if the body is not a JSON object
/// - 504 `{"error": "Request timed out."}` if no response arrives in time
/// - 500 for every other bridge or engine failure
pub async fn request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    correlation: CorrelationId,
    body: Bytes,
) -> Result<Json<Record>, AppError> {
    let payload = payload(&path, &body)?;
    tracing::debug!(%correlation, path = ?payload.get("path"), "Requesting route");

    // Cancelled when the server shuts down
    let cancel = state.shutdown.child_token();
    // Dropping this future (client disconnect) also releases the pending entry
    let reply = state
        .requesting
        .handle(&state.engine, payload, state.config.requesting.timeout, &cancel)
        .await?;
    Ok(Json(reply))
}

/// `body + {"path": "/<path>"}`; the routing path wins over a body field.
fn payload(path: &str, body: &[u8]) -> Result<Record, AppError> {
    let Ok(Value::Object(mut payload)) = serde_json::from_slice::<Value>(body) else {
        return Err(AppError::invalid_body());
    };
    payload.insert(
        "path".to_string(),
        Value::String(format!("/{}", path.trim_start_matches('/'))),
    );
    Ok(payload)
}
