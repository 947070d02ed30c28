//! Error types for web handlers.
//!
//! Every error reply has the body `{"error": "<message>"}`, the same shape a
//! concept failure has, so clients handle both the same way.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use concept_sync_runtime::{EngineError, RequestingError};
use serde_json::json;
use std::fmt;

/// Application error type for web handlers.
///
/// Carries the status, the user-facing message, a short code for logs and
/// an optional internal cause that is logged but never sent to the client.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: &'static str,
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            source: None,
        }
    }

    /// Attach the internal cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// 400: the body was not a JSON object.
    #[must_use]
    pub fn invalid_body() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Invalid request body")
    }

    /// 504: no response arrived in time.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", "Request timed out.")
    }

    /// 500 with a generic message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// HTTP status of the reply
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// User-facing message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = self.code,
                    error = %source,
                    "{}", self.message
                );
            } else {
                tracing::error!(status = %self.status, code = self.code, "{}", self.message);
            }
        }

        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<RequestingError> for AppError {
    fn from(err: RequestingError) -> Self {
        if err.is_timeout() {
            Self::timed_out().with_source(err)
        } else {
            Self::internal("Internal server error").with_source(err)
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        Self::internal("An internal server error occurred.").with_source(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal server error occurred.").with_source(err)
    }
}
