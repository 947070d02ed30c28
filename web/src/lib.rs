//! Axum HTTP boundary for concept-sync.
//!
//! Turns network requests into inbound calls and replies with whatever the
//! sync rules send back.
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at `POST {base}/Item/createItem`
//! 2. **Passthrough?** If `Item.createItem` is exposed, call it and reply
//! 3. **Otherwise** invoke `Requesting.request` with `body + {path}`
//! 4. **Sync rules** react, eventually invoking `Requesting.respond`
//! 5. **Reply** with the responded payload, or 504 after the timeout
//!
//! # Example
//!
//! ```ignore
//! use concept_sync_web::{AppState, PassthroughPolicy, ServerConfig, server};
//!
//! let config = ServerConfig::from_env()?;
//! let requesting = Arc::new(Requesting::new(config.requesting.clone()));
//! let mut ops = OperationRegistry::builder();
//! ops.concept(Arc::clone(&requesting))?.concept(Arc::new(items))?;
//! let engine = Engine::new(Arc::new(ops.build()), Arc::new(syncs))?;
//!
//! let state = AppState::new(engine, requesting, config);
//! tokio::spawn(server::shutdown_on_ctrl_c(state.shutdown.clone()));
//! let policy = PassthroughPolicy::new()
//!     .include("Item/_getAllItems", "public browse")
//!     .exclude("Item/createItem");
//! server::serve(state, &policy).await?;
//! ```

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod passthrough;
pub mod router;
pub mod server;
pub mod state;

// Re-export key types for convenience
pub use config::{ConfigError, ServerConfig};
pub use cors::OriginPolicy;
pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, correlation_id};
pub use passthrough::{PassthroughPolicy, PassthroughRoute};
pub use router::router;
pub use server::{serve, serve_on, shutdown_on_ctrl_c};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
