//! Route table.

use crate::cors::OriginPolicy;
use crate::handlers;
use crate::middleware::correlation_id;
use crate::passthrough::{PassthroughPolicy, PassthroughRoute};
use crate::state::AppState;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the application router.
///
/// | method | path | handler |
/// |---|---|---|
/// | GET | `/`, `/health` | liveness |
/// | GET | `/health/ready` | engine and bridge readiness |
/// | GET | `/metrics` | Prometheus scrape, 404 when no recorder is installed |
/// | POST | `{base}/{Concept}/{name}` | passthrough, per exposed operation |
/// | POST | `{base}/*path` | requesting route, for everything else |
pub fn router(state: AppState, policy: &PassthroughPolicy) -> Router {
    let base = state.config.base_url.clone();
    let mut app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics));

    for PassthroughRoute { op, kind, .. } in policy.routes(state.engine.operations()) {
        let path = format!("{base}/{}", op.route());
        tracing::info!(route = %path, %kind, "Registered passthrough route");
        app = app.route(
            &path,
            post(move |State(state): State<AppState>, body: Bytes| {
                handlers::passthrough(state, op, kind, body)
            }),
        );
    }

    app.route(&format!("{base}/*path"), post(handlers::request))
        .layer(axum::middleware::from_fn(correlation_id))
        .layer(TraceLayer::new_for_http())
        .layer(OriginPolicy::new(&state.config.allowed_origins).layer())
        .with_state(state)
}
