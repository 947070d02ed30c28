//! HTTP request handlers.

pub mod health;
pub mod metrics;
pub mod passthrough;
pub mod requesting;

pub use health::{health_check, readiness, root};
pub use metrics::metrics;
pub use passthrough::passthrough;
pub use requesting::request;
