//! Origin allow-list for cross-origin browser requests.

use axum::http::{HeaderName, HeaderValue, Method, header, request::Parts};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

const LOCAL_HOSTS: [&str; 3] = ["http://localhost:", "http://127.0.0.1:", "http://[::1]:"];

/// Which browser origins may call the API.
///
/// Configured origins match after trimming trailing slashes and lower-casing
/// both sides. Local development origins (`http://localhost:<port>`,
/// `http://127.0.0.1:<port>`, `http://[::1]:<port>`) are always allowed.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Policy over the given origins
    #[must_use]
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: origins.into_iter().map(|o| normalize(o.as_ref())).collect(),
        }
    }

    /// Whether `origin` may call the API
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        let normalized = normalize(origin);
        self.allowed.iter().any(|allowed| *allowed == normalized) || is_local(origin)
    }

    /// CORS layer enforcing this policy with credentialed requests.
    #[must_use]
    pub fn layer(&self) -> CorsLayer {
        let policy = Arc::new(self.clone());
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &Parts| {
                    origin.to_str().is_ok_and(|origin| policy.allows(origin))
                },
            ))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
                Method::PATCH,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("x-requested-with"),
            ])
            .allow_credentials(true)
            .max_age(Duration::from_secs(86_400))
    }
}

fn normalize(origin: &str) -> String {
    origin.trim_end_matches('/').to_lowercase()
}

fn is_local(origin: &str) -> bool {
    LOCAL_HOSTS.iter().any(|prefix| {
        origin
            .strip_prefix(prefix)
            .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
    })
}
