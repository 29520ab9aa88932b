//! CORS header injection.

use std::collections::HashSet;

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
};
use axum::http::{HeaderMap, HeaderValue};

/// Mirror whatever `Origin` the client sent. Development only.
pub const ORIGIN_MIRROR: &str = "_mirror_";

const ALLOW_HEADERS: &str = "Authorization, Accept, Content-Type, Cache-Control, Cookie, \
If-Modified-Since, X-Requested-With, X-Count-Total, X-Namespace, X-External-Tracking-Type, \
X-External-Tracking-ID, X-TLS-Client-Certificate, Accept-Encoding, X-Fields, X-Read-Consistency, \
X-Write-Consistency, Idempotency-Key";

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS";

const EXPOSE_HEADERS: &str = "X-Requested-With, X-Count-Total, X-Namespace, X-Messages, X-Fields, X-Next";

const MAX_AGE: u32 = 1500;

/// Allowed-origin policy applied to every gateway response.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origin: String,
    additional_origins: HashSet<String>,
    allow_credentials: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new(ORIGIN_MIRROR, Vec::new(), true)
    }
}

impl CorsPolicy {
    pub fn new(allow_origin: impl Into<String>, additional_origins: Vec<String>, allow_credentials: bool) -> Self {
        Self {
            allow_origin: allow_origin.into(),
            additional_origins: additional_origins.into_iter().collect(),
            allow_credentials,
        }
    }

    fn resolve_origin<'a>(&'a self, origin: &'a str) -> &'a str {
        if self.allow_origin == "*" {
            return "*";
        }
        if self.allow_origin == ORIGIN_MIRROR {
            return origin;
        }
        if self.additional_origins.contains(origin) {
            return origin;
        }
        &self.allow_origin
    }

    /// Write the CORS headers for a request from `origin`. Preflight adds
    /// the allowed headers, methods and max age.
    pub fn inject(&self, headers: &mut HeaderMap, origin: &str, preflight: bool) {
        let allowed = self.resolve_origin(origin);

        if preflight {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(MAX_AGE));
        }

        if !allowed.is_empty() {
            match HeaderValue::from_str(allowed) {
                Ok(value) => {
                    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
                }
                Err(_) => tracing::debug!(origin = %allowed, "Ignoring unencodable CORS origin"),
            }
        }

        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSE_HEADERS));

        if self.allow_credentials && allowed != "*" && !allowed.is_empty() {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
    }
}
