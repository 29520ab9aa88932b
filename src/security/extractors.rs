//! Request fingerprinting for the per-source limiters.

use std::hash::Hasher;

use axum::body::Body;
use axum::http::{header, Request};
use twox_hash::XxHash64;

use crate::http::request::ClientInfo;

/// Error type returned by pluggable extractors.
pub type ExtractError = Box<dyn std::error::Error + Send + Sync>;

/// Key shared by every request that carries no credentials.
pub const DEFAULT_SOURCE: &str = "default";

/// Derives the bucket key a request is accounted under.
pub trait SourceExtractor: Send + Sync {
    fn extract_source(&self, req: &Request<Body>) -> Result<String, ExtractError>;
}

/// Derives the `(rate, burst)` applied to a request's bucket.
pub trait RateExtractor: Send + Sync {
    fn extract_rates(&self, req: &Request<Body>) -> Result<(f64, usize), ExtractError>;
}

/// Hashes the credentials of a request.
///
/// The named auth cookie wins over the `Authorization` header; requests
/// carrying neither share the [`DEFAULT_SOURCE`] bucket.
#[derive(Debug, Clone, Default)]
pub struct AuthSourceExtractor {
    auth_cookie: Option<String>,
}

impl AuthSourceExtractor {
    pub fn new(auth_cookie: Option<String>) -> Self {
        Self {
            auth_cookie: auth_cookie.filter(|c| !c.is_empty()),
        }
    }
}

impl SourceExtractor for AuthSourceExtractor {
    fn extract_source(&self, req: &Request<Body>) -> Result<String, ExtractError> {
        let cookie = self
            .auth_cookie
            .as_deref()
            .and_then(|name| find_cookie(req, name));

        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        let Some(credentials) = cookie.or(authorization) else {
            return Ok(DEFAULT_SOURCE.to_string());
        };

        let mut hasher = XxHash64::with_seed(0);
        hasher.write(credentials.as_bytes());
        Ok(hasher.finish().to_string())
    }
}

fn find_cookie<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
        .filter(|v| !v.is_empty())
}

/// Keys requests by the client IP (proxy-protocol aware).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpExtractor;

impl SourceExtractor for ClientIpExtractor {
    fn extract_source(&self, req: &Request<Body>) -> Result<String, ExtractError> {
        req.extensions()
            .get::<ClientInfo>()
            .map(|info| info.remote_addr.ip().to_string())
            .ok_or_else(|| "missing client connection info".into())
    }
}

/// The same rate and burst for every source.
#[derive(Debug, Clone, Copy)]
pub struct FixedRates {
    pub rate: f64,
    pub burst: usize,
}

impl RateExtractor for FixedRates {
    fn extract_rates(&self, _req: &Request<Body>) -> Result<(f64, usize), ExtractError> {
        Ok((self.rate, self.burst))
    }
}
