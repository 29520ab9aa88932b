//! Capabilities the gateway consumes to pick a backend.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use thiserror::Error;

/// Why an upstream could not be chosen.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Every candidate refused the request; surfaced as 429.
    #[error("Please retry in a moment")]
    TooManyRequests,

    /// Anything else; surfaced as 500 with this message.
    #[error("{0}")]
    Other(String),
}

/// Feedback channel for observed response times.
pub trait LatencyCollector: Send + Sync {
    fn collect_latency(&self, address: &str, elapsed: Duration);
}

/// Resolves the backend address (`host:port`) for a request.
///
/// Called once per request on the hot path, so implementations must not
/// block. `Ok(None)` means nothing can serve the request right now.
pub trait Upstreamer: Send + Sync + 'static {
    fn upstream(&self, req: &Request<Body>) -> Result<Option<String>, UpstreamError>;

    /// Latency feedback capability, queried once when the gateway is built.
    fn latency_collector(self: Arc<Self>) -> Option<Arc<dyn LatencyCollector>> {
        None
    }
}

/// Fixed upstream, handy for single-backend setups and tests.
#[derive(Debug, Clone)]
pub struct StaticUpstreamer {
    address: Option<String>,
}

impl StaticUpstreamer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
        }
    }

    pub fn empty() -> Self {
        Self { address: None }
    }
}

impl Upstreamer for StaticUpstreamer {
    fn upstream(&self, _req: &Request<Body>) -> Result<Option<String>, UpstreamError> {
        Ok(self.address.clone())
    }
}
