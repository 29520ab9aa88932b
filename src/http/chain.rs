//! Admission chain in front of the forwarder.
//!
//! # Data Flow
//! ```text
//! request
//!     → circuit breaker (503 while tripped)
//!     → per-source limiter (429 Too Many Requests)
//!     → per-source connection limiter (429 Too Many Connections)
//!     → body buffering, 1 MiB (413)
//!     → forwarder, bounded by the write timeout (504)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::{BodyExt, Limited};

use crate::http::error::{write_error, GatewayError, RequestMeta, MAX_BODY_BYTES};
use crate::http::forwarder::Forwarder;
use crate::http::options::GatewayOptions;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::condition::ConditionError;
use crate::security::cors::CorsPolicy;
use crate::security::extractors::{FixedRates, RateExtractor};
use crate::security::qos::{ConnectionLimitError, ConnectionTracker};
use crate::security::rate_limit::SourceLimiter;

pub struct Chain {
    breaker: Option<CircuitBreaker>,
    limiter: Option<SourceLimiter>,
    connections: Option<Arc<ConnectionTracker>>,
    forwarder: Arc<Forwarder>,
    write_timeout: Duration,
    cors: CorsPolicy,
}

impl Chain {
    pub fn new(options: &GatewayOptions, forwarder: Arc<Forwarder>) -> Result<Self, ConditionError> {
        let breaker = options
            .circuit_breaker
            .as_deref()
            .map(|expr| CircuitBreaker::new(expr, CircuitBreakerConfig::default()))
            .transpose()?;

        let limiter = options.source_rate_limit.as_ref().map(|limit| {
            let rates: Arc<dyn RateExtractor> = match &limit.rates {
                Some(rates) => Arc::clone(rates),
                None => Arc::new(FixedRates {
                    rate: limit.rps,
                    burst: limit.burst,
                }),
            };
            SourceLimiter::new(limit.sources.clone(), rates, limit.metrics.clone())
        });

        let connections = options
            .connection_limit
            .as_ref()
            .map(|limit| Arc::new(ConnectionTracker::new(limit.max, limit.sources.clone())));

        Ok(Self {
            breaker,
            limiter,
            connections,
            forwarder,
            write_timeout: options.write_timeout,
            cors: options.cors.clone(),
        })
    }

    pub async fn serve(&self, req: Request<Body>, meta: &RequestMeta, upstream: &str) -> Response<Body> {
        let Some(breaker) = &self.breaker else {
            return self.admit(req, meta, upstream).await;
        };

        if !breaker.admit() {
            return write_error(&GatewayError::Busy, meta, &self.cors);
        }

        let start = Instant::now();
        let resp = self.admit(req, meta, upstream).await;
        breaker.record(resp.status().as_u16(), start.elapsed());
        resp
    }

    async fn admit(&self, req: Request<Body>, meta: &RequestMeta, upstream: &str) -> Response<Body> {
        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&req) {
                return write_error(&GatewayError::RateLimited, meta, &self.cors);
            }
        }

        let _slot = match &self.connections {
            Some(tracker) => match tracker.try_acquire(&req) {
                Ok(slot) => Some(slot),
                Err(ConnectionLimitError::Exceeded(_)) => {
                    return write_error(&GatewayError::ConnectionLimited, meta, &self.cors);
                }
                Err(e @ ConnectionLimitError::Extract(_)) => {
                    return write_error(&GatewayError::Internal(e.to_string()), meta, &self.cors);
                }
            },
            None => None,
        };

        let req = match buffer(req).await {
            Ok(req) => req,
            Err(err) => return write_error(&err, meta, &self.cors),
        };

        match tokio::time::timeout(self.write_timeout, self.forwarder.serve(req, meta, upstream)).await {
            Ok(resp) => resp,
            Err(_) => {
                tracing::warn!(upstream = %upstream, timeout = ?self.write_timeout, "Upstream response timed out");
                write_error(&GatewayError::GatewayTimeout, meta, &self.cors)
            }
        }
    }
}

/// Read the whole body into memory, refusing anything over the limit.
async fn buffer(req: Request<Body>) -> Result<Request<Body>, GatewayError> {
    let (parts, body) = req.into_parts();

    let collected = Limited::new(body, MAX_BODY_BYTES).collect().await.map_err(|e| {
        if e.is::<http_body_util::LengthLimitError>() {
            GatewayError::body_too_large()
        } else {
            tracing::debug!(error = %e, "Client body read failed");
            GatewayError::ClientClosed
        }
    })?;

    Ok(Request::from_parts(parts, Body::from(collected.to_bytes())))
}
