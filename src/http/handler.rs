//! The gateway request pipeline.
//!
//! # Data Flow
//! ```text
//! request
//!     → OPTIONS: 200 + CORS preflight
//!     → maintenance: 423 Service Locked
//!     → interceptors (exact, prefix, suffix)
//!     → upstreamer (unless an interceptor chose the upstream)
//!     → ForwardWs / WebSocket upgrade: raw tunnel
//!     → ForwardDirect: forwarder only
//!     → Forward: admission chain, then forwarder
//!     → latency fed back to the upstreamer (non-WebSocket paths)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, Response, StatusCode};

use crate::http::chain::Chain;
use crate::http::error::{write_error, GatewayError, RequestMeta};
use crate::http::forwarder::Forwarder;
use crate::http::request::{is_websocket_upgrade, X_REQUEST_ID};
use crate::observability::metrics::MetricsManager;
use crate::routing::interceptor::{Interception, InterceptorAction, Interceptors};
use crate::routing::upstream::{LatencyCollector, UpstreamError, Upstreamer};
use crate::security::cors::CorsPolicy;

pub struct GatewayCore {
    pub(crate) upstreamer: Arc<dyn Upstreamer>,
    pub(crate) latency: Option<Arc<dyn LatencyCollector>>,
    pub(crate) interceptors: Interceptors,
    pub(crate) cors: CorsPolicy,
    pub(crate) maintenance: Arc<AtomicBool>,
    pub(crate) metrics: Option<Arc<dyn MetricsManager>>,
    pub(crate) chain: Chain,
    pub(crate) forwarder: Arc<Forwarder>,
}

enum Route {
    Chain,
    Direct,
    WebSocket,
}

impl GatewayCore {
    pub async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let meta = RequestMeta::new(req.method(), req.headers());

        if req.method() == Method::OPTIONS {
            let mut resp = Response::new(Body::empty());
            self.cors.inject(resp.headers_mut(), &meta.origin, true);
            return resp;
        }

        if self.maintenance.load(Ordering::Relaxed) {
            return self.error(&GatewayError::Locked, &meta);
        }

        let (route, chosen) = match self.interceptors.intercept(&mut req) {
            None => (Route::Chain, None),
            Some(Err(e)) => {
                let err = GatewayError::Internal(format!("unable to run interceptor: {}", e));
                return self.error(&err, &meta);
            }
            Some(Ok(Interception {
                action: InterceptorAction::Stop(mut resp),
                ..
            })) => {
                self.cors.inject(resp.headers_mut(), &meta.origin, false);
                return resp;
            }
            Some(Ok(Interception { action, upstream })) => {
                let route = match action {
                    InterceptorAction::ForwardWs => Route::WebSocket,
                    InterceptorAction::ForwardDirect => Route::Direct,
                    _ => Route::Chain,
                };
                (route, upstream.filter(|u| !u.is_empty()))
            }
        };

        let upstream = match chosen {
            Some(upstream) => upstream,
            None => match self.upstreamer.upstream(&req) {
                Ok(Some(upstream)) => upstream,
                Ok(None) => return self.error(&GatewayError::ServiceUnavailable, &meta),
                Err(UpstreamError::TooManyRequests) => {
                    if let Some(m) = &self.metrics {
                        m.record_request(req.method().as_str(), StatusCode::TOO_MANY_REQUESTS.as_u16(), start.elapsed());
                    }
                    return self.error(&GatewayError::RateLimited, &meta);
                }
                Err(UpstreamError::Other(msg)) => {
                    tracing::error!(
                        method = %req.method(),
                        path = %req.uri().path(),
                        error = %msg,
                        "Upstreamer error"
                    );
                    return self.error(&GatewayError::Internal(msg), &meta);
                }
            },
        };

        let route = match route {
            Route::Chain if is_websocket_upgrade(&req) => Route::WebSocket,
            route => route,
        };

        tracing::debug!(
            method = %req.method(),
            path = %req.uri().path(),
            request_id = ?req.headers().get(&X_REQUEST_ID),
            routed = %upstream,
            "Forwarding request"
        );

        let method = req.method().clone();
        let resp = match route {
            Route::WebSocket => {
                return self
                    .forwarder
                    .serve_websocket(req, &meta, &upstream, self.metrics.clone())
                    .await;
            }
            Route::Direct => self.forwarder.serve(req, &meta, &upstream).await,
            Route::Chain => self.chain.serve(req, &meta, &upstream).await,
        };

        let elapsed = start.elapsed();
        if let Some(m) = &self.metrics {
            m.record_request(method.as_str(), resp.status().as_u16(), elapsed);
        }
        if let Some(collector) = &self.latency {
            collector.collect_latency(&upstream, elapsed);
        }

        resp
    }

    fn error(&self, err: &GatewayError, meta: &RequestMeta) -> Response<Body> {
        write_error(err, meta, &self.cors)
    }
}

/// Axum fallback handler serving every path and method.
pub async fn gateway_handler(State(core): State<Arc<GatewayCore>>, req: Request<Body>) -> Response<Body> {
    core.handle(req).await
}
