//! Raw forwarder: rewrite, send upstream, rewrite the response back.
//!
//! # Responsibilities
//! - Pool upstream connections (hyper-util legacy client over rustls)
//! - Bound connect and TLS handshake time
//! - Tunnel WebSocket upgrades byte for byte
//!
//! # Design Decisions
//! - Errors are classified once and rendered by the shared error writer
//! - The handshake timeout wraps the whole connector, so a slow TCP
//!   connect counts against it too

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder, MaybeHttpsStream};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tower::timeout::future::ResponseFuture;
use tower::timeout::Timeout;
use tower::util::MapFuture;
use tower::{Service, ServiceBuilder};

use crate::http::error::{write_error, GatewayError, RequestMeta};
use crate::http::options::GatewayOptions;
use crate::http::rewrite::Rewriter;
use crate::observability::metrics::MetricsManager;
use crate::routing::interceptor::BoxError;
use crate::security::cors::CorsPolicy;

type HttpsStream = MaybeHttpsStream<TokioIo<TcpStream>>;
type Connecting = <HttpsConnector<HttpConnector> as Service<Uri>>::Future;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<HttpsStream, BoxError>> + Send>>;
type UpstreamConnector = MapFuture<Timeout<HttpsConnector<HttpConnector>>, fn(ResponseFuture<Connecting>) -> ConnectFuture>;

fn box_connect(fut: ResponseFuture<Connecting>) -> ConnectFuture {
    Box::pin(fut)
}

pub struct Forwarder {
    client: Client<UpstreamConnector, Body>,
    rewriter: Rewriter,
    scheme: String,
    cors: CorsPolicy,
}

impl Forwarder {
    pub fn new(options: &GatewayOptions) -> Result<Self, rustls::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(options.upstream_connect_timeout));
        http.set_keepalive(Some(Duration::from_secs(30)));
        http.set_nodelay(true);

        let builder = match options.upstream_tls.clone() {
            Some(tls) => HttpsConnectorBuilder::new().with_tls_config(tls),
            None => HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?,
        };
        let https = if options.upstream_http2 {
            builder.https_or_http().enable_http1().enable_http2().wrap_connector(http)
        } else {
            builder.https_or_http().enable_http1().wrap_connector(http)
        };

        let connector: UpstreamConnector = ServiceBuilder::new()
            .map_future(box_connect as fn(ResponseFuture<Connecting>) -> ConnectFuture)
            .timeout(options.upstream_tls_handshake_timeout)
            .service(https);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(options.upstream_idle_timeout)
            .pool_max_idle_per_host(options.upstream_max_idle_per_host)
            .build(connector);

        Ok(Self {
            client,
            rewriter: Rewriter::new(
                options.request_rewriter.clone(),
                options.response_rewriter.clone(),
                options.expose_private_apis,
                options.block_tracing_headers,
                options.trust_forward_header,
                options.cors.clone(),
            ),
            scheme: options.upstream_scheme.clone(),
            cors: options.cors.clone(),
        })
    }

    /// Forward `req` to `upstream`. Failures come back as rendered error
    /// responses.
    pub async fn serve(&self, req: Request<Body>, meta: &RequestMeta, upstream: &str) -> Response<Body> {
        match self.forward(req, meta, upstream).await {
            Ok(resp) => resp,
            Err(err) => write_error(&err, meta, &self.cors),
        }
    }

    async fn forward(&self, mut req: Request<Body>, meta: &RequestMeta, upstream: &str) -> Result<Response<Body>, GatewayError> {
        self.rewriter.rewrite_request(&mut req, upstream, &self.scheme, false)?;

        let resp = self.client.request(req).await.map_err(|e| {
            tracing::warn!(upstream = %upstream, error = %e, "Upstream request failed");
            GatewayError::from_forward_error(&e)
        })?;

        let mut resp = resp.map(Body::new);
        self.rewriter.rewrite_response(&mut resp, meta)?;
        Ok(resp)
    }

    /// Forward a WebSocket upgrade and, once both sides switched protocols,
    /// splice the two connections together.
    pub async fn serve_websocket(
        &self,
        req: Request<Body>,
        meta: &RequestMeta,
        upstream: &str,
        metrics: Option<Arc<dyn MetricsManager>>,
    ) -> Response<Body> {
        match self.tunnel(req, meta, upstream, metrics).await {
            Ok(resp) => resp,
            Err(err) => write_error(&err, meta, &self.cors),
        }
    }

    async fn tunnel(
        &self,
        mut req: Request<Body>,
        meta: &RequestMeta,
        upstream: &str,
        metrics: Option<Arc<dyn MetricsManager>>,
    ) -> Result<Response<Body>, GatewayError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        self.rewriter.rewrite_request(&mut req, upstream, &self.scheme, true)?;

        let mut resp = self.client.request(req).await.map_err(|e| {
            tracing::warn!(upstream = %upstream, error = %e, "Upstream websocket request failed");
            GatewayError::from_forward_error(&e)
        })?;

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            let mut resp = resp.map(Body::new);
            self.rewriter.rewrite_response(&mut resp, meta)?;
            return Ok(resp);
        }

        let upstream_upgrade = hyper::upgrade::on(&mut resp);
        let address = upstream.to_string();

        tokio::spawn(async move {
            let (client, server) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(upstream = %address, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };

            if let Some(m) = &metrics {
                m.register_ws_connection();
            }

            let mut client = TokioIo::new(client);
            let mut server = TokioIo::new(server);
            match tokio::io::copy_bidirectional(&mut client, &mut server).await {
                Ok((sent, received)) => {
                    tracing::debug!(upstream = %address, sent, received, "WebSocket tunnel closed")
                }
                Err(e) => tracing::debug!(upstream = %address, error = %e, "WebSocket tunnel aborted"),
            }

            if let Some(m) = &metrics {
                m.unregister_ws_connection();
            }
        });

        let mut resp = resp.map(Body::new);
        self.rewriter.rewrite_response(&mut resp, meta)?;
        Ok(resp)
    }
}
