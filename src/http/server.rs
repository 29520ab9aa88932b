//! HTTP server setup and lifecycle.
//!
//! # Responsibilities
//! - Build the gateway pipeline from `GatewayOptions`
//! - Accept connections (rate limit, PROXY protocol, TLS)
//! - Serve HTTP/1.1 and HTTP/2 with upgrades via hyper-util
//! - Wire up middleware (tracing, request ID)
//! - Drain gracefully while a goodbye listener answers 503

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::Request;
use axum::response::IntoResponse;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use ipnet::IpNet;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::http::chain::Chain;
use crate::http::error::GatewayError;
use crate::http::forwarder::Forwarder;
use crate::http::handler::{gateway_handler, GatewayCore};
use crate::http::options::GatewayOptions;
use crate::http::request::{ClientInfo, MakeRequestUuid, X_REQUEST_ID};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{AcceptLimiter, Listener, ListenerError};
use crate::net::proxy_protocol::ProxiedStream;
use crate::net::tls::peer_certificate;
use crate::resilience::condition::ConditionError;
use crate::routing::upstream::Upstreamer;

const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const GOODBYE_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to initialize circuit breaker: {0}")]
    CircuitBreaker(#[from] ConditionError),

    #[error("unable to initialize forwarder: {0}")]
    Forwarder(#[from] rustls::Error),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// The API gateway: pipeline plus listener configuration.
pub struct Gateway {
    core: Arc<GatewayCore>,
    options: GatewayOptions,
}

impl Gateway {
    /// Build the pipeline. The upstreamer's latency capability is looked up
    /// once, here.
    pub fn new<U: Upstreamer>(upstreamer: Arc<U>, options: GatewayOptions) -> Result<Self, ServerError> {
        let latency = Arc::clone(&upstreamer).latency_collector();
        let forwarder = Arc::new(Forwarder::new(&options)?);
        let chain = Chain::new(&options, Arc::clone(&forwarder))?;

        let core = GatewayCore {
            upstreamer,
            latency,
            interceptors: options.interceptors.clone(),
            cors: options.cors.clone(),
            maintenance: Arc::new(AtomicBool::new(options.maintenance)),
            metrics: options.metrics.clone(),
            chain,
            forwarder,
        };

        Ok(Self {
            core: Arc::new(core),
            options,
        })
    }

    /// Shared maintenance flag, flipped at runtime.
    pub fn maintenance_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.core.maintenance)
    }

    pub fn is_maintenance(&self) -> bool {
        self.core.maintenance.load(Ordering::Relaxed)
    }

    pub fn set_maintenance(&self, enabled: bool) {
        self.core.maintenance.store(enabled, Ordering::Relaxed);
        tracing::info!(maintenance = enabled, "Maintenance mode changed");
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(&self) -> Router {
        Router::new()
            .fallback(gateway_handler)
            .with_state(Arc::clone(&self.core))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID.clone(), MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID.clone())),
            )
    }

    fn connection_builder(&self) -> auto::Builder<TokioExecutor> {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.options.read_timeout)
            .keep_alive(self.options.keep_alive);
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(self.options.idle_timeout);
        builder
    }

    /// Bind `addr` and start serving in the background.
    pub async fn start(&self, addr: &str) -> Result<RunningGateway, ServerError> {
        let accept_limit = self
            .options
            .tcp_rate_limit
            .as_ref()
            .map(|l| AcceptLimiter::new(l.cps, l.burst, l.metrics.clone()));

        let listener = Listener::bind(addr, self.options.max_connections, accept_limit).await?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        let tracker = ConnectionTracker::new(self.options.metrics.clone());
        let shutdown = Shutdown::new();

        let ctx = Arc::new(ServeContext {
            router: self.build_router(),
            builder: self.connection_builder(),
            tls: self.options.server_tls.clone().map(TlsAcceptor::from),
            proxy_subnet: self.options.proxy_protocol_subnet,
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown.subscribe()));

        tracing::info!(
            address = %local_addr,
            tls = self.options.server_tls.is_some(),
            proxy_protocol = ?self.options.proxy_protocol_subnet,
            "Gateway started"
        );

        Ok(RunningGateway {
            local_addr,
            shutdown,
            accept_task,
            tracker,
            drain_timeout: self.options.drain_timeout,
            tls: self.options.server_tls.clone().map(TlsAcceptor::from),
        })
    }
}

struct ServeContext {
    router: Router,
    builder: auto::Builder<TokioExecutor>,
    tls: Option<TlsAcceptor>,
    proxy_subnet: Option<IpNet>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

/// A gateway accepting traffic.
pub struct RunningGateway {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    accept_task: JoinHandle<()>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

impl RunningGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Stop accepting, let in-flight requests finish within the drain
    /// timeout, and answer newcomers with 503 meanwhile.
    pub async fn stop(self) {
        self.shutdown.trigger();
        if let Err(e) = self.accept_task.await {
            tracing::error!(error = %e, "Accept loop panicked");
        }

        let goodbye_shutdown = Shutdown::new();
        let goodbye = tokio::spawn(goodbye_server(self.local_addr, self.tls, goodbye_shutdown.clone()));

        if self.tracker.wait_for_drain(self.drain_timeout).await {
            tracing::debug!("Gateway drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                timeout = ?self.drain_timeout,
                "Could not gracefully stop gateway"
            );
        }

        tracing::info!("Stopping temporary goodbye server");
        goodbye_shutdown.trigger();
        if tokio::time::timeout(GOODBYE_DEADLINE, goodbye).await.is_err() {
            tracing::warn!("Goodbye server did not stop in time");
        }
        tracing::info!("Gateway stopped");
    }
}

async fn accept_loop(listener: Listener, ctx: Arc<ServeContext>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, &ctx).await;
                        drop(permit);
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &ServeContext) {
    let guard = ctx.tracker.track();
    let shutdown = ctx.shutdown.subscribe();

    let trusted = ctx.proxy_subnet.is_some_and(|subnet| subnet.contains(&peer.ip()));
    let (stream, remote) = if trusted {
        match tokio::time::timeout(PROXY_HEADER_TIMEOUT, ProxiedStream::accept(stream)).await {
            Ok(Ok((stream, source))) => (stream, source.unwrap_or(peer)),
            Ok(Err(e)) => {
                tracing::debug!(peer_addr = %peer, error = %e, "Rejected proxy protocol header");
                return;
            }
            Err(_) => {
                tracing::debug!(peer_addr = %peer, "Timed out reading proxy protocol header");
                return;
            }
        }
    } else {
        (ProxiedStream::raw(stream), peer)
    };

    tracing::trace!(connection_id = %guard.id(), peer_addr = %peer, client = %remote, "Serving connection");

    match &ctx.tls {
        Some(acceptor) => {
            let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    tracing::debug!(client = %remote, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(client = %remote, "TLS handshake timed out");
                    return;
                }
            };
            let info = ClientInfo::tls(remote, peer_certificate(tls.get_ref().1));
            serve_http(TokioIo::new(tls), info, ctx, shutdown).await;
        }
        None => serve_http(TokioIo::new(stream), ClientInfo::plain(remote), ctx, shutdown).await,
    }
}

async fn serve_http<I>(io: I, info: ClientInfo, ctx: &ServeContext, mut shutdown: broadcast::Receiver<()>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let router = ctx.router.clone();
    let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(info.clone());
        router.clone().oneshot(req)
    });

    let conn = ctx.builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut draining = ctx.shutdown.is_triggered();
    if draining {
        conn.as_mut().graceful_shutdown();
    }
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    tracing::debug!(error = %e, "Connection closed with error");
                }
                break;
            }
            _ = shutdown.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Answer every request with 503 until told to stop. Binding is retried
/// while the gateway's own listener still holds the address.
async fn goodbye_server(addr: SocketAddr, tls: Option<TlsAcceptor>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();

    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tokio::select! {
                    _ = stop.recv() => return,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
                }
            }
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "Unable to start temporary goodbye server");
                return;
            }
        }
    };
    tracing::info!(address = %addr, "Temporary goodbye server started");

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(false);
    let builder = Arc::new(builder);

    loop {
        let (stream, _) = tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "Goodbye accept failed");
                    continue;
                }
            },
        };

        let builder = Arc::clone(&builder);
        let tls = tls.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(|_req: Request<Incoming>| async {
                Ok::<_, Infallible>(GatewayError::ShuttingDown.into_response())
            });

            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => builder.serve_connection(TokioIo::new(tls), service).await,
                    Err(_) => return,
                },
                None => builder.serve_connection(TokioIo::new(stream), service).await,
            };
            if let Err(e) = result {
                tracing::trace!(error = %e, "Goodbye connection error");
            }
        });
    }
}

