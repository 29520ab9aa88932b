//! Gateway tunables, built with chained setters.

use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::http::rewrite::{RequestRewriter, ResponseRewriter};
use crate::observability::metrics::{LimiterMetricManager, MetricsManager};
use crate::routing::interceptor::{InterceptorFn, Interceptors};
use crate::security::cors::CorsPolicy;
use crate::security::extractors::{RateExtractor, SourceExtractor};

/// TCP accept limiter settings.
#[derive(Clone)]
pub struct TcpRateLimit {
    pub cps: f64,
    pub burst: usize,
    pub metrics: Option<Arc<dyn LimiterMetricManager>>,
}

/// Per-source HTTP limiter settings.
#[derive(Clone)]
pub struct SourceRateLimit {
    pub rps: f64,
    pub burst: usize,
    pub sources: Option<Arc<dyn SourceExtractor>>,
    pub rates: Option<Arc<dyn RateExtractor>>,
    pub metrics: Option<Arc<dyn LimiterMetricManager>>,
}

/// Per-source in-flight request cap.
#[derive(Clone)]
pub struct ConnectionLimit {
    pub max: usize,
    pub sources: Option<Arc<dyn SourceExtractor>>,
}

#[derive(Clone)]
pub struct GatewayOptions {
    pub(crate) proxy_protocol_subnet: Option<IpNet>,
    pub(crate) tcp_rate_limit: Option<TcpRateLimit>,
    pub(crate) max_connections: usize,
    pub(crate) source_rate_limit: Option<SourceRateLimit>,
    pub(crate) connection_limit: Option<ConnectionLimit>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) keep_alive: bool,
    pub(crate) maintenance: bool,
    pub(crate) server_tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) upstream_tls: Option<rustls::ClientConfig>,
    pub(crate) upstream_max_idle_per_host: usize,
    pub(crate) upstream_idle_timeout: Duration,
    pub(crate) upstream_tls_handshake_timeout: Duration,
    pub(crate) upstream_connect_timeout: Duration,
    pub(crate) upstream_http2: bool,
    pub(crate) upstream_scheme: String,
    pub(crate) circuit_breaker: Option<String>,
    pub(crate) cors: CorsPolicy,
    pub(crate) request_rewriter: Option<RequestRewriter>,
    pub(crate) response_rewriter: Option<ResponseRewriter>,
    pub(crate) interceptors: Interceptors,
    pub(crate) metrics: Option<Arc<dyn MetricsManager>>,
    pub(crate) expose_private_apis: bool,
    pub(crate) block_tracing_headers: bool,
    pub(crate) trust_forward_header: bool,
    pub(crate) drain_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            proxy_protocol_subnet: None,
            tcp_rate_limit: None,
            max_connections: 10_000,
            source_rate_limit: None,
            connection_limit: None,
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(240),
            idle_timeout: Duration::from_secs(480),
            keep_alive: true,
            maintenance: false,
            server_tls: None,
            upstream_tls: None,
            upstream_max_idle_per_host: 64,
            upstream_idle_timeout: Duration::from_secs(90),
            upstream_tls_handshake_timeout: Duration::from_secs(10),
            upstream_connect_timeout: Duration::from_secs(30),
            upstream_http2: false,
            upstream_scheme: "https".to_string(),
            circuit_breaker: None,
            cors: CorsPolicy::default(),
            request_rewriter: None,
            response_rewriter: None,
            interceptors: Interceptors::new(),
            metrics: None,
            expose_private_apis: false,
            block_tracing_headers: false,
            trust_forward_header: false,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept PROXY protocol headers from peers inside `subnet`.
    pub fn proxy_protocol(mut self, subnet: IpNet) -> Self {
        self.proxy_protocol_subnet = Some(subnet);
        self
    }

    /// Limit accepted connections per second.
    pub fn tcp_rate_limiting(mut self, cps: f64, burst: usize, metrics: Option<Arc<dyn LimiterMetricManager>>) -> Self {
        self.tcp_rate_limit = Some(TcpRateLimit { cps, burst, metrics });
        self
    }

    /// Cap on concurrently open client connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Per-source token buckets in front of the forwarder.
    pub fn source_rate_limiting(mut self, rps: f64, burst: usize) -> Self {
        let current = self.source_rate_limit.take();
        self.source_rate_limit = Some(SourceRateLimit {
            rps,
            burst,
            sources: current.as_ref().and_then(|c| c.sources.clone()),
            rates: current.as_ref().and_then(|c| c.rates.clone()),
            metrics: current.and_then(|c| c.metrics),
        });
        self
    }

    /// How sources are keyed. Takes effect once source limiting is enabled.
    pub fn source_extractor(mut self, sources: Arc<dyn SourceExtractor>) -> Self {
        if let Some(limit) = self.source_rate_limit.as_mut() {
            limit.sources = Some(sources);
        }
        self
    }

    /// Per-request rates. Takes effect once source limiting is enabled.
    pub fn rate_extractor(mut self, rates: Arc<dyn RateExtractor>) -> Self {
        if let Some(limit) = self.source_rate_limit.as_mut() {
            limit.rates = Some(rates);
        }
        self
    }

    pub fn limiter_metrics(mut self, metrics: Arc<dyn LimiterMetricManager>) -> Self {
        if let Some(limit) = self.source_rate_limit.as_mut() {
            limit.metrics = Some(metrics);
        }
        self
    }

    /// Cap requests in flight per source, keyed by the client IP unless
    /// an extractor is given.
    pub fn tcp_client_max_connections(mut self, max: usize, sources: Option<Arc<dyn SourceExtractor>>) -> Self {
        self.connection_limit = Some(ConnectionLimit { max, sources });
        self
    }

    pub fn http_timeouts(mut self, read: Duration, write: Duration, idle: Duration, keep_alive: bool) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self.idle_timeout = idle;
        self.keep_alive = keep_alive;
        self
    }

    pub fn maintenance(mut self, enabled: bool) -> Self {
        self.maintenance = enabled;
        self
    }

    pub fn server_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.server_tls = Some(config);
        self
    }

    pub fn upstream_tls(mut self, config: rustls::ClientConfig) -> Self {
        self.upstream_tls = Some(config);
        self
    }

    pub fn upstream_pooling(mut self, max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        self.upstream_max_idle_per_host = max_idle_per_host;
        self.upstream_idle_timeout = idle_timeout;
        self
    }

    pub fn upstream_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_tls_handshake_timeout = timeout;
        self
    }

    pub fn upstream_connect_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_connect_timeout = timeout;
        self
    }

    pub fn upstream_http2(mut self, enabled: bool) -> Self {
        self.upstream_http2 = enabled;
        self
    }

    /// Scheme used to reach upstreams, `https` unless changed.
    pub fn upstream_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.upstream_scheme = scheme.into();
        self
    }

    /// Trip expression, validated when the gateway is built.
    pub fn circuit_breaker(mut self, expression: impl Into<String>) -> Self {
        let expression = expression.into();
        self.circuit_breaker = (!expression.is_empty()).then_some(expression);
        self
    }

    pub fn cors(mut self, policy: CorsPolicy) -> Self {
        self.cors = policy;
        self
    }

    pub fn request_rewriter(mut self, rewriter: RequestRewriter) -> Self {
        self.request_rewriter = Some(rewriter);
        self
    }

    pub fn response_rewriter(mut self, rewriter: ResponseRewriter) -> Self {
        self.response_rewriter = Some(rewriter);
        self
    }

    pub fn exact_interceptor(mut self, path: impl Into<String>, f: InterceptorFn) -> Self {
        self.interceptors.register_exact(path, f);
        self
    }

    pub fn prefix_interceptor(mut self, prefix: impl Into<String>, f: InterceptorFn) -> Self {
        self.interceptors.register_prefix(prefix, f);
        self
    }

    pub fn suffix_interceptor(mut self, suffix: impl Into<String>, f: InterceptorFn) -> Self {
        self.interceptors.register_suffix(suffix, f);
        self
    }

    pub fn metrics_manager(mut self, metrics: Arc<dyn MetricsManager>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn expose_private_apis(mut self, enabled: bool) -> Self {
        self.expose_private_apis = enabled;
        self
    }

    /// Strip distributed tracing headers from public traffic.
    pub fn block_tracing_headers(mut self, enabled: bool) -> Self {
        self.block_tracing_headers = enabled;
        self
    }

    /// Keep client-supplied `X-Forwarded-For` and `X-Real-IP`.
    pub fn trust_forward_header(mut self, enabled: bool) -> Self {
        self.trust_forward_header = enabled;
        self
    }

    /// How long in-flight connections get to finish on stop.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
