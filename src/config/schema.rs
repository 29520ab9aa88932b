//! Configuration schema definitions.
//!
//! This module defines the file configuration of the gateway binary. All
//! types derive Serde traits for deserialization from TOML, and every
//! section has defaults so a minimal file only names what it changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::observability::logging::LogFormat;
use crate::security::cors::ORIGIN_MIRROR;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayFileConfig {
    pub listener: ListenerConfig,
    pub proxy_protocol: ProxyProtocolConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub upstream: UpstreamConfig,
    pub cors: CorsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub security: SecurityConfig,
    pub pubsub: PubSubConfig,
    pub upstreamer: UpstreamerConfig,
    pub services: Vec<ServiceConfig>,
    pub observability: ObservabilityConfig,

    /// Answer every non-preflight request with 423.
    pub maintenance: bool,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long in-flight requests may run after a stop was requested.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
            drain_timeout_secs: 30,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// CA used to verify client certificates, when clients present one.
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    pub enabled: bool,

    /// Only peers in this CIDR may send a PROXY header.
    pub trusted_subnet: String,
}

/// Admission limits. A zero rate disables the matching limiter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub tcp_connections_per_second: f64,
    pub tcp_burst: usize,

    pub source_requests_per_second: f64,
    pub source_burst: usize,

    /// Cookie holding credentials; `Authorization` is used otherwise.
    pub auth_cookie: Option<String>,

    /// Concurrent requests allowed per client IP.
    pub max_connections_per_source: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tcp_connections_per_second: 0.0,
            tcp_burst: 100,
            source_requests_per_second: 0.0,
            source_burst: 100,
            auth_cookie: None,
            max_connections_per_source: 0,
        }
    }
}

/// HTTP server timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read_secs: u64,
    pub write_secs: u64,
    pub idle_secs: u64,
    pub keep_alive: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 120,
            write_secs: 240,
            idle_secs: 480,
            keep_alive: true,
        }
    }
}

/// Client used to reach backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub scheme: String,
    pub http2: bool,
    pub max_idle_per_host: usize,
    pub idle_timeout_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Extra CA trusted for backend certificates.
    pub ca_path: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            http2: false,
            max_idle_per_host: 64,
            idle_timeout_secs: 90,
            tls_handshake_timeout_secs: 10,
            connect_timeout_secs: 30,
            ca_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// `_mirror_` echoes the request origin.
    pub allow_origin: String,
    pub additional_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: ORIGIN_MIRROR.to_string(),
            additional_origins: Vec::new(),
            allow_credentials: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Trip condition, e.g. `NetworkErrorRatio() > 0.5`. Empty disables it.
    pub expression: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub expose_private_apis: bool,
    pub block_tracing_headers: bool,
    pub trust_forward_header: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub service_topic: String,
    pub peer_topic: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            service_topic: "services".to_string(),
            peer_topic: "gateways".to_string(),
        }
    }
}

/// Registry and balancer tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamerConfig {
    pub required_services: Vec<String>,
    pub override_endpoint_address: Option<String>,
    pub service_timeout_secs: u64,
    pub service_check_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub peer_check_interval_secs: u64,
    pub peer_ping_interval_secs: u64,
    pub latency_sample_size: usize,
    pub token_requests_per_second: f64,
    pub token_burst: usize,

    /// Endpoint path to the service whose instances receive it.
    pub event_apis: HashMap<String, String>,
}

impl Default for UpstreamerConfig {
    fn default() -> Self {
        Self {
            required_services: Vec::new(),
            override_endpoint_address: None,
            service_timeout_secs: 30,
            service_check_interval_secs: 5,
            peer_timeout_secs: 30,
            peer_check_interval_secs: 5,
            peer_ping_interval_secs: 10,
            latency_sample_size: 20,
            token_requests_per_second: 500.0,
            token_burst: 2000,
            event_apis: HashMap::new(),
        }
    }
}

/// A backend announced by this process on the service topic.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub endpoint: String,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub push_endpoint: String,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default)]
    pub routes: Vec<ServiceRouteConfig>,

    /// Identity to announced rate limit.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

fn default_ping_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceRouteConfig {
    #[serde(default = "default_version")]
    pub version: i32,
    pub identity: String,
    pub url: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub private: bool,
}

fn default_version() -> i32 {
    1
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub limit: f64,
    pub burst: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: GatewayFileConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.timeouts.write_secs, 240);
        assert_eq!(config.cors.allow_origin, ORIGIN_MIRROR);
        assert_eq!(config.pubsub.service_topic, "services");
        assert!(config.services.is_empty());
        assert!(!config.maintenance);
    }

    #[test]
    fn services_parse() {
        let config: GatewayFileConfig = toml::from_str(
            r#"
            maintenance = true

            [[services]]
            name = "users"
            endpoint = "127.0.0.1:4000"

            [[services.routes]]
            identity = "users"
            url = "/v/1/users"
            verbs = ["GET"]

            [services.rate_limits.users]
            limit = 10.0
            burst = 20
            "#,
        )
        .unwrap();

        assert!(config.maintenance);
        let svc = &config.services[0];
        assert_eq!(svc.ping_interval_secs, 5);
        assert_eq!(svc.routes[0].version, 1);
        assert_eq!(svc.rate_limits["users"].burst, 20);
    }
}
