//! Turns the file configuration into the in-process builders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use crate::config::loader::ConfigError;
use crate::config::schema::{GatewayFileConfig, ServiceConfig};
use crate::config::validation::ValidationError;
use crate::http::options::GatewayOptions;
use crate::net::tls::{load_client_config, load_server_config};
use crate::observability::metrics::{LimiterMetricManager, PrometheusMetricsManager};
use crate::security::cors::CorsPolicy;
use crate::security::extractors::AuthSourceExtractor;
use crate::upstreamer::ping::{ApiLimiter, RouteInfo};
use crate::upstreamer::{NotifierOptions, UpstreamerOptions};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

impl GatewayFileConfig {
    /// Gateway options, loading TLS material from disk. Prometheus reporting
    /// is wired in when `with_metrics` is set.
    pub fn gateway_options(&self, with_metrics: bool) -> Result<GatewayOptions, ConfigError> {
        let t = &self.timeouts;
        let up = &self.upstream;
        let limits = &self.limits;

        let mut options = GatewayOptions::new()
            .max_connections(self.listener.max_connections)
            .drain_timeout(secs(self.listener.drain_timeout_secs))
            .http_timeouts(secs(t.read_secs), secs(t.write_secs), secs(t.idle_secs), t.keep_alive)
            .maintenance(self.maintenance)
            .upstream_scheme(up.scheme.clone())
            .upstream_http2(up.http2)
            .upstream_pooling(up.max_idle_per_host, secs(up.idle_timeout_secs))
            .upstream_tls_handshake_timeout(secs(up.tls_handshake_timeout_secs))
            .upstream_connect_timeout(secs(up.connect_timeout_secs))
            .cors(CorsPolicy::new(
                self.cors.allow_origin.clone(),
                self.cors.additional_origins.clone(),
                self.cors.allow_credentials,
            ))
            .circuit_breaker(self.circuit_breaker.expression.trim())
            .expose_private_apis(self.security.expose_private_apis)
            .block_tracing_headers(self.security.block_tracing_headers)
            .trust_forward_header(self.security.trust_forward_header);

        if with_metrics {
            options = options.metrics_manager(Arc::new(PrometheusMetricsManager::default()));
        }

        if self.proxy_protocol.enabled {
            let subnet: IpNet = self.proxy_protocol.trusted_subnet.parse().map_err(|_| {
                ConfigError::Validation(vec![ValidationError {
                    field: "proxy_protocol.trusted_subnet".into(),
                    message: "not a CIDR subnet".into(),
                }])
            })?;
            options = options.proxy_protocol(subnet);
        }

        if limits.tcp_connections_per_second > 0.0 {
            let metrics: Option<Arc<dyn LimiterMetricManager>> =
                with_metrics.then(|| Arc::new(PrometheusMetricsManager::new("tcp")) as Arc<dyn LimiterMetricManager>);
            options = options.tcp_rate_limiting(limits.tcp_connections_per_second, limits.tcp_burst, metrics);
        }

        if limits.source_requests_per_second > 0.0 {
            options = options
                .source_rate_limiting(limits.source_requests_per_second, limits.source_burst)
                .source_extractor(Arc::new(AuthSourceExtractor::new(limits.auth_cookie.clone())));
            if with_metrics {
                options = options.limiter_metrics(Arc::new(PrometheusMetricsManager::new("source")));
            }
        }

        if limits.max_connections_per_source > 0 {
            options = options.tcp_client_max_connections(limits.max_connections_per_source, None);
        }

        if let Some(tls) = &self.listener.tls {
            let config = load_server_config(
                Path::new(&tls.cert_path),
                Path::new(&tls.key_path),
                tls.client_ca_path.as_deref().map(Path::new),
            )?;
            options = options.server_tls(config);
        }

        if let Some(ca) = &up.ca_path {
            options = options.upstream_tls(load_client_config(Some(Path::new(ca)))?);
        }

        Ok(options)
    }

    pub fn upstreamer_options(&self) -> UpstreamerOptions {
        let u = &self.upstreamer;

        let mut options = UpstreamerOptions::new()
            .expose_private_apis(self.security.expose_private_apis)
            .required_services(u.required_services.clone())
            .service_timeout(secs(u.service_timeout_secs), secs(u.service_check_interval_secs))
            .peer_timeout(secs(u.peer_timeout_secs))
            .peer_check_interval(secs(u.peer_check_interval_secs))
            .peer_ping_interval(secs(u.peer_ping_interval_secs))
            .latency_sample_size(u.latency_sample_size)
            .token_rate_limiting(u.token_requests_per_second, u.token_burst);

        if let Some(host) = &u.override_endpoint_address {
            options = options.override_endpoint_address(host.clone());
        }
        for (endpoint, service) in &u.event_apis {
            options = options.register_event_api(service.clone(), endpoint.clone());
        }
        options
    }
}

impl ServiceConfig {
    pub fn notifier_options(&self) -> NotifierOptions {
        let mut routes: HashMap<i32, Vec<RouteInfo>> = HashMap::new();
        for r in &self.routes {
            routes.entry(r.version).or_default().push(RouteInfo {
                identity: r.identity.clone(),
                url: r.url.clone(),
                verbs: r.verbs.clone(),
                private: r.private,
            });
        }

        let limits = self
            .rate_limits
            .iter()
            .map(|(identity, l)| {
                (
                    identity.clone(),
                    ApiLimiter {
                        limit: l.limit,
                        burst: l.burst,
                    },
                )
            })
            .collect();

        NotifierOptions::new()
            .ping_interval(secs(self.ping_interval_secs))
            .prefix(self.prefix.clone().unwrap_or_default())
            .push_endpoint(self.push_endpoint.clone())
            .routes(routes)
            .announce_rate_limits(limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;

    #[test]
    fn file_settings_reach_the_builders() {
        let config = parse_config(
            r#"
            maintenance = true

            [listener]
            bind_address = "127.0.0.1:0"
            max_connections = 12

            [limits]
            source_requests_per_second = 5.0
            source_burst = 7
            max_connections_per_source = 3

            [upstream]
            scheme = "http"

            [upstreamer]
            latency_sample_size = 4
            required_services = ["users"]
            "#,
        )
        .unwrap();

        let options = config.gateway_options(false).unwrap();
        assert_eq!(options.max_connections, 12);
        assert!(options.maintenance);
        assert_eq!(options.upstream_scheme, "http");
        assert!(options.source_rate_limit.is_some());
        assert_eq!(options.connection_limit.as_ref().map(|c| c.max), Some(3));
        assert!(options.metrics.is_none());
        assert!(options.circuit_breaker.is_none());

        let upstreamer = config.upstreamer_options();
        assert_eq!(upstreamer.latency_sample_size, 4);
        assert_eq!(upstreamer.required_services, vec!["users".to_string()]);
    }

    #[test]
    fn service_routes_group_by_version() {
        let config = parse_config(
            r#"
            [[services]]
            name = "users"
            endpoint = "127.0.0.1:4000"
            prefix = "acme"

            [[services.routes]]
            identity = "users"
            url = "/v/1/users"

            [[services.routes]]
            version = 2
            identity = "users"
            url = "/v/2/users"
            "#,
        )
        .unwrap();

        let options = config.services[0].notifier_options();
        assert_eq!(options.routes[&1].len(), 1);
        assert_eq!(options.routes[&2][0].url, "/v/2/users");
        assert_eq!(options.prefix.as_deref(), Some("acme"));
    }
}
