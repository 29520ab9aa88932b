//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check expressions and subnets before anything is built from them
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of the parsed file

use std::net::SocketAddr;

use ipnet::IpNet;
use thiserror::Error;

use crate::config::schema::GatewayFileConfig;
use crate::resilience::condition::Condition;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayFileConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be positive"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new("listener.tls", "cert_path and key_path are required"));
        }
    }

    if config.proxy_protocol.enabled && config.proxy_protocol.trusted_subnet.parse::<IpNet>().is_err() {
        errors.push(ValidationError::new("proxy_protocol.trusted_subnet", "not a CIDR subnet"));
    }

    let limits = &config.limits;
    if limits.tcp_connections_per_second < 0.0 || limits.source_requests_per_second < 0.0 {
        errors.push(ValidationError::new("limits", "rates must not be negative"));
    }
    if limits.tcp_connections_per_second > 0.0 && limits.tcp_burst == 0 {
        errors.push(ValidationError::new("limits.tcp_burst", "must be positive"));
    }
    if limits.source_requests_per_second > 0.0 && limits.source_burst == 0 {
        errors.push(ValidationError::new("limits.source_burst", "must be positive"));
    }

    let t = &config.timeouts;
    for (field, secs) in [
        ("timeouts.read_secs", t.read_secs),
        ("timeouts.write_secs", t.write_secs),
        ("timeouts.idle_secs", t.idle_secs),
        ("upstream.connect_timeout_secs", config.upstream.connect_timeout_secs),
        ("upstream.tls_handshake_timeout_secs", config.upstream.tls_handshake_timeout_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::new(field, "must be positive"));
        }
    }

    if !matches!(config.upstream.scheme.as_str(), "http" | "https") {
        errors.push(ValidationError::new("upstream.scheme", "must be http or https"));
    }

    let expression = config.circuit_breaker.expression.trim();
    if !expression.is_empty() {
        if let Err(e) = expression.parse::<Condition>() {
            errors.push(ValidationError::new("circuit_breaker.expression", e.to_string()));
        }
    }

    if config.upstreamer.latency_sample_size == 0 {
        errors.push(ValidationError::new("upstreamer.latency_sample_size", "must be positive"));
    }

    for (i, svc) in config.services.iter().enumerate() {
        if svc.name.is_empty() {
            errors.push(ValidationError::new(format!("services[{i}].name"), "must not be empty"));
        }
        if svc.endpoint.is_empty() {
            errors.push(ValidationError::new(format!("services[{i}].endpoint"), "must not be empty"));
        }
        if svc.ping_interval_secs == 0 {
            errors.push(ValidationError::new(format!("services[{i}].ping_interval_secs"), "must be positive"));
        }
    }

    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("observability.metrics_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
