//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method and status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_tcp_connections` (gauge): open client connections
//! - `gateway_ws_connections` (gauge): open websocket tunnels
//! - `gateway_limiter_decisions_total` (counter): accepted/limited by the
//!   rate limiters
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; the Prometheus exporter
//!   is installed once by the binary
//! - The gateway only sees the `MetricsManager`/`LimiterMetricManager`
//!   traits, so embedders can plug their own sink

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install prometheus exporter: {0}")]
    Install(String),
}

/// Request and connection accounting hooks.
pub trait MetricsManager: Send + Sync {
    fn record_request(&self, method: &str, status: u16, elapsed: Duration);
    fn register_tcp_connection(&self);
    fn unregister_tcp_connection(&self);
    fn register_ws_connection(&self);
    fn unregister_ws_connection(&self);
}

/// Rate limiter decision hooks.
pub trait LimiterMetricManager: Send + Sync {
    fn register_accepted_connection(&self);
    fn register_limited_connection(&self);
}

/// Reports to the global `metrics` recorder.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsManager {
    limiter: &'static str,
}

impl PrometheusMetricsManager {
    /// `limiter` labels the decisions this instance records.
    pub fn new(limiter: &'static str) -> Self {
        Self { limiter }
    }
}

impl Default for PrometheusMetricsManager {
    fn default() -> Self {
        Self::new("gateway")
    }
}

impl MetricsManager for PrometheusMetricsManager {
    fn record_request(&self, method: &str, status: u16, elapsed: Duration) {
        metrics::counter!(
            "gateway_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!("gateway_request_duration_seconds", "method" => method.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn register_tcp_connection(&self) {
        metrics::gauge!("gateway_tcp_connections").increment(1.0);
    }

    fn unregister_tcp_connection(&self) {
        metrics::gauge!("gateway_tcp_connections").decrement(1.0);
    }

    fn register_ws_connection(&self) {
        metrics::gauge!("gateway_ws_connections").increment(1.0);
    }

    fn unregister_ws_connection(&self) {
        metrics::gauge!("gateway_ws_connections").decrement(1.0);
    }
}

impl LimiterMetricManager for PrometheusMetricsManager {
    fn register_accepted_connection(&self) {
        metrics::counter!(
            "gateway_limiter_decisions_total",
            "limiter" => self.limiter,
            "decision" => "accepted"
        )
        .increment(1);
    }

    fn register_limited_connection(&self) {
        metrics::counter!(
            "gateway_limiter_decisions_total",
            "limiter" => self.limiter,
            "decision" => "limited"
        )
        .increment(1);
    }
}

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}
