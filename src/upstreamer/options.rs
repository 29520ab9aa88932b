//! Upstreamer and notifier tunables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::upstreamer::ping::{ApiLimiters, RouteInfo};
use crate::upstreamer::randomizer::{Randomizer, ThreadRandomizer};

/// Upstreamer configuration, built with chained setters.
#[derive(Clone)]
pub struct UpstreamerOptions {
    pub(crate) expose_private_apis: bool,
    pub(crate) override_endpoint_address: Option<String>,
    pub(crate) event_apis: HashMap<String, String>,
    pub(crate) required_services: Vec<String>,
    pub(crate) service_timeout: Duration,
    pub(crate) service_timeout_check_interval: Duration,
    pub(crate) peer_timeout: Duration,
    pub(crate) peer_timeout_check_interval: Duration,
    pub(crate) peer_ping_interval: Duration,
    pub(crate) latency_sample_size: usize,
    pub(crate) randomizer: Arc<dyn Randomizer>,
    pub(crate) token_limiting_rps: f64,
    pub(crate) token_limiting_burst: usize,
}

impl Default for UpstreamerOptions {
    fn default() -> Self {
        Self {
            expose_private_apis: false,
            override_endpoint_address: None,
            event_apis: HashMap::new(),
            required_services: Vec::new(),
            service_timeout: Duration::from_secs(30),
            service_timeout_check_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            peer_timeout_check_interval: Duration::from_secs(5),
            peer_ping_interval: Duration::from_secs(10),
            latency_sample_size: 20,
            randomizer: Arc::new(ThreadRandomizer),
            token_limiting_rps: 500.0,
            token_limiting_burst: 2000,
        }
    }
}

impl UpstreamerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index private routes too.
    pub fn expose_private_apis(mut self, enabled: bool) -> Self {
        self.expose_private_apis = enabled;
        self
    }

    /// Replace the host of every announced endpoint, keeping its port.
    pub fn override_endpoint_address(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.override_endpoint_address = (!host.is_empty()).then_some(host);
        self
    }

    /// Route `endpoint` to the instances of `service`.
    pub fn register_event_api(mut self, service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.event_apis.insert(service.into(), endpoint.into());
        self
    }

    /// Services that must say hello before readiness fires.
    pub fn required_services(mut self, services: Vec<String>) -> Self {
        self.required_services = services;
        self
    }

    pub fn service_timeout(mut self, timeout: Duration, check_interval: Duration) -> Self {
        self.service_timeout = timeout;
        self.service_timeout_check_interval = check_interval;
        self
    }

    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn peer_check_interval(mut self, interval: Duration) -> Self {
        self.peer_timeout_check_interval = interval;
        self
    }

    pub fn peer_ping_interval(mut self, interval: Duration) -> Self {
        self.peer_ping_interval = interval;
        self
    }

    pub fn latency_sample_size(mut self, size: usize) -> Self {
        self.latency_sample_size = size;
        self
    }

    pub fn randomizer(mut self, randomizer: Arc<dyn Randomizer>) -> Self {
        self.randomizer = randomizer;
        self
    }

    /// Global per-source rate shared by all gateway peers.
    pub fn token_rate_limiting(mut self, rps: f64, burst: usize) -> Self {
        self.token_limiting_rps = rps;
        self.token_limiting_burst = burst;
        self
    }
}

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub(crate) ping_interval: Duration,
    pub(crate) rate_limits: ApiLimiters,
    pub(crate) prefix: Option<String>,
    pub(crate) push_endpoint: String,
    pub(crate) routes: HashMap<i32, Vec<RouteInfo>>,
    pub(crate) versions: HashMap<String, serde_json::Value>,
}

impl Default for NotifierOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            rate_limits: ApiLimiters::new(),
            prefix: None,
            push_endpoint: String::new(),
            routes: HashMap::new(),
            versions: HashMap::new(),
        }
    }
}

impl NotifierOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn announce_rate_limits(mut self, limits: ApiLimiters) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn push_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.push_endpoint = endpoint.into();
        self
    }

    pub fn routes(mut self, routes: HashMap<i32, Vec<RouteInfo>>) -> Self {
        self.routes = routes;
        self
    }

    pub fn versions(mut self, versions: HashMap<String, serde_json::Value>) -> Self {
        self.versions = versions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = UpstreamerOptions::default();
        assert_eq!(opts.latency_sample_size, 20);
        assert_eq!(opts.service_timeout, Duration::from_secs(30));
        assert_eq!(opts.service_timeout_check_interval, Duration::from_secs(5));
        assert_eq!(opts.token_limiting_rps, 500.0);
        assert_eq!(opts.token_limiting_burst, 2000);

        let n = NotifierOptions::default();
        assert_eq!(n.ping_interval, Duration::from_secs(5));
        assert!(n.rate_limits.is_empty());
    }

    #[test]
    fn empty_override_is_ignored() {
        let opts = UpstreamerOptions::new().override_endpoint_address("");
        assert!(opts.override_endpoint_address.is_none());
        let opts = opts.override_endpoint_address("127.0.0.1");
        assert_eq!(opts.override_endpoint_address.as_deref(), Some("127.0.0.1"));
    }
}
