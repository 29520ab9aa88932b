//! In-memory service registry and route table derivation.
//!
//! # Responsibilities
//! - Register, refresh and unregister endpoints from service pings
//! - Drop services once their last endpoint is gone
//! - Rebuild the route table snapshot from the current registry
//!
//! # Design Decisions
//! - Only the upstreamer loop mutates a `Registry`; no internal locking
//! - Endpoints are `Arc`-shared with route snapshots so readers keep a
//!   consistent view while the loop swaps in a new table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::upstreamer::endpoint::Endpoint;
use crate::upstreamer::identity::route_key;
use crate::upstreamer::ping::{ApiLimiters, EntityStatus, RouteInfo, ServicePing};

/// Route key to the endpoints serving it.
pub type RouteTable = HashMap<String, Vec<Arc<Endpoint>>>;

/// A named backend, possibly running as several instances.
#[derive(Debug)]
pub struct Service {
    name: String,
    prefix: Option<String>,
    routes: HashMap<i32, Vec<RouteInfo>>,
    versions: HashMap<String, serde_json::Value>,
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl Service {
    fn new(name: &str, prefix: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            prefix,
            routes: HashMap::new(),
            versions: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn routes(&self) -> &HashMap<i32, Vec<RouteInfo>> {
        &self.routes
    }

    pub fn versions(&self) -> &HashMap<String, serde_json::Value> {
        &self.versions
    }

    pub fn has_endpoint(&self, address: &str) -> bool {
        self.endpoints.contains_key(address)
    }

    pub fn endpoint(&self, address: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(address)
    }

    /// Endpoints ordered by address so rebuilt tables are stable.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut out: Vec<_> = self.endpoints.values().cloned().collect();
        out.sort_by(|a, b| a.address().cmp(b.address()));
        out
    }

    fn register(&mut self, address: &str, load: f64, limiters: Option<ApiLimiters>) {
        self.endpoints
            .insert(address.to_string(), Arc::new(Endpoint::new(address, load, limiters)));
    }

    fn poke(&self, address: &str, load: f64) {
        if let Some(ep) = self.endpoints.get(address) {
            ep.poke(load);
        }
    }

    /// Addresses of endpoints not seen since `since`.
    pub fn outdated_endpoints(&self, since: Instant) -> Vec<String> {
        self.endpoints
            .values()
            .filter(|ep| ep.last_seen() < since)
            .map(|ep| ep.address().to_string())
            .collect()
    }

    fn unregister(&mut self, address: &str) -> bool {
        self.endpoints.remove(address).is_some()
    }
}

/// Service key (namespaced name) to service.
#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<String, Service>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, key: &str) -> Option<&Service> {
        self.services.get(key)
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter()
    }

    /// Register or refresh the endpoint announced by a hello ping.
    ///
    /// Returns `true` only when the endpoint was not known yet. Known
    /// endpoints are always poked.
    pub fn handle_add(&mut self, ping: &ServicePing) -> bool {
        debug_assert_eq!(ping.status, EntityStatus::Hello);

        let service = self
            .services
            .entry(ping.service_key())
            .or_insert_with(|| Service::new(&ping.name, ping.prefix.clone()));

        if service.has_endpoint(&ping.endpoint) {
            service.poke(&ping.endpoint, ping.load);
            return false;
        }

        service.routes = ping.routes.clone();
        service.versions = ping.versions.clone();
        service.register(&ping.endpoint, ping.load, ping.api_limiters.clone());

        true
    }

    /// Unregister the endpoint named by a goodbye ping (or an eviction).
    ///
    /// Returns `false` when the (service, endpoint) pair is unknown.
    pub fn handle_remove(&mut self, service_key: &str, address: &str) -> bool {
        let Some(service) = self.services.get_mut(service_key) else {
            return false;
        };

        if !service.unregister(address) {
            return false;
        }

        if service.endpoints.is_empty() {
            self.services.remove(service_key);
        }

        true
    }

    /// Evict every endpoint last seen before `since`. Returns the
    /// `(service key, address)` pairs removed.
    pub fn evict_outdated(&mut self, since: Instant) -> Vec<(String, String)> {
        let outdated: Vec<(String, String)> = self
            .services
            .iter()
            .flat_map(|(key, srv)| {
                srv.outdated_endpoints(since)
                    .into_iter()
                    .map(move |addr| (key.clone(), addr))
            })
            .collect();

        outdated
            .into_iter()
            .filter(|(key, addr)| self.handle_remove(key, addr))
            .collect()
    }

    /// Build the route table from scratch.
    ///
    /// Private routes are only indexed when `include_private` is set.
    /// `event_apis` maps a service name to an extra key its endpoints serve.
    pub fn resync_routes(
        &self,
        include_private: bool,
        event_apis: &HashMap<String, String>,
    ) -> RouteTable {
        let mut apis = RouteTable::new();

        for service in self.services.values() {
            let endpoints = service.endpoints();

            for routes in service.routes.values() {
                for route in routes {
                    if route.private && !include_private {
                        continue;
                    }
                    apis.insert(route_key(service.prefix(), &route.identity), endpoints.clone());
                }
            }

            if let Some(api) = event_apis.get(&service.name) {
                apis.insert(route_key(service.prefix(), api), endpoints.clone());
            }
        }

        apis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hello(name: &str, ep: &str, identities: &[(&str, bool)]) -> ServicePing {
        let mut ping = ServicePing::hello(name, ep);
        ping.load = 0.1;
        ping.routes.insert(
            0,
            identities
                .iter()
                .map(|(identity, private)| RouteInfo {
                    identity: identity.to_string(),
                    url: format!("/{}", identity),
                    verbs: vec!["GET".into()],
                    private: *private,
                })
                .collect(),
        );
        ping
    }

    #[test]
    fn hello_is_idempotent() {
        let mut registry = Registry::new();
        let ping = hello("srv", "1.1.1.1:1", &[("cats", false)]);

        assert!(registry.handle_add(&ping));
        let seen = registry.service("srv").unwrap().endpoint("1.1.1.1:1").unwrap().last_seen();

        std::thread::sleep(Duration::from_millis(5));
        let mut again = ping.clone();
        again.load = 0.7;
        assert!(!registry.handle_add(&again));

        let srv = registry.service("srv").unwrap();
        assert_eq!(srv.endpoints().len(), 1);
        let ep = srv.endpoint("1.1.1.1:1").unwrap();
        assert!(ep.last_seen() > seen);
        assert_eq!(ep.last_load(), 0.7);
    }

    #[test]
    fn goodbye_for_unknown_pair_is_noop() {
        let mut registry = Registry::new();
        assert!(!registry.handle_remove("srv", "1.1.1.1:1"));

        registry.handle_add(&hello("srv", "1.1.1.1:1", &[("cats", false)]));
        assert!(!registry.handle_remove("srv", "2.2.2.2:2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_services_are_removed() {
        let mut registry = Registry::new();
        registry.handle_add(&hello("srv", "1.1.1.1:1", &[("cats", false)]));
        registry.handle_add(&hello("srv", "2.2.2.2:2", &[("cats", false)]));

        assert!(registry.handle_remove("srv", "1.1.1.1:1"));
        assert_eq!(registry.len(), 1);
        assert!(registry.handle_remove("srv", "2.2.2.2:2"));
        assert!(registry.is_empty());
    }

    #[test]
    fn eviction_removes_stale_endpoints_once() {
        let mut registry = Registry::new();
        registry.handle_add(&hello("srv", "1.1.1.1:1", &[("cats", false)]));
        registry.handle_add(&hello("srv", "2.2.2.2:2", &[("cats", false)]));

        registry
            .service("srv")
            .unwrap()
            .endpoint("1.1.1.1:1")
            .unwrap()
            .backdate(Duration::from_secs(60));

        let since = Instant::now() - Duration::from_secs(30);
        let evicted = registry.evict_outdated(since);
        assert_eq!(evicted, vec![("srv".to_string(), "1.1.1.1:1".to_string())]);
        assert!(registry.evict_outdated(since).is_empty());
        assert_eq!(registry.service("srv").unwrap().endpoints().len(), 1);
    }

    #[test]
    fn private_routes_are_opt_in() {
        let mut registry = Registry::new();
        registry.handle_add(&hello("srv", "1.1.1.1:1", &[("cats", false), ("kittens", true)]));

        let public = registry.resync_routes(false, &HashMap::new());
        assert!(public.contains_key("cats"));
        assert!(!public.contains_key("kittens"));

        let all = registry.resync_routes(true, &HashMap::new());
        assert!(all.contains_key("kittens"));
    }

    #[test]
    fn prefixed_and_event_routes() {
        let mut registry = Registry::new();
        let mut ping = hello("srv", "2.2.2.2:2", &[("cats", false)]);
        ping.prefix = Some("prefix".into());
        registry.handle_add(&ping);
        registry.handle_add(&hello("srv", "1.1.1.1:1", &[("cats", false)]));

        let mut events = HashMap::new();
        events.insert("srv".to_string(), "events".to_string());
        let apis = registry.resync_routes(false, &events);

        assert_eq!(apis["cats"][0].address(), "1.1.1.1:1");
        assert_eq!(apis["prefix/cats"][0].address(), "2.2.2.2:2");
        assert_eq!(apis["events"].len(), 1);
        assert_eq!(apis["prefix/events"].len(), 1);
    }
}
