//! Push-based service registry and load balancer.
//!
//! # Data Flow
//! ```text
//! service topic ──ServicePing──▶ loop ──▶ Registry ──resync──▶ apis snapshot
//! peer topic    ◀──PeerPing───▶ loop ──▶ PeerState (rate division)
//! request ──path──▶ identity ──▶ apis[identity] ──▶ Balancer ──▶ address
//! response time ──▶ LatencyTable ──▶ Balancer weights
//! ```
//!
//! # Design Decisions
//! - One task owns the registry; the hot path only reads an `Arc` snapshot
//! - Snapshots are replaced wholesale under a write lock, never edited
//! - Latency rings are locked per endpoint address
//! - An unrecoverable transport error ends the loop with that error

pub mod balancer;
pub mod endpoint;
pub mod identity;
pub mod latency;
pub mod moving_average;
pub mod notifier;
pub mod options;
pub mod peers;
pub mod ping;
pub mod randomizer;
pub mod registry;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::pubsub::{PubSubClient, PubSubError, Publication, Subscription};
use crate::routing::upstream::{LatencyCollector, UpstreamError, Upstreamer};
use crate::security::extractors::{ExtractError, RateExtractor};
use crate::upstreamer::balancer::Balancer;
use crate::upstreamer::identity::target_identity;
use crate::upstreamer::latency::LatencyTable;
use crate::upstreamer::peers::{PeerState, PeerTracker};
use crate::upstreamer::ping::{EntityStatus, PeerPing, ServicePing};
use crate::upstreamer::registry::{Registry, RouteTable};

pub use notifier::Notifier;
pub use options::{NotifierOptions, UpstreamerOptions};

/// Why the registry loop ended on its own.
#[derive(Debug, Error)]
pub enum RegistryExit {
    #[error("registry loop failed: {0}")]
    Failed(#[from] PubSubError),
    #[error("registry loop panicked: {0}")]
    Panicked(#[from] JoinError),
}

/// Flatten the joined registry task. Anything but a clean stop is fatal to
/// the process.
pub fn registry_exit(joined: Result<Result<(), PubSubError>, JoinError>) -> Result<(), RegistryExit> {
    joined??;
    Ok(())
}

/// Service registry fed by pub/sub announcements.
pub struct PushUpstreamer {
    pubsub: Arc<dyn PubSubClient>,
    service_topic: String,
    peer_topic: String,
    apis: RwLock<Arc<RouteTable>>,
    latencies: LatencyTable,
    peers: Arc<PeerState>,
    options: UpstreamerOptions,
}

impl PushUpstreamer {
    pub fn new(
        pubsub: Arc<dyn PubSubClient>,
        service_topic: impl Into<String>,
        peer_topic: impl Into<String>,
        options: UpstreamerOptions,
    ) -> Self {
        Self {
            pubsub,
            service_topic: service_topic.into(),
            peer_topic: peer_topic.into(),
            apis: RwLock::new(Arc::new(RouteTable::new())),
            latencies: LatencyTable::new(options.latency_sample_size),
            peers: Arc::new(PeerState::new()),
            options,
        }
    }

    /// Current route table snapshot.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.apis.read().clone()
    }

    pub fn peer_state(&self) -> &PeerState {
        &self.peers
    }

    pub fn latencies(&self) -> &LatencyTable {
        &self.latencies
    }

    /// Subscribe to both topics and spawn the registry loop.
    ///
    /// The returned receiver resolves once every required service said
    /// hello (immediately when none are required). The task resolves when
    /// `shutdown` fires, or with the error that made the transport unusable.
    pub fn start(
        self: &Arc<Self>,
        shutdown: broadcast::Receiver<()>,
    ) -> (oneshot::Receiver<()>, JoinHandle<Result<(), PubSubError>>) {
        let (ready_tx, ready_rx) = oneshot::channel();

        let services = self.pubsub.subscribe(&self.service_topic);
        let peers = self.pubsub.subscribe(&self.peer_topic);
        let readiness = Readiness::new(&self.options.required_services, ready_tx);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(services, peers, readiness, shutdown).await });

        (ready_rx, handle)
    }

    async fn run(
        self: Arc<Self>,
        mut services: Subscription,
        mut peer_pings: Subscription,
        mut readiness: Readiness,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), PubSubError> {
        let mut registry = Registry::new();
        let mut tracker = PeerTracker::new(self.peers.clone());

        let mut sweep = ticker(self.options.service_timeout_check_interval);
        let mut peer_sweep = ticker(self.options.peer_timeout_check_interval);
        let mut peer_hello = ticker(self.options.peer_ping_interval);

        tracing::info!(
            service_topic = %self.service_topic,
            peer_topic = %self.peer_topic,
            runtime_id = %tracker.runtime_id(),
            "Upstreamer started"
        );

        loop {
            tokio::select! {
                Some(publication) = services.publications.recv() => {
                    let ping = match publication.decode::<ServicePing>() {
                        Ok(ping) => ping,
                        Err(e) => {
                            tracing::error!(error = %e, "Unable to decode service ping");
                            continue;
                        }
                    };
                    self.handle_service_ping(&mut registry, &mut readiness, ping);
                }

                Some(err) = services.errors.recv() => {
                    if err.is_fatal() {
                        tracing::error!(error = %err, "Unrecoverable error from services channel");
                        return Err(err);
                    }
                    tracing::error!(error = %err, "Received error from services channel");
                }

                Some(publication) = peer_pings.publications.recv() => {
                    match publication.decode::<PeerPing>() {
                        Ok(ping) => {
                            if tracker.handle(ping) {
                                tracing::debug!(peers = self.peers.peers(), "Gateway peers changed");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "Unable to decode peer ping"),
                    }
                }

                Some(err) = peer_pings.errors.recv() => {
                    if err.is_fatal() {
                        tracing::error!(error = %err, "Unrecoverable error from peers channel");
                        return Err(err);
                    }
                    tracing::error!(error = %err, "Received error from peers channel");
                }

                _ = sweep.tick() => {
                    self.evict_outdated(&mut registry);
                }

                _ = peer_sweep.tick() => {
                    let dropped = tracker.sweep(self.options.peer_timeout);
                    if dropped > 0 {
                        tracing::debug!(dropped, peers = self.peers.peers(), "Dropped silent gateway peers");
                    }
                }

                _ = peer_hello.tick() => {
                    self.publish_peer(tracker.hello()).await;
                }

                _ = shutdown.recv() => {
                    self.publish_peer(tracker.goodbye()).await;
                    tracing::info!("Upstreamer stopped");
                    return Ok(());
                }
            }
        }
    }

    fn handle_service_ping(&self, registry: &mut Registry, readiness: &mut Readiness, mut ping: ServicePing) {
        if let Some(host) = &self.options.override_endpoint_address {
            if let Some((_, port)) = ping.endpoint.rsplit_once(':') {
                ping.endpoint = format!("{}:{}", host, port);
            }
        }

        match ping.status {
            EntityStatus::Hello => {
                if registry.handle_add(&ping) {
                    self.resync(registry);
                    tracing::debug!(name = %ping.name, backend = %ping.endpoint, "Handled service hello");
                }
                readiness.seen(&ping.name);
            }
            EntityStatus::Goodbye => {
                if registry.handle_remove(&ping.service_key(), &ping.endpoint) {
                    self.resync(registry);
                    self.latencies.remove(&ping.endpoint);
                    tracing::debug!(name = %ping.name, backend = %ping.endpoint, "Handled service goodbye");
                }
            }
        }
    }

    fn evict_outdated(&self, registry: &mut Registry) {
        let since = Instant::now()
            .checked_sub(self.options.service_timeout)
            .unwrap_or_else(Instant::now);

        let evicted = registry.evict_outdated(since);
        if evicted.is_empty() {
            return;
        }

        for (service, backend) in &evicted {
            self.latencies.remove(backend);
            tracing::info!(name = %service, backend = %backend, "Handled outdated service");
        }
        self.resync(registry);
    }

    fn resync(&self, registry: &Registry) {
        let apis = registry.resync_routes(self.options.expose_private_apis, &self.options.event_apis);
        *self.apis.write() = Arc::new(apis);
    }

    async fn publish_peer(&self, ping: PeerPing) {
        let publication = match Publication::with(&self.peer_topic, &ping) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Unable to encode peer ping");
                return;
            }
        };

        if let Err(e) = self.pubsub.publish(publication).await {
            tracing::error!(error = %e, status = ?ping.status, "Unable to publish peer ping");
        }
    }
}

impl Upstreamer for PushUpstreamer {
    fn upstream(&self, req: &Request<Body>) -> Result<Option<String>, UpstreamError> {
        let identity = target_identity(req.uri().path());
        let apis = self.routes();

        let Some(candidates) = apis.get(&identity) else {
            return Ok(None);
        };

        Balancer {
            latencies: &self.latencies,
            randomizer: self.options.randomizer.as_ref(),
            peers: &self.peers,
        }
        .select(&identity, candidates)
    }

    fn latency_collector(self: Arc<Self>) -> Option<Arc<dyn LatencyCollector>> {
        Some(self)
    }
}

impl LatencyCollector for PushUpstreamer {
    fn collect_latency(&self, address: &str, elapsed: Duration) {
        self.latencies.collect(address, elapsed);
    }
}

impl RateExtractor for PushUpstreamer {
    fn extract_rates(&self, _req: &Request<Body>) -> Result<(f64, usize), ExtractError> {
        let rates = self
            .peers
            .rates(self.options.token_limiting_rps, self.options.token_limiting_burst);
        Ok((rates.limit, rates.burst))
    }
}

/// Fires a oneshot once every required service has been seen.
struct Readiness {
    pending: HashSet<String>,
    signal: Option<oneshot::Sender<()>>,
}

impl Readiness {
    fn new(required: &[String], signal: oneshot::Sender<()>) -> Self {
        let mut readiness = Self {
            pending: required.iter().cloned().collect(),
            signal: Some(signal),
        };
        readiness.check();
        readiness
    }

    fn seen(&mut self, name: &str) {
        if self.signal.is_some() && self.pending.remove(name) {
            self.check();
        }
    }

    fn check(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        if let Some(signal) = self.signal.take() {
            tracing::info!("All required services are ready");
            let _ = signal.send(());
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
