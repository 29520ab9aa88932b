//! Service-side announcer: periodic hello pings with the process load, and
//! a goodbye when stopping.

use std::num::NonZeroUsize;
use std::sync::Arc;

use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pubsub::{PubSubClient, PubSubError, Publication};
use crate::upstreamer::moving_average::MovingAverage;
use crate::upstreamer::options::NotifierOptions;
use crate::upstreamer::ping::ServicePing;

const LOAD_SAMPLES: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Announces one service instance on the service topic.
pub struct Notifier {
    pubsub: Arc<dyn PubSubClient>,
    topic: String,
    service_name: String,
    endpoint: String,
    options: NotifierOptions,
}

impl Notifier {
    pub fn new(
        pubsub: Arc<dyn PubSubClient>,
        topic: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        options: NotifierOptions,
    ) -> Self {
        Self {
            pubsub,
            topic: topic.into(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            options,
        }
    }

    fn hello(&self) -> ServicePing {
        let mut ping = ServicePing::hello(&self.service_name, &self.endpoint);
        ping.push_endpoint = self.options.push_endpoint.clone();
        ping.routes = self.options.routes.clone();
        ping.versions = self.options.versions.clone();
        ping.prefix = self.options.prefix.clone();
        if !self.options.rate_limits.is_empty() {
            ping.api_limiters = Some(self.options.rate_limits.clone());
        }
        ping
    }

    /// Publish the first hello, then keep announcing every ping interval
    /// until `shutdown` fires.
    ///
    /// Failing to publish the first hello is returned; later failures are
    /// only logged.
    pub async fn start(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, PubSubError> {
        let mut probe = LoadProbe::new();
        let mut ping = self.hello();
        ping.load = probe.sample();

        self.pubsub.publish(Publication::with(&self.topic, &ping)?).await?;
        tracing::info!(name = %self.service_name, endpoint = %self.endpoint, "Service announced");

        let pubsub = self.pubsub.clone();
        let topic = self.topic.clone();
        let period = self.options.ping_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        ping.load = probe.sample();

                        let publication = match Publication::with(&topic, &ping) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::error!(error = %e, "Unable to encode service ping");
                                continue;
                            }
                        };

                        if let Err(e) = pubsub.publish(publication).await {
                            tracing::error!(error = %e, name = %ping.name, "Unable to send hello ping");
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        });

        Ok(handle)
    }

    /// Publish the goodbye ping. The transport itself is left connected
    /// since it may be shared.
    pub async fn stop(&self) -> Result<(), PubSubError> {
        let mut ping = ServicePing::goodbye(&self.service_name, &self.endpoint);
        ping.prefix = self.options.prefix.clone();

        self.pubsub.publish(Publication::with(&self.topic, &ping)?).await?;
        tracing::info!(name = %self.service_name, endpoint = %self.endpoint, "Service retired");
        Ok(())
    }
}

/// Machine CPU usage (0-100, averaged over cores) smoothed over the last
/// few samples.
struct LoadProbe {
    system: System,
    average: MovingAverage,
}

impl LoadProbe {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            average: MovingAverage::with_capacity(LOAD_SAMPLES),
        }
    }

    fn sample(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        let current = f64::from(self.system.global_cpu_usage());
        self.average.insert(current);
        self.average.average().unwrap_or(current)
    }
}
