//! push-gateway binary.
//!
//! Loads `gateway.toml`, announces the statically configured services on an
//! in-process pub/sub, and serves traffic until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use push_gateway::config::load_config;
use push_gateway::config::watcher::ConfigWatcher;
use push_gateway::lifecycle::{wait_for_shutdown_signal, Shutdown};
use push_gateway::observability::logging::init_logging;
use push_gateway::observability::metrics::init_metrics;
use push_gateway::pubsub::local::LocalPubSub;
use push_gateway::pubsub::PubSubClient;
use push_gateway::security::extractors::RateExtractor;
use push_gateway::upstreamer::{registry_exit, RegistryExit};
use push_gateway::{Gateway, Notifier, PushUpstreamer};

const READINESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "push-gateway", version, about = "API gateway with push-based service discovery")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    init_logging(config.observability.log_format, &config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "push-gateway starting");

    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let pubsub: Arc<dyn PubSubClient> = Arc::new(LocalPubSub::new());
    pubsub.connect().await?;

    let registry_shutdown = Shutdown::new();
    let upstreamer = Arc::new(PushUpstreamer::new(
        Arc::clone(&pubsub),
        config.pubsub.service_topic.clone(),
        config.pubsub.peer_topic.clone(),
        config.upstreamer_options(),
    ));
    let (ready, mut upstreamer_task) = upstreamer.start(registry_shutdown.subscribe());

    let notifier_shutdown = Shutdown::new();
    let mut notifiers = Vec::with_capacity(config.services.len());
    for svc in &config.services {
        let notifier = Notifier::new(
            Arc::clone(&pubsub),
            config.pubsub.service_topic.clone(),
            svc.name.clone(),
            svc.endpoint.clone(),
            svc.notifier_options(),
        );
        let task = notifier.start(notifier_shutdown.subscribe()).await?;
        notifiers.push((notifier, task));
    }

    if !config.upstreamer.required_services.is_empty() {
        match tokio::time::timeout(READINESS_TIMEOUT, ready).await {
            Ok(Ok(())) => tracing::info!("All required services registered"),
            _ => tracing::warn!(
                required = ?config.upstreamer.required_services,
                "Starting before every required service said hello"
            ),
        }
    }

    // The per-source budget is split across every gateway peer.
    let options = config
        .gateway_options(config.observability.metrics_enabled)?
        .rate_extractor(Arc::clone(&upstreamer) as Arc<dyn RateExtractor>);
    let gateway = Gateway::new(Arc::clone(&upstreamer), options)?;
    let running = gateway.start(&config.listener.bind_address).await?;

    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let _watcher = match watcher.run() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, live reload disabled");
            None
        }
    };

    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);
    let mut registry_done = false;
    let mut failure: Option<RegistryExit> = None;

    loop {
        tokio::select! {
            res = &mut signal => {
                match res {
                    Ok(name) => tracing::info!(signal = name, "Shutdown signal received"),
                    Err(e) => tracing::error!(error = %e, "Unable to listen for signals, shutting down"),
                }
                break;
            }
            Some(update) = updates.recv() => {
                if update.maintenance != gateway.is_maintenance() {
                    gateway.set_maintenance(update.maintenance);
                }
            }
            res = &mut upstreamer_task, if !registry_done => {
                registry_done = true;
                match registry_exit(res) {
                    Ok(()) => tracing::warn!("Upstreamer stopped"),
                    Err(e) => {
                        tracing::error!(error = %e, "Upstreamer failed, shutting down");
                        failure = Some(e);
                    }
                }
                break;
            }
        }
    }

    running.stop().await;

    notifier_shutdown.trigger();
    for (notifier, task) in notifiers {
        let _ = task.await;
        if let Err(e) = notifier.stop().await {
            tracing::error!(error = %e, "Unable to send goodbye ping");
        }
    }

    registry_shutdown.trigger();
    if !registry_done {
        if let Err(e) = registry_exit(upstreamer_task.await) {
            tracing::error!(error = %e, "Upstreamer failed");
            failure = Some(e);
        }
    }

    if let Err(e) = pubsub.disconnect().await {
        tracing::warn!(error = %e, "Unable to disconnect from pub/sub");
    }

    if let Some(e) = failure {
        tracing::error!(error = %e, "Shutdown complete after fatal error");
        return Err(e.into());
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
