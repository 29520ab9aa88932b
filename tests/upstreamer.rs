//! Registry and balancing over the in-process pub/sub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};

use push_gateway::lifecycle::Shutdown;
use push_gateway::pubsub::local::LocalPubSub;
use push_gateway::pubsub::{PubSubClient, PubSubError, Publication};
use push_gateway::routing::{LatencyCollector, Upstreamer};
use push_gateway::upstreamer::ping::{RouteInfo, ServicePing};
use push_gateway::upstreamer::{
    registry_exit, Notifier, NotifierOptions, PushUpstreamer, RegistryExit, UpstreamerOptions,
};

mod common;

const SERVICES: &str = "services";
const PEERS: &str = "gateways";

fn upstreamer(pubsub: &LocalPubSub, options: UpstreamerOptions) -> Arc<PushUpstreamer> {
    Arc::new(PushUpstreamer::new(Arc::new(pubsub.clone()), SERVICES, PEERS, options))
}

fn routes(identity: &str) -> HashMap<i32, Vec<RouteInfo>> {
    HashMap::from([(
        1,
        vec![RouteInfo {
            identity: identity.to_string(),
            url: format!("/v/1/{}", identity),
            verbs: vec!["GET".into()],
            private: false,
        }],
    )])
}

fn hello(name: &str, endpoint: &str, load: f64) -> ServicePing {
    let mut ping = ServicePing::hello(name, endpoint);
    ping.routes = routes(name);
    ping.load = load;
    ping
}

async fn announce(pubsub: &LocalPubSub, ping: &ServicePing) {
    pubsub.publish(Publication::with(SERVICES, ping).unwrap()).await.unwrap();
}

fn request(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

/// Poll until `f` holds or two seconds passed.
async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn endpoint_count(u: &PushUpstreamer, key: &str) -> usize {
    u.routes().get(key).map_or(0, Vec::len)
}

#[tokio::test]
async fn hello_and_goodbye_update_routes() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(shutdown.subscribe());

    announce(&pubsub, &hello("users", "127.0.0.1:4001", 0.1)).await;
    announce(&pubsub, &hello("users", "127.0.0.1:4001", 0.2)).await;
    assert!(eventually(|| endpoint_count(&u, "users") == 1).await);

    assert_eq!(u.upstream(&request("/v/1/users/42")).unwrap().as_deref(), Some("127.0.0.1:4001"));
    assert_eq!(u.upstream(&request("/groups")).unwrap(), None);

    announce(&pubsub, &ServicePing::goodbye("users", "127.0.0.1:4001")).await;
    assert!(eventually(|| u.routes().is_empty()).await);
    assert_eq!(u.upstream(&request("/users")).unwrap(), None);

    shutdown.trigger();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn silent_services_are_evicted() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let options = UpstreamerOptions::new().service_timeout(Duration::from_millis(300), Duration::from_millis(30));
    let u = upstreamer(&pubsub, options);
    let (_ready, task) = u.start(shutdown.subscribe());

    announce(&pubsub, &hello("users", "127.0.0.1:4001", 0.1)).await;
    assert!(eventually(|| endpoint_count(&u, "users") == 1).await);
    u.collect_latency("127.0.0.1:4001", Duration::from_millis(3));
    assert!(u.latencies().contains("127.0.0.1:4001"));

    assert!(eventually(|| u.routes().is_empty()).await);
    // the sweep drops the latency ring along with the endpoint
    assert!(eventually(|| !u.latencies().contains("127.0.0.1:4001")).await);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn readiness_waits_for_required_services() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let options = UpstreamerOptions::new().required_services(vec!["users".into(), "groups".into()]);
    let u = upstreamer(&pubsub, options);
    let (mut ready, task) = u.start(shutdown.subscribe());

    announce(&pubsub, &hello("users", "127.0.0.1:4001", 0.1)).await;
    assert!(eventually(|| endpoint_count(&u, "users") == 1).await);
    assert!(ready.try_recv().is_err());

    announce(&pubsub, &hello("groups", "127.0.0.1:4002", 0.1)).await;
    tokio::time::timeout(Duration::from_secs(2), ready).await.unwrap().unwrap();

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn prefixed_services_are_namespaced() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(shutdown.subscribe());

    let mut ping = hello("users", "127.0.0.1:4001", 0.1);
    ping.prefix = Some("acme".into());
    announce(&pubsub, &ping).await;

    assert!(eventually(|| endpoint_count(&u, "acme/users") == 1).await);
    assert_eq!(u.upstream(&request("/_acme/users/7")).unwrap().as_deref(), Some("127.0.0.1:4001"));
    assert_eq!(u.upstream(&request("/users/7")).unwrap(), None);

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn fatal_transport_error_ends_the_loop() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(shutdown.subscribe());

    assert!(eventually(|| pubsub.subscriber_count(SERVICES) == 1).await);
    pubsub.inject_error(SERVICES, || PubSubError::Transport("flaky".into())).await;
    pubsub.inject_error(SERVICES, || PubSubError::InvalidConnection).await;

    let joined = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
    assert!(matches!(
        registry_exit(joined),
        Err(RegistryExit::Failed(PubSubError::InvalidConnection))
    ));
}

async fn crashing_loop() -> Result<(), PubSubError> {
    panic!("registry crashed")
}

#[tokio::test]
async fn clean_registry_stop_is_not_fatal() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(shutdown.subscribe());

    shutdown.trigger();
    assert!(registry_exit(task.await).is_ok());

    let joined = tokio::spawn(crashing_loop()).await;
    assert!(matches!(registry_exit(joined), Err(RegistryExit::Panicked(_))));
}

#[tokio::test]
async fn lighter_endpoints_get_more_traffic() {
    let pubsub = LocalPubSub::new();
    let shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(shutdown.subscribe());

    announce(&pubsub, &hello("users", "127.0.0.1:4001", 10.0)).await;
    announce(&pubsub, &hello("users", "127.0.0.1:4002", 10.0)).await;
    announce(&pubsub, &hello("users", "127.0.0.1:4003", 81.0)).await;
    assert!(eventually(|| endpoint_count(&u, "users") == 3).await);

    let mut counts: HashMap<String, usize> = HashMap::new();
    let req = request("/users");
    for _ in 0..2000 {
        let address = u.upstream(&req).unwrap().unwrap();
        *counts.entry(address).or_default() += 1;
    }

    let a = counts.get("127.0.0.1:4001").copied().unwrap_or(0);
    let b = counts.get("127.0.0.1:4002").copied().unwrap_or(0);
    let heavy = counts.get("127.0.0.1:4003").copied().unwrap_or(0);

    assert_eq!(a + b + heavy, 2000);
    assert!(a.abs_diff(b) < 200, "light endpoints should share evenly: {a} vs {b}");
    assert!(heavy < a / 2 && heavy < b / 2, "heavy endpoint got {heavy} of 2000");

    shutdown.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn notified_service_is_reachable_through_gateway() {
    let backend = common::start_mock_backend("from users").await;

    let pubsub = LocalPubSub::new();
    let registry_shutdown = Shutdown::new();
    let u = upstreamer(&pubsub, UpstreamerOptions::new());
    let (_ready, task) = u.start(registry_shutdown.subscribe());

    let notifier = Notifier::new(
        Arc::new(pubsub.clone()),
        SERVICES,
        "users",
        backend.to_string(),
        NotifierOptions::new().routes(routes("users")),
    );
    let notifier_shutdown = Shutdown::new();
    let pinger = notifier.start(notifier_shutdown.subscribe()).await.unwrap();
    assert!(eventually(|| endpoint_count(&u, "users") == 1).await);

    let (_gateway, running) = common::start_gateway(Arc::clone(&u), common::options()).await;
    let client = common::client();

    let resp = client.get(common::url(&running, "/v/1/users/1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "from users");

    notifier_shutdown.trigger();
    pinger.await.unwrap();
    notifier.stop().await.unwrap();
    assert!(eventually(|| u.routes().is_empty()).await);

    let resp = client.get(common::url(&running, "/v/1/users/1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    running.stop().await;
    registry_shutdown.trigger();
    task.await.unwrap().unwrap();
}
