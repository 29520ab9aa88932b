//! End-to-end tests of the request pipeline against mock backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;

use push_gateway::http::ServerError;
use push_gateway::routing::{interceptor, Interception, LatencyCollector, StaticUpstreamer, UpstreamError, Upstreamer};

mod common;

const ORIGIN: &str = "https://app.example.com";

async fn error_body(resp: reqwest::Response) -> Value {
    let body: Value = resp.json().await.unwrap();
    body[0].clone()
}

#[tokio::test]
async fn maintenance_locks_everything_but_preflight() {
    let backend = common::start_mock_backend("hello").await;
    let (gateway, running) = common::start_gateway(
        Arc::new(StaticUpstreamer::new(backend.to_string())),
        common::options().maintenance(true),
    )
    .await;
    let client = common::client();

    let resp = client
        .get(common::url(&running, "/users"))
        .header("Origin", ORIGIN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::LOCKED);
    assert_eq!(resp.headers()["access-control-allow-origin"], ORIGIN);
    let err = error_body(resp).await;
    assert_eq!(err["code"], 423);
    assert_eq!(err["title"], "Service Locked");
    assert_eq!(err["subject"], "gateway");

    let resp = client
        .request(reqwest::Method::OPTIONS, common::url(&running, "/users"))
        .header("Origin", ORIGIN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], ORIGIN);
    assert!(resp.headers().contains_key("access-control-allow-methods"));

    gateway.set_maintenance(false);
    let resp = client.get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "hello");

    running.stop().await;
}

#[tokio::test]
async fn forwards_with_forwarding_headers() {
    let backend = common::start_echo_backend().await;
    let (_gateway, running) =
        common::start_gateway(Arc::new(StaticUpstreamer::new(backend.to_string())), common::options()).await;

    let resp = common::client()
        .get(common::url(&running, "/v/1/users?page=2"))
        .header("X-Forwarded-For", "10.9.8.7")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.headers()["x-frame-options"], "DENY");

    let seen = resp.text().await.unwrap().to_ascii_lowercase();
    assert!(seen.starts_with("get /v/1/users?page=2 http/1.1"), "{seen}");
    assert!(seen.contains("x-forwarded-for: 127.0.0.1\r\n"), "{seen}");
    assert!(!seen.contains("10.9.8.7"), "untrusted forward header must be dropped: {seen}");
    assert!(seen.contains("x-forwarded-proto: http"), "{seen}");
    assert!(seen.contains(&format!("x-forwarded-host: {}", running.local_addr())), "{seen}");

    running.stop().await;
}

#[tokio::test]
async fn trusted_forward_header_is_extended() {
    let backend = common::start_echo_backend().await;
    let (_gateway, running) = common::start_gateway(
        Arc::new(StaticUpstreamer::new(backend.to_string())),
        common::options().trust_forward_header(true),
    )
    .await;

    let resp = common::client()
        .get(common::url(&running, "/users"))
        .header("X-Forwarded-For", "10.9.8.7")
        .send()
        .await
        .unwrap();

    let seen = resp.text().await.unwrap().to_ascii_lowercase();
    assert!(seen.contains("x-forwarded-for: 10.9.8.7, 127.0.0.1"), "{seen}");

    running.stop().await;
}

#[tokio::test]
async fn no_upstream_is_503() {
    let (_gateway, running) = common::start_gateway(Arc::new(StaticUpstreamer::empty()), common::options()).await;

    let resp = common::client().get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_body(resp).await["title"], "Service Temporarily Unavailable");

    running.stop().await;
}

struct FailingUpstreamer;

impl Upstreamer for FailingUpstreamer {
    fn upstream(&self, req: &Request<Body>) -> Result<Option<String>, UpstreamError> {
        match req.uri().path() {
            "/busy" => Err(UpstreamError::TooManyRequests),
            _ => Err(UpstreamError::Other("registry exploded".into())),
        }
    }
}

#[tokio::test]
async fn upstreamer_errors_map_to_statuses() {
    let (_gateway, running) = common::start_gateway(Arc::new(FailingUpstreamer), common::options()).await;
    let client = common::client();

    let resp = client.get(common::url(&running, "/busy")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_body(resp).await["title"], "Too Many Requests");

    let resp = client.get(common::url(&running, "/other")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err = error_body(resp).await;
    assert_eq!(err["title"], "Internal Server Error");
    assert_eq!(err["description"], "registry exploded");

    running.stop().await;
}

#[tokio::test]
async fn interceptors_stop_redirect_and_fail() {
    let default_backend = common::start_mock_backend("default").await;
    let direct_backend = common::start_mock_backend("direct").await;
    let direct = direct_backend.to_string();

    let options = common::options()
        .exact_interceptor(
            "/health",
            interceptor(|_req| {
                let resp = Response::builder().status(StatusCode::OK).body(Body::from("ok")).unwrap();
                Ok(Interception::stop(resp))
            }),
        )
        .prefix_interceptor("/direct", interceptor(move |_req| Ok(Interception::forward_direct().to(direct.clone()))))
        .suffix_interceptor(".fail", interceptor(|_req| Err("nope".into())));

    let (_gateway, running) =
        common::start_gateway(Arc::new(StaticUpstreamer::new(default_backend.to_string())), options).await;
    let client = common::client();

    let resp = client
        .get(common::url(&running, "/health"))
        .header("Origin", ORIGIN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], ORIGIN);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = client.get(common::url(&running, "/direct/users")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "direct");

    let resp = client.get(common::url(&running, "/report.fail")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_body(resp).await["description"], "unable to run interceptor: nope");

    let resp = client.get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "default");

    running.stop().await;
}

#[tokio::test]
async fn closed_backend_is_bad_gateway() {
    let backend = common::start_eof_backend().await;
    let (_gateway, running) =
        common::start_gateway(Arc::new(StaticUpstreamer::new(backend.to_string())), common::options()).await;
    let client = common::client();

    let resp = client.get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.text().await.unwrap(),
        r#"[{"code":502,"description":"The requested service is not available. Please try again in a moment.","subject":"gateway","title":"Bad Gateway"}]"#
    );

    let resp = client
        .get(common::url(&running, "/users"))
        .header("Accept", "application/msgpack")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.headers()["content-type"], "application/msgpack");

    running.stop().await;
}

#[tokio::test]
async fn slow_backend_times_out() {
    let backend = common::start_programmable_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        (200, "late".to_string())
    })
    .await;

    let options = common::options().http_timeouts(
        Duration::from_secs(5),
        Duration::from_millis(200),
        Duration::from_secs(5),
        true,
    );
    let (_gateway, running) =
        common::start_gateway(Arc::new(StaticUpstreamer::new(backend.to_string())), options).await;

    let resp = common::client().get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_body(resp).await["title"], "Gateway Timeout");

    running.stop().await;
}

#[tokio::test]
async fn source_rate_limit_rejects_excess() {
    let backend = common::start_mock_backend("ok").await;
    let (_gateway, running) = common::start_gateway(
        Arc::new(StaticUpstreamer::new(backend.to_string())),
        common::options().source_rate_limiting(0.01, 1),
    )
    .await;
    let client = common::client();

    let first = client.get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = client.get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_body(second).await["title"], "Too Many Requests");

    running.stop().await;
}

#[tokio::test]
async fn per_source_connection_limit() {
    let backend = common::start_programmable_backend(|_| async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        (200, "slow".to_string())
    })
    .await;
    let (_gateway, running) = common::start_gateway(
        Arc::new(StaticUpstreamer::new(backend.to_string())),
        common::options().tcp_client_max_connections(1, None),
    )
    .await;
    let client = common::client();

    let url = common::url(&running, "/users");
    let first = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.get(url).send().await.unwrap().status() }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_body(second).await["title"], "Too Many Connections");

    assert_eq!(first.await.unwrap(), StatusCode::OK);

    running.stop().await;
}

#[derive(Default)]
struct RecordingUpstreamer {
    address: String,
    collected: Mutex<Vec<String>>,
}

struct Recorder(Arc<RecordingUpstreamer>);

impl LatencyCollector for Recorder {
    fn collect_latency(&self, address: &str, _elapsed: Duration) {
        self.0.collected.lock().push(address.to_string());
    }
}

impl Upstreamer for RecordingUpstreamer {
    fn upstream(&self, _req: &Request<Body>) -> Result<Option<String>, UpstreamError> {
        Ok(Some(self.address.clone()))
    }

    fn latency_collector(self: Arc<Self>) -> Option<Arc<dyn LatencyCollector>> {
        Some(Arc::new(Recorder(self)))
    }
}

#[tokio::test]
async fn latency_is_fed_back() {
    let backend = common::start_mock_backend("ok").await;
    let upstreamer = Arc::new(RecordingUpstreamer {
        address: backend.to_string(),
        ..Default::default()
    });

    let (_gateway, running) = common::start_gateway(Arc::clone(&upstreamer), common::options()).await;
    let resp = common::client().get(common::url(&running, "/users")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(*upstreamer.collected.lock(), vec![backend.to_string()]);
    running.stop().await;
}

#[tokio::test]
async fn invalid_breaker_expression_is_rejected() {
    let result = push_gateway::Gateway::new(
        Arc::new(StaticUpstreamer::empty()),
        common::options().circuit_breaker("Nope() > 1"),
    );
    assert!(matches!(result, Err(ServerError::CircuitBreaker(_))));
}

#[tokio::test]
async fn stop_drains_and_says_goodbye() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let backend = common::start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            (200, "finished".to_string())
        }
    })
    .await;

    let (_gateway, running) =
        common::start_gateway(Arc::new(StaticUpstreamer::new(backend.to_string())), common::options()).await;
    let url = common::url(&running, "/users");
    let client = common::client();

    let in_flight = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move {
            let resp = client.get(url).send().await.unwrap();
            (resp.status(), resp.text().await.unwrap())
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stopping = tokio::spawn(running.stop());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.text().await.unwrap(),
        r#"[{"code":503,"description":"Shutting down. Please retry your request","subject":"gateway","title":"Service Not Available"}]"#
    );

    assert_eq!(in_flight.await.unwrap(), (StatusCode::OK, "finished".to_string()));
    stopping.await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
