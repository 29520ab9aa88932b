//! Path interceptors.
//!
//! An interceptor sees the request before upstream resolution and decides
//! whether the gateway answers it directly or keeps forwarding, possibly to
//! an upstream of its choosing.
//!
//! # Design Decisions
//! - Tiers are checked exact, then prefix, then suffix
//! - Within a tier, registration order decides; the first match wins
//! - Registering a key again replaces its interceptor in place

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};

use crate::routing::matcher::{ExactPathMatcher, Matcher, PathPrefixMatcher, PathSuffixMatcher};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What the gateway does after an interceptor ran.
#[derive(Debug)]
pub enum InterceptorAction {
    /// Continue through the regular pipeline.
    Forward,
    /// Forward as a WebSocket, bypassing limiters and buffering.
    ForwardWs,
    /// Forward without the limiter chain.
    ForwardDirect,
    /// The interceptor answered; CORS headers are added to this response.
    Stop(Response<Body>),
}

#[derive(Debug)]
pub struct Interception {
    pub action: InterceptorAction,
    /// Overrides upstream resolution when set.
    pub upstream: Option<String>,
}

impl Interception {
    pub fn forward() -> Self {
        Self {
            action: InterceptorAction::Forward,
            upstream: None,
        }
    }

    pub fn forward_ws() -> Self {
        Self {
            action: InterceptorAction::ForwardWs,
            upstream: None,
        }
    }

    pub fn forward_direct() -> Self {
        Self {
            action: InterceptorAction::ForwardDirect,
            upstream: None,
        }
    }

    pub fn stop(response: Response<Body>) -> Self {
        Self {
            action: InterceptorAction::Stop(response),
            upstream: None,
        }
    }

    pub fn to(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }
}

/// Interceptors may modify the request in place.
pub type InterceptorFn = Arc<dyn Fn(&mut Request<Body>) -> Result<Interception, BoxError> + Send + Sync>;

/// Wrap a closure as an [`InterceptorFn`].
pub fn interceptor<F>(f: F) -> InterceptorFn
where
    F: Fn(&mut Request<Body>) -> Result<Interception, BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct Entry {
    key: String,
    matcher: Arc<dyn Matcher>,
    f: InterceptorFn,
}

type Tier = Vec<Entry>;

/// Ordered interceptor registry.
#[derive(Clone, Default)]
pub struct Interceptors {
    tiers: [Arc<Tier>; 3],
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_exact(&mut self, path: impl Into<String>, f: InterceptorFn) {
        let path = path.into();
        self.push(0, path.clone(), Arc::new(ExactPathMatcher::new(path)), f);
    }

    pub fn register_prefix(&mut self, prefix: impl Into<String>, f: InterceptorFn) {
        let prefix = prefix.into();
        self.push(1, prefix.clone(), Arc::new(PathPrefixMatcher::new(prefix)), f);
    }

    pub fn register_suffix(&mut self, suffix: impl Into<String>, f: InterceptorFn) {
        let suffix = suffix.into();
        self.push(2, suffix.clone(), Arc::new(PathSuffixMatcher::new(suffix)), f);
    }

    fn push(&mut self, tier: usize, key: String, matcher: Arc<dyn Matcher>, f: InterceptorFn) {
        let entries = Arc::make_mut(&mut self.tiers[tier]);
        match entries.iter_mut().find(|e| e.key == key) {
            Some(existing) => existing.f = f,
            None => entries.push(Entry { key, matcher, f }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|t| t.is_empty())
    }

    /// Run the first interceptor matching the request path.
    ///
    /// `None` when nothing matched.
    pub fn intercept(&self, req: &mut Request<Body>) -> Option<Result<Interception, BoxError>> {
        let path = req.uri().path().to_string();

        for tier in &self.tiers {
            for entry in tier.iter() {
                if entry.matcher.matches(&path) {
                    tracing::trace!(path = %path, matcher = ?entry.matcher, "Interceptor matched");
                    return Some((entry.f)(req));
                }
            }
        }

        None
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("exact", &self.tiers[0].len())
            .field("prefix", &self.tiers[1].len())
            .field("suffix", &self.tiers[2].len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn req(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn to(upstream: &'static str) -> InterceptorFn {
        interceptor(move |_req| Ok(Interception::forward().to(upstream)))
    }

    #[test]
    fn no_match() {
        let mut interceptors = Interceptors::new();
        interceptors.register_exact("/hello", to("a:1"));
        assert!(interceptors.intercept(&mut req("/other")).is_none());
    }

    #[test]
    fn exact_beats_prefix_beats_suffix() {
        let mut interceptors = Interceptors::new();
        interceptors.register_suffix("/ups", to("suffix:1"));
        interceptors.register_prefix("/ups", to("prefix:1"));
        interceptors.register_exact("/ups", to("exact:1"));

        let hit = interceptors.intercept(&mut req("/ups")).unwrap().unwrap();
        assert_eq!(hit.upstream.as_deref(), Some("exact:1"));

        let hit = interceptors.intercept(&mut req("/ups/x")).unwrap().unwrap();
        assert_eq!(hit.upstream.as_deref(), Some("prefix:1"));

        let hit = interceptors.intercept(&mut req("/a/ups")).unwrap().unwrap();
        assert_eq!(hit.upstream.as_deref(), Some("suffix:1"));
    }

    #[test]
    fn registration_order_within_tier() {
        let mut interceptors = Interceptors::new();
        interceptors.register_prefix("/a", to("first:1"));
        interceptors.register_prefix("/a/b", to("second:1"));

        let hit = interceptors.intercept(&mut req("/a/b/c")).unwrap().unwrap();
        assert_eq!(hit.upstream.as_deref(), Some("first:1"));
    }

    #[test]
    fn reregistering_a_key_replaces_it() {
        let mut interceptors = Interceptors::new();
        interceptors.register_prefix("/a", to("old:1"));
        interceptors.register_prefix("/b", to("other:1"));
        interceptors.register_prefix("/a", to("new:1"));
        interceptors.register_exact("/a", to("exact:1"));

        let hit = interceptors.intercept(&mut req("/a/x")).unwrap().unwrap();
        assert_eq!(hit.upstream.as_deref(), Some("new:1"));
        assert_eq!(interceptors.tiers[1].len(), 2);
        assert_eq!(interceptors.tiers[0].len(), 1);
    }

    #[test]
    fn stop_and_errors_pass_through() {
        let mut interceptors = Interceptors::new();
        interceptors.register_exact(
            "/hello",
            interceptor(|_req| {
                let resp = Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .body(Body::from("hi"))
                    .unwrap();
                Ok(Interception::stop(resp))
            }),
        );
        interceptors.register_prefix("/boom", interceptor(|_req| Err("boom".into())));

        match interceptors.intercept(&mut req("/hello")).unwrap().unwrap().action {
            InterceptorAction::Stop(resp) => assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT),
            other => panic!("unexpected action {:?}", other),
        }

        let err = interceptors.intercept(&mut req("/boom/x")).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn interceptor_can_rewrite_request() {
        let mut interceptors = Interceptors::new();
        interceptors.register_exact(
            "/tag",
            interceptor(|req| {
                req.headers_mut().insert("x-tagged", "1".parse().unwrap());
                Ok(Interception::forward_direct())
            }),
        );

        let mut r = req("/tag");
        let hit = interceptors.intercept(&mut r).unwrap().unwrap();
        assert!(matches!(hit.action, InterceptorAction::ForwardDirect));
        assert_eq!(r.headers()["x-tagged"], "1");

        // registering after a clone leaves the clone untouched
        let snapshot = interceptors.clone();
        interceptors.register_exact("/late", to("late:1"));
        assert!(snapshot.intercept(&mut req("/late")).is_none());
        assert!(interceptors.intercept(&mut req("/late")).is_some());
    }
}
