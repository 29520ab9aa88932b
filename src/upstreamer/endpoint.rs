//! One running instance of a backend service.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::security::token_bucket::TokenBucket;
use crate::upstreamer::ping::{ApiLimiter, ApiLimiters};

/// Live token bucket built from a limit announced by the instance.
#[derive(Debug)]
pub struct AnnouncedLimiter {
    pub announced: ApiLimiter,
    pub bucket: Mutex<TokenBucket>,
}

impl AnnouncedLimiter {
    fn new(announced: ApiLimiter) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(announced.limit, announced.burst)),
            announced,
        }
    }

    /// Share the announced rate between `gateways` instances.
    pub fn divide(&self, gateways: usize) {
        let gateways = gateways.max(1);
        let mut bucket = self.bucket.lock();
        bucket.set_burst(self.announced.burst / gateways);
        bucket.set_rate(self.announced.limit / gateways as f64);
    }

    pub fn allow(&self) -> bool {
        self.bucket.lock().try_acquire()
    }
}

/// Upper bound for an announced load; two of them still sum to a finite weight.
const MAX_LOAD: f64 = f64::MAX / 4.0;

/// Announced loads come off the wire: NaN and negatives count as idle,
/// anything larger than [`MAX_LOAD`] is capped.
fn sanitize_load(load: f64) -> f64 {
    if load.is_nan() || load < 0.0 {
        0.0
    } else {
        load.min(MAX_LOAD)
    }
}

#[derive(Debug, Clone)]
struct EndpointState {
    last_seen: Instant,
    frequency: Duration,
    last_load: f64,
    last_limiter_adjust: Option<Instant>,
}

/// A registered backend instance. Fields that change on every hello sit
/// behind the endpoint's own lock so selection never blocks the registry.
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    limiters: HashMap<String, AnnouncedLimiter>,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, load: f64, limiters: Option<ApiLimiters>) -> Self {
        let limiters = limiters
            .unwrap_or_default()
            .into_iter()
            .map(|(identity, announced)| (identity, AnnouncedLimiter::new(announced)))
            .collect();

        Self {
            address: address.into(),
            limiters,
            state: RwLock::new(EndpointState {
                last_seen: Instant::now(),
                frequency: Duration::ZERO,
                last_load: sanitize_load(load),
                last_limiter_adjust: None,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Refresh liveness and load from a new hello.
    pub fn poke(&self, load: f64) {
        let now = Instant::now();
        let mut state = self.state.write();
        state.frequency = now.saturating_duration_since(state.last_seen);
        state.last_seen = now;
        state.last_load = sanitize_load(load);
    }

    pub fn last_seen(&self) -> Instant {
        self.state.read().last_seen
    }

    pub fn frequency(&self) -> Duration {
        self.state.read().frequency
    }

    pub fn last_load(&self) -> f64 {
        self.state.read().last_load
    }

    pub fn limiter(&self, identity: &str) -> Option<&AnnouncedLimiter> {
        self.limiters.get(identity)
    }

    /// Divide the limiter for `identity` by the live gateway count when the
    /// peer set changed since the last adjustment.
    pub fn adjust_limiter(&self, identity: &str, gateways: usize, peers_changed_at: Option<Instant>) {
        let Some(limiter) = self.limiters.get(identity) else {
            return;
        };
        let Some(changed_at) = peers_changed_at else {
            return;
        };

        {
            let state = self.state.read();
            if matches!(state.last_limiter_adjust, Some(adjusted) if adjusted >= changed_at) {
                return;
            }
        }

        limiter.divide(gateways);
        self.state.write().last_limiter_adjust = Some(changed_at);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut state = self.state.write();
        state.last_seen = state.last_seen.checked_sub(by).unwrap_or(state.last_seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poke_refreshes_load_and_frequency() {
        let ep = Endpoint::new("1.1.1.1:1", 0.5, None);
        let first_seen = ep.last_seen();
        std::thread::sleep(Duration::from_millis(5));

        ep.poke(0.9);
        assert_eq!(ep.last_load(), 0.9);
        assert!(ep.last_seen() > first_seen);
        assert!(ep.frequency() >= Duration::from_millis(5));
    }

    #[test]
    fn wire_loads_are_bounded() {
        let ep = Endpoint::new("1.1.1.1:1", f64::NAN, None);
        assert_eq!(ep.last_load(), 0.0);

        ep.poke(-3.0);
        assert_eq!(ep.last_load(), 0.0);

        ep.poke(f64::INFINITY);
        assert_eq!(ep.last_load(), MAX_LOAD);
        assert!((ep.last_load() * 2.0).is_finite());

        ep.poke(1e308);
        assert_eq!(ep.last_load(), MAX_LOAD);
    }

    #[test]
    fn announced_limiters_are_live() {
        let mut limits = ApiLimiters::new();
        limits.insert("cats".into(), ApiLimiter { limit: 0.0, burst: 1 });
        let ep = Endpoint::new("1.1.1.1:1", 0.0, Some(limits));

        let limiter = ep.limiter("cats").unwrap();
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(ep.limiter("dogs").is_none());
    }

    #[test]
    fn limiter_adjusts_once_per_peer_change() {
        let mut limits = ApiLimiters::new();
        limits.insert("cats".into(), ApiLimiter { limit: 10.0, burst: 10 });
        let ep = Endpoint::new("1.1.1.1:1", 0.0, Some(limits));

        let changed = Instant::now();
        ep.adjust_limiter("cats", 2, Some(changed));
        assert_eq!(ep.limiter("cats").unwrap().bucket.lock().burst(), 5);

        // same change date: no further division
        ep.adjust_limiter("cats", 5, Some(changed));
        assert_eq!(ep.limiter("cats").unwrap().bucket.lock().burst(), 5);
    }
}
