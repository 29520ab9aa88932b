//! Gateway peer discovery.
//!
//! Every gateway announces itself on a peer topic. The number of live peers
//! is used to split global and announced rate limits so that N gateways
//! together enforce the configured rate instead of N times it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::upstreamer::ping::{EntityStatus, PeerPing};

/// Rate and burst for the per-source limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSet {
    pub limit: f64,
    pub burst: usize,
}

/// Peer count shared between the upstreamer loop and request handlers.
#[derive(Debug, Default)]
pub struct PeerState {
    peers: AtomicUsize,
    last_change: Mutex<Option<Instant>>,
    rates: ArcSwapOption<RateSet>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live gateways, this one included.
    pub fn gateways(&self) -> usize {
        self.peers.load(Ordering::Acquire) + 1
    }

    pub fn peers(&self) -> usize {
        self.peers.load(Ordering::Acquire)
    }

    pub fn last_change(&self) -> Option<Instant> {
        *self.last_change.lock()
    }

    fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::Release);
        *self.last_change.lock() = Some(Instant::now());
        self.rates.store(None);
    }

    /// `limit`/`burst` divided by the live gateway count, cached until the
    /// peer set changes.
    pub fn rates(&self, limit: f64, burst: usize) -> RateSet {
        if let Some(rates) = self.rates.load_full() {
            return *rates;
        }

        let gateways = self.gateways();
        let rates = RateSet {
            limit: limit / gateways as f64,
            burst: burst / gateways,
        };
        self.rates.store(Some(Arc::new(rates)));
        rates
    }
}

/// Loop-owned bookkeeping of which peers were heard from and when.
#[derive(Debug)]
pub struct PeerTracker {
    runtime_id: String,
    seen: HashMap<String, Instant>,
    state: Arc<PeerState>,
}

impl PeerTracker {
    pub fn new(state: Arc<PeerState>) -> Self {
        Self {
            runtime_id: uuid::Uuid::new_v4().to_string(),
            seen: HashMap::new(),
            state,
        }
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn hello(&self) -> PeerPing {
        PeerPing {
            runtime_id: self.runtime_id.clone(),
            status: EntityStatus::Hello,
        }
    }

    pub fn goodbye(&self) -> PeerPing {
        PeerPing {
            runtime_id: self.runtime_id.clone(),
            status: EntityStatus::Goodbye,
        }
    }

    /// Apply a peer ping. Returns `true` when the peer count changed.
    pub fn handle(&mut self, ping: PeerPing) -> bool {
        if ping.runtime_id == self.runtime_id {
            return false;
        }

        let changed = match ping.status {
            EntityStatus::Hello => self.seen.insert(ping.runtime_id, Instant::now()).is_none(),
            EntityStatus::Goodbye => self.seen.remove(&ping.runtime_id).is_some(),
        };

        if changed {
            self.state.set_peers(self.seen.len());
        }
        changed
    }

    /// Forget peers not heard from within `timeout`. Returns how many were
    /// dropped.
    pub fn sweep(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) <= timeout);

        let dropped = before - self.seen.len();
        if dropped > 0 {
            self.state.set_peers(self.seen.len());
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, status: EntityStatus) -> PeerPing {
        PeerPing {
            runtime_id: id.into(),
            status,
        }
    }

    #[test]
    fn ignores_own_pings() {
        let state = Arc::new(PeerState::new());
        let mut tracker = PeerTracker::new(state.clone());
        let own = tracker.hello();
        assert!(!tracker.handle(own));
        assert_eq!(state.gateways(), 1);
    }

    #[test]
    fn hello_and_goodbye_update_count() {
        let state = Arc::new(PeerState::new());
        let mut tracker = PeerTracker::new(state.clone());

        assert!(tracker.handle(peer("a", EntityStatus::Hello)));
        assert!(!tracker.handle(peer("a", EntityStatus::Hello)));
        assert!(tracker.handle(peer("b", EntityStatus::Hello)));
        assert_eq!(state.gateways(), 3);
        assert!(state.last_change().is_some());

        assert!(tracker.handle(peer("a", EntityStatus::Goodbye)));
        assert!(!tracker.handle(peer("zz", EntityStatus::Goodbye)));
        assert_eq!(state.peers(), 1);
    }

    #[test]
    fn rates_are_split_and_invalidated() {
        let state = Arc::new(PeerState::new());
        let mut tracker = PeerTracker::new(state.clone());

        assert_eq!(state.rates(500.0, 2000), RateSet { limit: 500.0, burst: 2000 });

        tracker.handle(peer("a", EntityStatus::Hello));
        assert_eq!(state.rates(500.0, 2000), RateSet { limit: 250.0, burst: 1000 });
    }

    #[test]
    fn sweep_drops_silent_peers() {
        let state = Arc::new(PeerState::new());
        let mut tracker = PeerTracker::new(state.clone());
        tracker.handle(peer("a", EntityStatus::Hello));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.sweep(Duration::from_millis(5)), 1);
        assert_eq!(state.gateways(), 1);
        assert_eq!(tracker.sweep(Duration::from_millis(5)), 0);
    }
}
