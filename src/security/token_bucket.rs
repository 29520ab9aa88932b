//! Token bucket shared by the accept limiter, the per-source limiter and
//! announced per-endpoint limits.

use std::time::{Duration, Instant};

/// A token bucket refilled continuously at `rate` tokens per second, holding
/// at most `burst` tokens. A fresh bucket starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: usize) -> Self {
        Self {
            tokens: burst as f64,
            rate: rate.max(0.0),
            burst: burst as f64,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_update = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token is available. `None` when the bucket can
    /// never produce one (zero burst or zero rate on an empty bucket).
    pub fn time_until_available(&mut self) -> Option<Duration> {
        self.refill(Instant::now());

        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.burst < 1.0 || self.rate <= 0.0 {
            return None;
        }

        // A rate too small to express as a Duration means never.
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).ok()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> usize {
        self.burst as usize
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.refill(Instant::now());
        self.rate = rate.max(0.0);
    }

    pub fn set_burst(&mut self, burst: usize) {
        self.refill(Instant::now());
        self.burst = burst as f64;
        self.tokens = self.tokens.min(self.burst);
    }
}
