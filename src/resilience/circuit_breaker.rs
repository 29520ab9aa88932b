//! Circuit breaker guarding the forwarder.
//!
//! # States
//! - Standby: normal operation, requests pass through
//! - Tripped: the condition held, requests get the fallback response
//! - Recovering: a growing share of requests passes through
//!
//! # State Transitions
//! ```text
//! Standby → Tripped: condition true at a check
//! Tripped → Recovering: after fallback_duration
//! Recovering → Tripped: condition true at a check
//! Recovering → Standby: after recovery_duration
//! ```
//!
//! # Design Decisions
//! - Outcomes feed a rolling window of one-second buckets
//! - The condition is re-evaluated at most once per check period
//! - The window is cleared on every trip so recovery starts fresh

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::resilience::condition::{Condition, ConditionError, WindowMetrics};

const WINDOW_BUCKETS: usize = 10;
const BUCKET_WIDTH: Duration = Duration::from_secs(1);
const MAX_LATENCY_SAMPLES: usize = 1024;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Standby,
    Tripped,
    Recovering,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub fallback_duration: Duration,
    pub recovery_duration: Duration,
    pub check_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fallback_duration: Duration::from_secs(10),
            recovery_duration: Duration::from_secs(10),
            check_period: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    started: Option<Instant>,
    total: u64,
    network_errors: u64,
    codes: HashMap<u16, u64>,
    latencies_ms: Vec<f64>,
}

/// Rolling outcome statistics.
#[derive(Debug)]
struct Window {
    buckets: Vec<Bucket>,
    origin: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            buckets: vec![Bucket::default(); WINDOW_BUCKETS],
            origin: now,
        }
    }

    fn bucket(&mut self, now: Instant) -> &mut Bucket {
        let slot = now.saturating_duration_since(self.origin).as_secs() as usize;
        let start = self.origin + BUCKET_WIDTH * slot as u32;
        let bucket = &mut self.buckets[slot % WINDOW_BUCKETS];
        if bucket.started != Some(start) {
            *bucket = Bucket {
                started: Some(start),
                ..Bucket::default()
            };
        }
        bucket
    }

    fn live(&self, now: Instant) -> impl Iterator<Item = &Bucket> {
        let horizon = BUCKET_WIDTH * WINDOW_BUCKETS as u32;
        self.buckets.iter().filter(move |b| {
            b.started
                .is_some_and(|s| now.saturating_duration_since(s) < horizon)
        })
    }

    fn record(&mut self, now: Instant, status: u16, network_error: bool, elapsed: Duration) {
        let bucket = self.bucket(now);
        bucket.total += 1;
        if network_error {
            bucket.network_errors += 1;
        }
        *bucket.codes.entry(status).or_default() += 1;
        if bucket.latencies_ms.len() < MAX_LATENCY_SAMPLES {
            bucket.latencies_ms.push(elapsed.as_secs_f64() * 1000.0);
        }
    }

    fn snapshot(&self, now: Instant) -> Snapshot {
        let mut snap = Snapshot::default();
        for b in self.live(now) {
            snap.total += b.total;
            snap.network_errors += b.network_errors;
            for (code, n) in &b.codes {
                *snap.codes.entry(*code).or_default() += n;
            }
            snap.latencies_ms.extend_from_slice(&b.latencies_ms);
        }
        snap.latencies_ms.sort_by(|a, b| a.total_cmp(b));
        snap
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    total: u64,
    network_errors: u64,
    codes: HashMap<u16, u64>,
    latencies_ms: Vec<f64>,
}

impl WindowMetrics for Snapshot {
    fn network_error_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.network_errors as f64 / self.total as f64
    }

    fn response_code_ratio(&self, start: u16, end: u16, d_start: u16, d_end: u16) -> f64 {
        let count = |lo: u16, hi: u16| -> u64 {
            self.codes
                .iter()
                .filter(|(code, _)| (lo..hi).contains(*code))
                .map(|(_, n)| n)
                .sum()
        };

        let denominator = count(d_start, d_end);
        if denominator == 0 {
            return 0.0;
        }
        count(start, end) as f64 / denominator as f64
    }

    fn latency_at_quantile_ms(&self, q: f64) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let rank = ((q.clamp(0.0, 100.0) / 100.0) * self.latencies_ms.len() as f64).ceil() as usize;
        self.latencies_ms[rank.saturating_sub(1).min(self.latencies_ms.len() - 1)]
    }
}

struct Inner {
    state: State,
    until: Instant,
    since: Instant,
    last_check: Instant,
    window: Window,
}

/// Trips on a condition over recent outcomes and sheds traffic until the
/// upstream recovers.
pub struct CircuitBreaker {
    condition: Condition,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(expression: &str, config: CircuitBreakerConfig) -> Result<Self, ConditionError> {
        let condition = expression.parse()?;
        let now = Instant::now();

        Ok(Self {
            condition,
            config,
            inner: Mutex::new(Inner {
                state: State::Standby,
                until: now,
                since: now,
                last_check: now,
                window: Window::new(now),
            }),
        })
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Whether the next request may reach the upstream.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now(), rand::random::<f64>())
    }

    fn admit_at(&self, now: Instant, draw: f64) -> bool {
        let mut inner = self.inner.lock();

        if inner.state == State::Tripped && now >= inner.until {
            inner.state = State::Recovering;
            inner.since = now;
            inner.until = now + self.config.recovery_duration;
            tracing::info!("Circuit breaker recovering");
        }

        if inner.state == State::Recovering && now >= inner.until {
            inner.state = State::Standby;
            tracing::info!("Circuit breaker back to standby");
        }

        match inner.state {
            State::Standby => true,
            State::Tripped => false,
            State::Recovering => {
                let total = self.config.recovery_duration.as_secs_f64();
                if total <= 0.0 {
                    return true;
                }
                let share = now.saturating_duration_since(inner.since).as_secs_f64() / total;
                draw < share
            }
        }
    }

    /// Record the outcome of an admitted request.
    pub fn record(&self, status: u16, elapsed: Duration) {
        self.record_at(Instant::now(), status, elapsed);
    }

    fn record_at(&self, now: Instant, status: u16, elapsed: Duration) {
        let network_error = matches!(status, 502 | 504);

        let mut inner = self.inner.lock();
        inner.window.record(now, status, network_error, elapsed);

        if inner.state == State::Tripped {
            return;
        }
        if now.saturating_duration_since(inner.last_check) < self.config.check_period {
            return;
        }
        inner.last_check = now;

        let snapshot = inner.window.snapshot(now);
        if self.condition.evaluate(&snapshot) {
            tracing::warn!(
                requests = snapshot.total,
                network_error_ratio = snapshot.network_error_ratio(),
                "Circuit breaker tripped"
            );
            inner.state = State::Tripped;
            inner.until = now + self.config.fallback_duration;
            inner.window = Window::new(now);
        }
    }
}
