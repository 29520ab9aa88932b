//! Per-endpoint response time tracking.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::upstreamer::moving_average::MovingAverage;

/// Address to rolling response time (microseconds). Each ring has its own
/// lock so concurrent requests to different endpoints never contend.
#[derive(Debug)]
pub struct LatencyTable {
    samples: DashMap<String, Arc<Mutex<MovingAverage>>>,
    sample_size: NonZeroUsize,
}

impl LatencyTable {
    /// `sample_size` must be non-zero; a zero size is bumped to one.
    pub fn new(sample_size: usize) -> Self {
        Self {
            samples: DashMap::new(),
            sample_size: NonZeroUsize::new(sample_size).unwrap_or(NonZeroUsize::MIN),
        }
    }

    pub fn collect(&self, address: &str, elapsed: Duration) {
        // the shard read guard must be released before taking the entry
        let existing = self.samples.get(address).map(|r| Arc::clone(r.value()));
        let ring = match existing {
            Some(ring) => ring,
            None => Arc::clone(
                self.samples
                    .entry(address.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(MovingAverage::with_capacity(self.sample_size)))
                    })
                    .value(),
            ),
        };

        ring.lock().insert(elapsed.as_micros() as f64);
    }

    /// Average response time once a full window was collected.
    pub fn average(&self, address: &str) -> Option<f64> {
        let ring = self.samples.get(address).map(|r| Arc::clone(r.value()))?;
        let avg = ring.lock().average().ok();
        avg
    }

    pub fn contains(&self, address: &str) -> bool {
        self.samples.contains_key(address)
    }

    pub fn remove(&self, address: &str) {
        self.samples.remove(address);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
