//! Fixed-window rolling mean.
//!
//! # Responsibilities
//! - Keep the N most recent samples in a ring
//! - Refuse to report a value until the ring has been filled once
//!
//! # Design Decisions
//! - Warm-up zeros are never averaged in; callers get `IncompleteSampling`
//!   and fall back to another signal instead

use std::num::NonZeroUsize;

use thiserror::Error;

/// Errors raised by [`MovingAverage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MovingAverageError {
    #[error("sample size must be greater than 0")]
    ZeroCapacity,

    #[error("cannot compute average without a full sampling")]
    IncompleteSampling,
}

/// Ring buffer producing the mean of its last `capacity` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    ring: Vec<f64>,
    next_idx: usize,
    sampling_complete: bool,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Result<Self, MovingAverageError> {
        NonZeroUsize::new(capacity)
            .map(Self::with_capacity)
            .ok_or(MovingAverageError::ZeroCapacity)
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            ring: vec![0.0; capacity.get()],
            next_idx: 0,
            sampling_complete: false,
        }
    }

    pub fn insert(&mut self, value: f64) {
        self.ring[self.next_idx] = value;
        self.next_idx = (self.next_idx + 1) % self.ring.len();
        if self.next_idx == 0 {
            self.sampling_complete = true;
        }
    }

    pub fn average(&self) -> Result<f64, MovingAverageError> {
        if !self.sampling_complete {
            return Err(MovingAverageError::IncompleteSampling);
        }

        let sum: f64 = self.ring.iter().sum();
        Ok(sum / self.ring.len() as f64)
    }

    pub fn is_complete(&self) -> bool {
        self.sampling_complete
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }
}
