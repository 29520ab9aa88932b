//! Per-source in-flight connection limiting.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use parking_lot::Mutex;
use thiserror::Error;

use crate::security::extractors::{ClientIpExtractor, SourceExtractor};

#[derive(Debug, Error)]
pub enum ConnectionLimitError {
    #[error("max connections reached for {0}")]
    Exceeded(String),

    #[error("unable to extract connection source: {0}")]
    Extract(String),
}

/// Counts requests in flight per source.
pub struct ConnectionTracker {
    /// active requests per source: key -> count
    counts: Mutex<HashMap<String, usize>>,
    max_per_source: usize,
    sources: Arc<dyn SourceExtractor>,
}

impl ConnectionTracker {
    /// Sources default to the client IP.
    pub fn new(max_per_source: usize, sources: Option<Arc<dyn SourceExtractor>>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_per_source,
            sources: sources.unwrap_or_else(|| Arc::new(ClientIpExtractor)),
        }
    }

    /// Reserve a slot for the request's source. The slot is released when
    /// the returned guard drops.
    pub fn try_acquire(self: &Arc<Self>, req: &Request<Body>) -> Result<ConnectionSlot, ConnectionLimitError> {
        let key = self
            .sources
            .extract_source(req)
            .map_err(|e| ConnectionLimitError::Extract(e.to_string()))?;

        let mut counts = self.counts.lock();
        let current = counts.entry(key.clone()).or_insert(0);

        if *current >= self.max_per_source {
            tracing::debug!(source = %key, max = self.max_per_source, "Connection limit reached");
            return Err(ConnectionLimitError::Exceeded(key));
        }
        *current += 1;

        Ok(ConnectionSlot {
            tracker: Arc::clone(self),
            key,
        })
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.counts
            .lock()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, key: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(key);
            }
        }
    }
}

/// An occupied connection slot.
pub struct ConnectionSlot {
    tracker: Arc<ConnectionTracker>,
    key: String,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}
