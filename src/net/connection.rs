//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open connections so shutdown can wait for them
//! - Report TCP connection gauges to the metrics manager

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics::MetricsManager;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks open connections for graceful shutdown.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    metrics: Option<Arc<dyn MetricsManager>>,
}

impl ConnectionTracker {
    pub fn new(metrics: Option<Arc<dyn MetricsManager>>) -> Self {
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        if let Some(m) = &self.metrics {
            m.register_tcp_connection();
        }
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            metrics: self.metrics.clone(),
            id: ConnectionId::new(),
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every connection closed. Returns false when `timeout`
    /// elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.active_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    metrics: Option<Arc<dyn MetricsManager>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        if let Some(m) = &self.metrics {
            m.unregister_tcp_connection();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
