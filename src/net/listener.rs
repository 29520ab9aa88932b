//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Rate limit accepts with a token bucket
//!
//! # Design Decisions
//! - Before each accept, wait at most one second for an accept token; the
//!   connection is still accepted when none came, then closed at once so it
//!   never reaches the HTTP server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::observability::metrics::LimiterMetricManager;
use crate::security::token_bucket::TokenBucket;

/// Longest wait for an accept token.
const ACCEPT_WAIT: Duration = Duration::from_secs(1);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
    /// The connection semaphore was closed.
    #[error("Listener closed")]
    Closed,
}

/// Connections-per-second limit applied before accepting.
pub struct AcceptLimiter {
    bucket: Mutex<TokenBucket>,
    metrics: Option<Arc<dyn LimiterMetricManager>>,
}

impl AcceptLimiter {
    pub fn new(cps: f64, burst: usize, metrics: Option<Arc<dyn LimiterMetricManager>>) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(cps, burst)),
            metrics,
        }
    }

    /// Wait for a token, giving up when it would take longer than `max_wait`.
    pub async fn wait(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            if self.bucket.lock().try_acquire() {
                return true;
            }

            let wait = self.bucket.lock().time_until_available();
            match wait {
                Some(wait) if wait <= deadline.saturating_duration_since(Instant::now()) => {
                    tokio::time::sleep(wait).await
                }
                _ => return false,
            }
        }
    }

    fn report(&self, admitted: bool) {
        if let Some(metrics) = &self.metrics {
            if admitted {
                metrics.register_accepted_connection();
            } else {
                metrics.register_limited_connection();
            }
        }
    }
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    /// Configured maximum connections.
    max_connections: usize,
    accept_limit: Option<AcceptLimiter>,
}

impl Listener {
    /// Bind with connection limits and an optional accept rate limit.
    pub async fn bind(
        addr: &str,
        max_connections: usize,
        accept_limit: Option<AcceptLimiter>,
    ) -> Result<Self, ListenerError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            rate_limited = accept_limit.is_some(),
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            accept_limit,
        })
    }

    /// Accept a new connection, respecting the connection and rate limits.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        loop {
            // Acquire permit first (backpressure)
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ListenerError::Closed)?;

            let admitted = match &self.accept_limit {
                Some(limiter) => limiter.wait(ACCEPT_WAIT).await,
                None => true,
            };

            let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

            if let Some(limiter) = &self.accept_limit {
                limiter.report(admitted);
            }

            if !admitted {
                tracing::debug!(peer_addr = %addr, "Connection rate limit exceeded, closing");
                drop(stream);
                continue;
            }

            tracing::debug!(
                peer_addr = %addr,
                available_permits = self.connection_limit.available_permits(),
                "Connection accepted"
            );

            return Ok((stream, addr, ConnectionPermit { _permit: permit }));
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
