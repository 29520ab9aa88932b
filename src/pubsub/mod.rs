//! Publish/subscribe transport abstraction.
//!
//! # Data Flow
//! ```text
//! Notifier ──publish(ServicePing)──▶ [transport] ──▶ Upstreamer loop
//! Upstreamer ◀──publish(PeerPing)──▶ [transport] ◀──▶ other gateways
//! ```
//!
//! # Design Decisions
//! - Only the abstract client is depended upon; brokers plug in behind
//!   `PubSubClient`
//! - Payloads are JSON encoded into `Publication::data`
//! - Transport failures arrive on a dedicated error channel; one kind
//!   (`InvalidConnection`) is unrecoverable

pub mod local;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalPubSub;

/// Errors produced by a pub/sub client.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("unable to encode publication: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unable to decode publication: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    /// The connection to the broker is gone for good.
    #[error("invalid connection")]
    InvalidConnection,

    #[error("transport error: {0}")]
    Transport(String),
}

impl PubSubError {
    /// Whether a subscriber can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PubSubError::InvalidConnection)
    }
}

/// A message on a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub data: Vec<u8>,
}

impl Publication {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: Vec::new(),
        }
    }

    pub fn encode<T: Serialize>(&mut self, value: &T) -> Result<(), PubSubError> {
        self.data = serde_json::to_vec(value).map_err(PubSubError::Encode)?;
        Ok(())
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PubSubError> {
        serde_json::from_slice(&self.data).map_err(PubSubError::Decode)
    }

    /// Build a publication carrying `value`.
    pub fn with<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, PubSubError> {
        let mut publication = Self::new(topic);
        publication.encode(value)?;
        Ok(publication)
    }
}

/// Stops delivery to a subscription when called or dropped.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Receiving side of a topic subscription.
pub struct Subscription {
    pub publications: mpsc::Receiver<Publication>,
    pub errors: mpsc::Receiver<PubSubError>,
    pub handle: Unsubscribe,
}

/// Abstract broker client.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn publish(&self, publication: Publication) -> Result<(), PubSubError>;

    fn subscribe(&self, topic: &str) -> Subscription;

    async fn connect(&self) -> Result<(), PubSubError>;

    async fn disconnect(&self) -> Result<(), PubSubError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Msg {
        n: u32,
    }

    #[test]
    fn encode_decode() {
        let publication = Publication::with("topic", &Msg { n: 3 }).unwrap();
        assert_eq!(publication.topic, "topic");
        assert_eq!(publication.decode::<Msg>().unwrap(), Msg { n: 3 });
    }

    #[test]
    fn decode_garbage_fails() {
        let publication = Publication {
            topic: "t".into(),
            data: b"nope".to_vec(),
        };
        assert!(matches!(publication.decode::<Msg>(), Err(PubSubError::Decode(_))));
    }

    #[test]
    fn only_invalid_connection_is_fatal() {
        assert!(PubSubError::InvalidConnection.is_fatal());
        assert!(!PubSubError::NotConnected.is_fatal());
        assert!(!PubSubError::Transport("x".into()).is_fatal());
    }

    #[test]
    fn unsubscribe_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = Unsubscribe::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
