//! In-process pub/sub, used by the binary for statically declared services
//! and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::pubsub::{PubSubClient, PubSubError, Publication, Subscription, Unsubscribe};

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    publications: mpsc::Sender<Publication>,
    errors: mpsc::Sender<PubSubError>,
}

type Topics = RwLock<HashMap<String, Vec<Subscriber>>>;

/// Fan-out to every subscriber of a topic within this process.
#[derive(Clone)]
pub struct LocalPubSub {
    topics: Arc<Topics>,
    next_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Deliver a transport error to every subscriber of `topic`.
    pub async fn inject_error(&self, topic: &str, make: impl Fn() -> PubSubError) {
        let subscribers = self.subscribers(topic);
        for sub in subscribers {
            let _ = sub.errors.send(make()).await;
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    fn subscribers(&self, topic: &str) -> Vec<Subscriber> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    fn remove(topics: &Weak<Topics>, topic: &str, id: u64) {
        let Some(topics) = topics.upgrade() else {
            return;
        };
        let mut topics = topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl PubSubClient for LocalPubSub {
    async fn publish(&self, publication: Publication) -> Result<(), PubSubError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(PubSubError::NotConnected);
        }

        for sub in self.subscribers(&publication.topic) {
            if sub.publications.send(publication.clone()).await.is_err() {
                tracing::trace!(topic = %publication.topic, subscriber = sub.id, "Dropping closed subscriber");
                Self::remove(&Arc::downgrade(&self.topics), &publication.topic, sub.id);
            }
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (pub_tx, pub_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                publications: pub_tx,
                errors: err_tx,
            });

        let topics = Arc::downgrade(&self.topics);
        let topic = topic.to_string();

        Subscription {
            publications: pub_rx,
            errors: err_rx,
            handle: Unsubscribe::new(move || Self::remove(&topics, &topic, id)),
        }
    }

    async fn connect(&self) -> Result<(), PubSubError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}
