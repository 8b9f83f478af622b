//! In-process bus backed by one tokio broadcast channel per topic

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{EventBus, Subscription};

/// Default per-topic capacity (payloads)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process implementation of [`EventBus`]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "InMemoryBus::new: called");
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics with at least one live sender entry
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: Value) -> usize {
        let Ok(topics) = self.topics.lock() else {
            warn!(%topic, "InMemoryBus::publish: topic map poisoned");
            return 0;
        };
        match topics.get(topic) {
            Some(tx) => {
                let delivered = tx.send(payload).unwrap_or(0);
                debug!(%topic, delivered, "InMemoryBus::publish");
                delivered
            }
            None => {
                debug!(%topic, "InMemoryBus::publish: no subscribers");
                0
            }
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        debug!(%topic, "InMemoryBus::subscribe: called");
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription::new(topic, tx.subscribe())
    }

    fn unsubscribe(&self, subscription: Subscription) {
        let topic = subscription.topic.clone();
        debug!(%topic, "InMemoryBus::unsubscribe: called");
        drop(subscription);

        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if topics.get(&topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(&topic);
            debug!(%topic, "InMemoryBus::unsubscribe: topic released");
        }
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .ok()
            .and_then(|t| t.get(topic).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}
