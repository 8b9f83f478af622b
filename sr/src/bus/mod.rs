//! Event bus - topic-based publish/subscribe between relay sessions and agents
//!
//! Sessions subscribe to their fragment topic before dispatching a command;
//! upstream agents publish fragments back. Payloads are JSON values.

mod memory;

pub use memory::{DEFAULT_CHANNEL_CAPACITY, InMemoryBus};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Topic-based publish/subscribe contract
pub trait EventBus: Send + Sync {
    /// Publish a payload, returning how many subscribers received it
    fn publish(&self, topic: &str, payload: Value) -> usize;

    /// Subscribe to a topic; only payloads published afterwards are received
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Drop a subscription and release the topic when it was the last one
    fn unsubscribe(&self, subscription: Subscription);

    /// Number of live subscribers on a topic
    fn subscriber_count(&self, topic: &str) -> usize;
}

/// A live subscription to one topic
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Value>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, rx: broadcast::Receiver<Value>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next payload
    ///
    /// `RecvError::Lagged(n)` means `n` payloads were overwritten before they
    /// could be read; the subscription stays usable.
    pub async fn recv(&mut self) -> Result<Value, RecvError> {
        self.rx.recv().await
    }
}

/// Topic naming
pub mod topics {
    /// Commands for a destination's upstream agent
    pub fn commands(destination_id: &str) -> String {
        format!("destination_{}_commands", destination_id)
    }

    /// Fragments for one stream
    pub fn stream(destination_id: &str, session_id: &str) -> String {
        format!("stream_{}_{}", destination_id, session_id)
    }

    /// Copy of every frame written downstream for a destination
    pub fn observer(destination_id: &str) -> String {
        format!("observer_{}", destination_id)
    }
}
